//! # Ring Buffers
//!
//! The multi-producer, single-consumer arena every pipeline is built on, plus
//! [`EventPipeline`], which pairs a ring with either a dedicated processor
//! thread or a caller-driven [`Poller`].

/// Fixed-capacity slot arena and its consumer handle.
pub mod ring_buffer;
/// Ring + consumer thread lifecycle.
pub mod pipeline;
mod wait;

pub use pipeline::{EventHandler, EventPipeline, PipelineError};
pub use ring_buffer::{EventSlot, PollState, Poller, RingBuffer, RingBufferError};
