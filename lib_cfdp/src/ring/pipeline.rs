//! # Event Pipeline
//!
//! Owns one ring and its single consumer. The consumer is either
//!
//! - a dedicated processor thread driving an [`EventHandler`], or
//! - a [`Poller`] handed out to a thread that drives it itself (the cycler).
//!
//! The pipeline also knows how to wind its consumer down with a deadline,
//! which is what the lifecycle orchestrator builds its shutdown stages from.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::ring_buffer::{EventSlot, Poller, RingBuffer, RingBufferError};
use crate::executor::TaskThread;
use crate::sync::{CancelWatch, WaitOutcome};

/// Callbacks run on a pipeline's processor thread.
pub trait EventHandler<E>: Send + 'static {
    /// Runs once on the processor thread before the first event. The token
    /// is cancelled when the pipeline is told to stop.
    fn on_start(&mut self, _cancel: &CancellationToken) {}

    fn on_event(&mut self, event: &mut E, sequence: u64, end_of_batch: bool);

    /// Called for every event still committed after the ring was halted. The
    /// handler must not do the work, only settle the event (e.g. answer it).
    fn on_discard(&mut self, _event: &mut E, _sequence: u64) {}

    fn on_shutdown(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline {name} did not stop within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("shutdown of pipeline {name} was interrupted")]
    Interrupted { name: String },

    #[error("pipeline {name} has no consumer")]
    NoConsumer { name: String },
}

enum Consumer<E: EventSlot> {
    None,
    /// Handler attached, thread not started yet.
    Pending(Poller<E>, Box<dyn EventHandler<E>>),
    Processor(TaskThread),
    /// Consumed by whoever holds the poller.
    External,
}

pub struct EventPipeline<E: EventSlot> {
    name: String,
    ring: Arc<RingBuffer<E>>,
    consumer: Consumer<E>,
}

impl<E: EventSlot> EventPipeline<E> {
    pub fn new(name: &str, capacity: usize) -> Result<Self, RingBufferError> {
        Ok(Self {
            name: name.to_string(),
            ring: Arc::new(RingBuffer::new(capacity)?),
            consumer: Consumer::None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring(&self) -> Arc<RingBuffer<E>> {
        Arc::clone(&self.ring)
    }

    /// Attaches `handler` as the consumer. It runs once [`start`](Self::start) is called.
    pub fn handle_events_with<H>(&mut self, handler: H) -> Result<(), RingBufferError>
    where
        H: EventHandler<E>,
    {
        let poller = self.ring.new_poller()?;
        self.consumer = Consumer::Pending(poller, Box::new(handler));
        Ok(())
    }

    /// Hands the consumer side to the caller instead of a processor thread.
    pub fn new_poller(&mut self) -> Result<Poller<E>, RingBufferError> {
        let poller = self.ring.new_poller()?;
        self.consumer = Consumer::External;
        Ok(poller)
    }

    /// Starts the processor thread, if a handler was attached.
    pub fn start(&mut self, cancel: CancellationToken) -> io::Result<()> {
        let consumer = std::mem::replace(&mut self.consumer, Consumer::None);
        self.consumer = match consumer {
            Consumer::Pending(poller, handler) => {
                let thread_name = format!("{}-processor", self.name);
                Consumer::Processor(TaskThread::spawn(&thread_name, cancel, move |cancel| {
                    run_processor(poller, handler, cancel)
                })?)
            }
            other => other,
        };
        Ok(())
    }

    /// No more publishes; a processor finishes the event in hand and stops.
    pub fn halt(&self) {
        self.ring.halt();
    }

    /// Halts the ring and waits up to `timeout` for the consumer to finish.
    /// A processor pipeline is done when its thread has returned; a poller
    /// pipeline when its ring has been drained.
    pub fn shutdown(&mut self, timeout: Duration, caller: &CancellationToken) -> Result<(), PipelineError> {
        self.halt();
        if matches!(self.consumer, Consumer::External) {
            return self.await_drained(timeout, caller);
        }
        match &mut self.consumer {
            Consumer::Processor(task) => match task.await_termination_or_cancelled(timeout, caller) {
                WaitOutcome::Released => {
                    if !task.join() {
                        tracing::error!(pipeline = %self.name, "processor thread panicked");
                    }
                    Ok(())
                }
                WaitOutcome::TimedOut => Err(PipelineError::Timeout {
                    name: self.name.clone(),
                    timeout,
                }),
                WaitOutcome::Interrupted => Err(PipelineError::Interrupted { name: self.name.clone() }),
            },
            Consumer::External | Consumer::Pending(..) | Consumer::None => {
                if self.ring.is_drained() {
                    Ok(())
                } else {
                    Err(PipelineError::NoConsumer { name: self.name.clone() })
                }
            }
        }
    }

    fn await_drained(&self, timeout: Duration, caller: &CancellationToken) -> Result<(), PipelineError> {
        let deadline = Instant::now() + timeout;
        let mut watch = CancelWatch::new(caller);
        loop {
            if self.ring.is_drained() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::Timeout {
                    name: self.name.clone(),
                    timeout,
                });
            }
            if watch.sleep(Duration::from_millis(1).min(deadline - now)).is_err() {
                return Err(PipelineError::Interrupted { name: self.name.clone() });
            }
        }
    }

    /// Cancels the processor thread without waiting for it.
    pub fn cancel(&self) {
        if let Consumer::Processor(task) = &self.consumer {
            task.cancel();
        }
    }

    /// Cancels and detaches the processor thread, if still running.
    pub fn force_stop(&mut self) {
        self.halt();
        if let Consumer::Processor(task) = &mut self.consumer {
            task.force_stop();
        }
    }
}

fn run_processor<E: EventSlot>(mut poller: Poller<E>, mut handler: Box<dyn EventHandler<E>>, cancel: CancellationToken) {
    handler.on_start(&cancel);
    while !cancel.is_cancelled() {
        if !poller.wait_and_poll(|event, sequence, end_of_batch| handler.on_event(event, sequence, end_of_batch)) {
            break;
        }
    }
    let discarded = poller.drain(|event, sequence| handler.on_discard(event, sequence));
    if discarded > 0 {
        tracing::info!(discarded, "processor discarded events left after halt");
    }
    handler.on_shutdown();
}
