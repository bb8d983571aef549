//! # lib_cfdp
//!
//! Dispatch core of a CFDP processor. Many concurrent producers (request
//! handlers, a PDU listener, timers) submit work through pre-allocated ring
//! buffers to the single thread that owns the non-thread-safe protocol
//! engine. Every request is correlated with its result through a private
//! one-shot channel, and the whole arrangement can be shut down in bounded
//! time.
//!
//! Start at [`lifecycle::CfdpProcessor`].

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod executor;
pub mod history;
pub mod lifecycle;
pub mod periodic;
pub mod response;
pub mod ring;
pub mod sync;
pub mod translate;
pub mod types;

pub use config::{BackpressurePolicy, ConfigError, ProcessorConfig};
pub use dispatch::{ActionClient, DispatchError, InboundPduPublisher, PduPublishError};
pub use engine::{
    CycleOutcome, EngineCallbacks, EngineError, EngineFactory, EngineRequest, OutboundPduSink, ProtocolEngine,
    PutRequest, RequestScope, TransactionOperation,
};
pub use events::{ActionEvent, InboundPduEvent, PduProvenance};
pub use history::{FinishedTransactionsHistory, TransactionHistory, TransactionOutcome};
pub use lifecycle::{CfdpProcessor, LifecycleError, LifecycleState, ShutdownInterrupt, ShutdownReport};
pub use response::{RequestResult, ResponseError};
pub use translate::{
    GenericActionRequest, IngestActionRequest, PutActionRequest, TransactionActionRequest, TransactionSelector,
};
pub use types::{ActionType, EntityId, IngestSource, RequestId, SequenceRange, TransactionId};
