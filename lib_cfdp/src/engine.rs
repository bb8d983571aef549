//! # Protocol Engine Seam
//!
//! The CFDP state machine lives behind [`ProtocolEngine`]. The dispatch core
//! never looks inside it: it hands the engine requests and PDUs, lets it run
//! one cycle at a time, and reads a few statistics used by the PUT checks.
//!
//! Engines are not required to be thread-safe. The processor creates one with
//! an [`EngineFactory`] and moves it onto the cycler thread, which is the only
//! place it is ever touched afterwards. What the engine reports back (finished
//! transactions, PDUs to send) goes through the [`EngineCallbacks`] it is
//! built with.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::events::PduProvenance;
use crate::history::{TransactionHistory, TransactionOutcome};
use crate::response::RequestResult;
use crate::types::{EntityId, TransactionId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine rejected the request: {0}")]
    Rejected(String),

    #[error("engine failed: {0}")]
    Failed(String),

    #[error("malformed PDU: {0}")]
    MalformedPdu(String),
}

/// A file transfer request, already validated by the PUT checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub destination: EntityId,
    /// Path of the file to send, inside the uplink directory.
    pub source_file: PathBuf,
    pub destination_file_name: String,
    pub ack_required: bool,
    pub session_key: Option<u64>,
    /// Decoded message bytes, in the order given.
    pub messages_to_user: Vec<Vec<u8>>,
    pub file_size: u64,
}

/// Operation applied to a set of transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOperation {
    Cancel,
    Abandon,
    Suspend,
    Resume,
    Report,
    ForceGenerate,
    Freeze,
    Thaw,
}

/// Which transactions an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestScope {
    All,
    ServiceClass1,
    ServiceClass2,
    Entity(EntityId),
    Transaction(TransactionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    Put(PutRequest),
    Transaction {
        operation: TransactionOperation,
        scope: RequestScope,
    },
    SaveState {
        directory: PathBuf,
    },
}

/// What one engine cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleOutcome {
    pub pdu_sent: bool,
}

pub trait ProtocolEngine: Send {
    fn give_request(&mut self, request: EngineRequest) -> Result<RequestResult, EngineError>;

    fn give_pdu(&mut self, pdu: &[u8], provenance: &PduProvenance) -> Result<(), EngineError>;

    /// Advances timers and emits outbound PDUs.
    fn cycle(&mut self) -> CycleOutcome;

    fn open_uplink_transactions(&self, _remote: EntityId) -> usize {
        0
    }

    fn uplink_bytes_in_flight(&self, _remote: EntityId) -> u64 {
        0
    }

    fn reset_statistics(&mut self) {}
}

/// Where the engine hands its outbound PDUs.
pub type OutboundPduSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// # Engine Callbacks
///
/// The processor side of the engine seam, handed to the factory. Cloning is
/// cheap; every clone talks to the same history and sink.
#[derive(Clone)]
pub struct EngineCallbacks {
    history: Arc<dyn TransactionHistory>,
    outbound: Option<OutboundPduSink>,
}

impl EngineCallbacks {
    pub fn new(history: Arc<dyn TransactionHistory>) -> Self {
        Self { history, outbound: None }
    }

    pub fn with_outbound_pdu_sink(mut self, sink: OutboundPduSink) -> Self {
        self.outbound = Some(sink);
        self
    }

    /// Records a finished transaction in the history.
    pub fn transaction_finished(&self, transaction: TransactionId, outcome: TransactionOutcome) {
        tracing::debug!(%transaction, ?outcome, "transaction finished");
        self.history.record(transaction, outcome);
    }

    /// Sends one encoded PDU. Returns `false` when no sink is attached, in
    /// which case the PDU is dropped.
    pub fn send_pdu(&self, pdu: &[u8]) -> bool {
        match &self.outbound {
            Some(sink) => {
                sink(pdu);
                true
            }
            None => {
                tracing::trace!(len = pdu.len(), "no outbound PDU sink, dropping PDU");
                false
            }
        }
    }

    pub fn history(&self) -> &Arc<dyn TransactionHistory> {
        &self.history
    }
}

impl std::fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCallbacks")
            .field("outbound", &self.outbound.is_some())
            .finish_non_exhaustive()
    }
}

/// Builds the engine for the local entity.
pub trait EngineFactory {
    fn create_manager(
        &self,
        local_entity: EntityId,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn ProtocolEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(EntityId, EngineCallbacks) -> Result<Box<dyn ProtocolEngine>, EngineError>,
{
    fn create_manager(
        &self,
        local_entity: EntityId,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn ProtocolEngine>, EngineError> {
        self(local_entity, callbacks)
    }
}
