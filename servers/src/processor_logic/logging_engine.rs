//! # Logging Engine
//!
//! A stand-in protocol engine for running the processor without a CFDP
//! state machine. It keeps a table of uplink transfers, advances each by a
//! fixed chunk per cycle, and logs every PDU it is handed. Each cycle emits a
//! small progress PDU per moving transfer through the engine callbacks.
//! Finished transfers go into the shared history so purge and CLEAR have
//! something to act on.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use lib_cfdp::dispatch::pdu_framer::{pdu_length, FIXED_HEADER_LEN};
use lib_cfdp::{
    CycleOutcome, EngineCallbacks, EngineError, EngineRequest, EntityId, PduProvenance, ProtocolEngine, PutRequest, RequestResult, RequestScope, TransactionId, TransactionOperation, TransactionOutcome,
};
use serde::Serialize;
use serde_json::json;

/// Bytes of file data "sent" per transfer per cycle.
const CHUNK: u64 = 64 * 1024;

/// Leading PDU bytes written to the debug log.
const LOGGED_PREFIX: usize = 16;

const STATE_FILE: &str = "state.json";

/// Header byte 3 of an outbound PDU: 8-byte entity ids, 8-byte sequence numbers.
const ID_LENGTHS: u8 = 0x77;

/// Offset field carried by a progress PDU.
const PROGRESS_DATA_LEN: u16 = 4;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Transfer {
    id: TransactionId,
    destination: EntityId,
    source_file: PathBuf,
    destination_file_name: String,
    service_class: u8,
    file_size: u64,
    progress: u64,
    suspended: bool,
    frozen: bool,
}

impl Transfer {
    fn is_moving(&self) -> bool {
        !self.suspended && !self.frozen
    }

    fn in_scope(&self, scope: &RequestScope) -> bool {
        match scope {
            RequestScope::All => true,
            RequestScope::ServiceClass1 => self.service_class == 1,
            RequestScope::ServiceClass2 => self.service_class == 2,
            RequestScope::Entity(entity) => self.destination == *entity,
            RequestScope::Transaction(id) => self.id == *id,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    pdus_received: u64,
    pdus_malformed: u64,
    transactions_started: u64,
    transactions_completed: u64,
}

pub struct LoggingEngine {
    local: EntityId,
    next_sequence: u64,
    transfers: BTreeMap<u64, Transfer>,
    callbacks: EngineCallbacks,
    stats: Statistics,
}

impl LoggingEngine {
    pub fn new(local: EntityId, callbacks: EngineCallbacks) -> Self {
        Self {
            local,
            next_sequence: 1,
            transfers: BTreeMap::new(),
            callbacks,
            stats: Statistics::default(),
        }
    }

    fn start_transfer(&mut self, put: PutRequest) -> RequestResult {
        let id = TransactionId {
            entity: self.local,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        tracing::info!(
            transaction = %id,
            destination = %put.destination,
            file = %put.source_file.display(),
            size = put.file_size,
            messages = put.messages_to_user.len(),
            "uplink transaction started"
        );
        self.transfers.insert(
            id.sequence,
            Transfer {
                id,
                destination: put.destination,
                source_file: put.source_file,
                destination_file_name: put.destination_file_name,
                service_class: if put.ack_required { 2 } else { 1 },
                file_size: put.file_size,
                progress: 0,
                suspended: false,
                frozen: false,
            },
        );
        self.stats.transactions_started += 1;
        RequestResult::ok_with_message(format!("Transaction {id} started"))
            .with_data(json!({ "transactionId": id }))
    }

    fn apply(&mut self, operation: TransactionOperation, scope: RequestScope) -> Result<RequestResult, EngineError> {
        let selected: Vec<u64> = self
            .transfers
            .values()
            .filter(|t| t.in_scope(&scope))
            .map(|t| t.id.sequence)
            .collect();

        if selected.is_empty() {
            if let RequestScope::Transaction(id) = scope {
                return Err(EngineError::Rejected(format!("Transaction {id} is not in progress")));
            }
        }

        let count = selected.len();
        match operation {
            TransactionOperation::Cancel => self.finish(&selected, TransactionOutcome::Cancelled),
            TransactionOperation::Abandon => self.finish(&selected, TransactionOutcome::Abandoned),
            TransactionOperation::Suspend => self.mark(&selected, |t| t.suspended = true),
            TransactionOperation::Resume => self.mark(&selected, |t| t.suspended = false),
            TransactionOperation::Freeze => self.mark(&selected, |t| t.frozen = true),
            TransactionOperation::Thaw => self.mark(&selected, |t| t.frozen = false),
            TransactionOperation::ForceGenerate => {
                tracing::debug!(count, "forced generation of pending PDUs requested");
            }
            TransactionOperation::Report => {
                let report: Vec<&Transfer> = selected.iter().filter_map(|s| self.transfers.get(s)).collect();
                return Ok(RequestResult::ok_with_message(format!("{count} transaction(s) in progress"))
                    .with_data(json!({ "transactions": report })));
            }
        }
        tracing::info!(?operation, ?scope, count, "transaction operation applied");
        Ok(RequestResult::ok_with_message(format!("{operation:?} applied to {count} transaction(s)")))
    }

    fn mark(&mut self, selected: &[u64], change: impl Fn(&mut Transfer)) {
        for sequence in selected {
            if let Some(transfer) = self.transfers.get_mut(sequence) {
                change(transfer);
            }
        }
    }

    fn finish(&mut self, selected: &[u64], outcome: TransactionOutcome) {
        for sequence in selected {
            if let Some(transfer) = self.transfers.remove(sequence) {
                self.callbacks.transaction_finished(transfer.id, outcome);
            }
        }
    }

    /// Fixed header, source id, sequence, destination id, then the offset
    /// reached as a big-endian u32.
    fn progress_pdu(transfer: &Transfer) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(FIXED_HEADER_LEN + 3 * 8 + PROGRESS_DATA_LEN as usize);
        pdu.push(0x20);
        pdu.extend_from_slice(&PROGRESS_DATA_LEN.to_be_bytes());
        pdu.push(ID_LENGTHS);
        pdu.extend_from_slice(&transfer.id.entity.0.to_be_bytes());
        pdu.extend_from_slice(&transfer.id.sequence.to_be_bytes());
        pdu.extend_from_slice(&transfer.destination.0.to_be_bytes());
        let offset = u32::try_from(transfer.progress).unwrap_or(u32::MAX);
        pdu.extend_from_slice(&offset.to_be_bytes());
        pdu
    }

    fn save_state(&self, directory: PathBuf) -> Result<RequestResult, EngineError> {
        let state = json!({
            "localEntityId": self.local,
            "nextSequence": self.next_sequence,
            "transactions": self.transfers.values().collect::<Vec<_>>(),
            "statistics": self.stats,
        });
        let path = directory.join(STATE_FILE);
        fs::create_dir_all(&directory)
            .and_then(|_| fs::write(&path, serde_json::to_vec_pretty(&state)?))
            .map_err(|e| EngineError::Failed(format!("saving state to {}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), transactions = self.transfers.len(), "engine state saved");
        Ok(RequestResult::ok_with_message(format!("State saved to {}", path.display())))
    }
}

impl ProtocolEngine for LoggingEngine {
    fn give_request(&mut self, request: EngineRequest) -> Result<RequestResult, EngineError> {
        match request {
            EngineRequest::Put(put) => Ok(self.start_transfer(put)),
            EngineRequest::Transaction { operation, scope } => self.apply(operation, scope),
            EngineRequest::SaveState { directory } => self.save_state(directory),
        }
    }

    fn give_pdu(&mut self, pdu: &[u8], provenance: &PduProvenance) -> Result<(), EngineError> {
        self.stats.pdus_received += 1;
        let Some(header) = pdu.first_chunk::<FIXED_HEADER_LEN>() else {
            self.stats.pdus_malformed += 1;
            return Err(EngineError::MalformedPdu(format!("{} byte(s) is shorter than a PDU header", pdu.len())));
        };
        let declared = pdu_length(header);
        if declared != pdu.len() {
            self.stats.pdus_malformed += 1;
            return Err(EngineError::MalformedPdu(format!(
                "header declares {declared} byte(s) but {} were received",
                pdu.len()
            )));
        }
        tracing::debug!(
            length = pdu.len(),
            prefix = %hex::encode(&pdu[..pdu.len().min(LOGGED_PREFIX)]),
            ert = ?provenance.ert,
            "inbound PDU"
        );
        Ok(())
    }

    fn cycle(&mut self) -> CycleOutcome {
        let mut pdu_sent = false;
        let mut completed = Vec::new();
        for transfer in self.transfers.values_mut().filter(|t| t.is_moving()) {
            transfer.progress = (transfer.progress + CHUNK).min(transfer.file_size);
            self.callbacks.send_pdu(&Self::progress_pdu(transfer));
            pdu_sent = true;
            if transfer.progress >= transfer.file_size {
                completed.push(transfer.id.sequence);
            }
        }
        for sequence in &completed {
            if let Some(transfer) = self.transfers.get(sequence) {
                tracing::info!(transaction = %transfer.id, size = transfer.file_size, "uplink transaction completed");
            }
        }
        self.stats.transactions_completed += completed.len() as u64;
        self.finish(&completed, TransactionOutcome::Completed);
        CycleOutcome { pdu_sent }
    }

    fn open_uplink_transactions(&self, remote: EntityId) -> usize {
        self.transfers.values().filter(|t| t.destination == remote).count()
    }

    fn uplink_bytes_in_flight(&self, remote: EntityId) -> u64 {
        self.transfers
            .values()
            .filter(|t| t.destination == remote)
            .map(|t| t.file_size - t.progress)
            .sum()
    }

    fn reset_statistics(&mut self) {
        tracing::info!(stats = ?self.stats, "statistics reset");
        self.stats = Statistics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_cfdp::FinishedTransactionsHistory;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn engine() -> (LoggingEngine, Arc<FinishedTransactionsHistory>) {
        let history = Arc::new(FinishedTransactionsHistory::new(Duration::from_secs(60)));
        (LoggingEngine::new(EntityId(1), EngineCallbacks::new(history.clone())), history)
    }

    fn put(destination: u64, size: u64, ack_required: bool) -> EngineRequest {
        EngineRequest::Put(PutRequest {
            destination: EntityId(destination),
            source_file: PathBuf::from("uplink/a.bin"),
            destination_file_name: "a.bin".to_string(),
            ack_required,
            session_key: None,
            messages_to_user: Vec::new(),
            file_size: size,
        })
    }

    #[test]
    fn test_transfer_completes_after_enough_cycles() {
        let (mut engine, history) = engine();
        engine.give_request(put(2, CHUNK * 2 + 1, false)).unwrap();
        assert_eq!(engine.open_uplink_transactions(EntityId(2)), 1);
        assert_eq!(engine.uplink_bytes_in_flight(EntityId(2)), CHUNK * 2 + 1);

        for _ in 0..3 {
            assert!(engine.cycle().pdu_sent);
        }
        assert!(!engine.cycle().pdu_sent);
        assert_eq!(engine.open_uplink_transactions(EntityId(2)), 0);
        let id = TransactionId { entity: EntityId(1), sequence: 1 };
        assert_eq!(history.outcome(&id), Some(TransactionOutcome::Completed));
    }

    #[test]
    fn test_cycle_sends_progress_pdus_through_callbacks() {
        let history = Arc::new(FinishedTransactionsHistory::new(Duration::from_secs(60)));
        let sent = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = {
            let sent = Arc::clone(&sent);
            Arc::new(move |pdu: &[u8]| sent.lock().unwrap().push(pdu.to_vec()))
        };
        let callbacks = EngineCallbacks::new(history).with_outbound_pdu_sink(sink);
        let mut engine = LoggingEngine::new(EntityId(1), callbacks);
        engine.give_request(put(2, CHUNK + 5, false)).unwrap();

        assert!(engine.cycle().pdu_sent);
        assert!(engine.cycle().pdu_sent);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        for pdu in sent.iter() {
            let header = pdu.first_chunk::<FIXED_HEADER_LEN>().unwrap();
            assert_eq!(pdu_length(header), pdu.len());
        }
        let last = &sent[1];
        assert_eq!(&last[last.len() - 4..], &((CHUNK + 5) as u32).to_be_bytes());
        assert_eq!(&last[4..12], &1u64.to_be_bytes());
        assert_eq!(&last[20..28], &2u64.to_be_bytes());
    }

    #[test]
    fn test_suspended_transfer_does_not_move() {
        let (mut engine, _) = engine();
        engine.give_request(put(2, CHUNK * 4, true)).unwrap();
        engine
            .give_request(EngineRequest::Transaction {
                operation: TransactionOperation::Suspend,
                scope: RequestScope::ServiceClass2,
            })
            .unwrap();
        assert!(!engine.cycle().pdu_sent);
        assert_eq!(engine.uplink_bytes_in_flight(EntityId(2)), CHUNK * 4);
    }

    #[test]
    fn test_cancel_unknown_transaction_is_rejected() {
        let (mut engine, _) = engine();
        let err = engine
            .give_request(EngineRequest::Transaction {
                operation: TransactionOperation::Cancel,
                scope: RequestScope::Transaction(TransactionId { entity: EntityId(1), sequence: 42 }),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
    }

    #[test]
    fn test_abandon_all_records_history() {
        let (mut engine, history) = engine();
        engine.give_request(put(2, 10, false)).unwrap();
        engine.give_request(put(3, 10, false)).unwrap();
        engine
            .give_request(EngineRequest::Transaction {
                operation: TransactionOperation::Abandon,
                scope: RequestScope::All,
            })
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(engine.open_uplink_transactions(EntityId(3)), 0);
    }

    #[test]
    fn test_report_lists_selected_transactions() {
        let (mut engine, _) = engine();
        engine.give_request(put(2, 10, false)).unwrap();
        engine.give_request(put(3, 10, false)).unwrap();
        let result = engine
            .give_request(EngineRequest::Transaction {
                operation: TransactionOperation::Report,
                scope: RequestScope::Entity(EntityId(3)),
            })
            .unwrap();
        let listed = result.data.unwrap()["transactions"].as_array().unwrap().len();
        assert_eq!(listed, 1);
    }

    #[test]
    fn test_save_state_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _) = engine();
        engine.give_request(put(2, 10, false)).unwrap();
        let result = engine
            .give_request(EngineRequest::SaveState {
                directory: dir.path().join("saved"),
            })
            .unwrap();
        assert!(result.is_success());
        let saved: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join("saved").join(STATE_FILE)).unwrap()).unwrap();
        assert_eq!(saved["nextSequence"], 2);
    }

    #[test]
    fn test_malformed_pdu_rejected() {
        let (mut engine, _) = engine();
        let provenance = PduProvenance::default();
        assert!(engine.give_pdu(&[0x20, 0x00], &provenance).is_err());
        // Header declares 4 + 2 + 1 + 2 = 9 bytes.
        assert!(engine.give_pdu(&[0x20, 0x00, 0x02, 0x00, 1, 2, 3, 4, 5], &provenance).is_ok());
        assert!(engine.give_pdu(&[0x20, 0x00, 0x02, 0x00, 1, 2, 3], &provenance).is_err());
    }
}
