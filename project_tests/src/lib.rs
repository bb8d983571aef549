//! Fixtures shared by the processor integration tests and the throughput runner.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lib_cfdp::{
    CfdpProcessor, CycleOutcome, EngineCallbacks, EngineError, EngineRequest, EntityId, FinishedTransactionsHistory,
    PduProvenance, ProcessorConfig, ProtocolEngine, RequestResult, RequestScope, TransactionOperation,
    TransactionOutcome,
};

/// Sequence number the scripted engine refuses as unknown.
pub const UNKNOWN_SEQUENCE: u64 = 404;

/// Longest a wedged engine stays wedged, so detached threads do not outlive the test binary by much.
const MAX_WEDGE: Duration = Duration::from_secs(10);

/// What the scripted engine saw, and switches that change how it behaves.
#[derive(Debug, Default)]
pub struct Observer {
    requests: Mutex<Vec<EngineRequest>>,
    pdus: Mutex<Vec<Vec<u8>>>,
    cycles: AtomicU64,
    resets: AtomicU64,
    wedged: AtomicBool,
    panic_next_request: AtomicBool,
    request_delay_millis: AtomicU64,
}

impl Observer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn pdus(&self) -> Vec<Vec<u8>> {
        self.pdus.lock().unwrap().clone()
    }

    pub fn pdu_count(&self) -> usize {
        self.pdus.lock().unwrap().len()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    /// The next `cycle` call blocks until [`unwedge`](Self::unwedge).
    pub fn wedge(&self) {
        self.wedged.store(true, Ordering::SeqCst);
    }

    pub fn unwedge(&self) {
        self.wedged.store(false, Ordering::SeqCst);
    }

    pub fn panic_on_next_request(&self) {
        self.panic_next_request.store(true, Ordering::SeqCst);
    }

    pub fn slow_requests(&self, delay: Duration) {
        self.request_delay_millis.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

/// Records what it is given in its [`Observer`]. A cancelled transaction is
/// reported finished and every inbound PDU is echoed to the outbound sink.
pub struct ScriptedEngine {
    observer: Arc<Observer>,
    callbacks: EngineCallbacks,
}

impl ProtocolEngine for ScriptedEngine {
    fn give_request(&mut self, request: EngineRequest) -> Result<RequestResult, EngineError> {
        let delay = self.observer.request_delay_millis.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.observer.panic_next_request.swap(false, Ordering::SeqCst) {
            panic!("scripted engine panic");
        }
        self.observer.requests.lock().unwrap().push(request.clone());

        match request {
            EngineRequest::Put(put) => Ok(RequestResult::ok_with_message(format!(
                "PUT of {} accepted",
                put.destination_file_name
            ))),
            EngineRequest::Transaction {
                scope: RequestScope::Transaction(id),
                ..
            } if id.sequence == UNKNOWN_SEQUENCE => Err(EngineError::Rejected(format!("Transaction {id} not found"))),
            EngineRequest::Transaction {
                operation: TransactionOperation::Cancel,
                scope: RequestScope::Transaction(id),
            } => {
                self.callbacks.transaction_finished(id, TransactionOutcome::Cancelled);
                Ok(RequestResult::ok_with_message(format!("Transaction {id} cancelled")))
            }
            EngineRequest::Transaction { operation, .. } => {
                Ok(RequestResult::ok_with_message(format!("{operation:?} done")))
            }
            EngineRequest::SaveState { directory } => {
                fs::create_dir_all(&directory)
                    .and_then(|_| fs::write(directory.join("state.json"), b"{}"))
                    .map_err(|e| EngineError::Failed(e.to_string()))?;
                Ok(RequestResult::ok_with_message("State saved"))
            }
        }
    }

    fn give_pdu(&mut self, pdu: &[u8], _provenance: &PduProvenance) -> Result<(), EngineError> {
        self.observer.pdus.lock().unwrap().push(pdu.to_vec());
        self.callbacks.send_pdu(pdu);
        Ok(())
    }

    fn cycle(&mut self) -> CycleOutcome {
        self.observer.cycles.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        while self.observer.wedged.load(Ordering::SeqCst) && started.elapsed() < MAX_WEDGE {
            std::thread::sleep(Duration::from_millis(5));
        }
        CycleOutcome::default()
    }

    fn reset_statistics(&mut self) {
        self.observer.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Engine factory handing out a [`ScriptedEngine`] wired to `observer`.
pub fn scripted_factory(
    observer: Arc<Observer>,
) -> impl Fn(EntityId, EngineCallbacks) -> Result<Box<dyn ProtocolEngine>, EngineError> {
    move |_local: EntityId, callbacks: EngineCallbacks| -> Result<Box<dyn ProtocolEngine>, EngineError> {
        Ok(Box::new(ScriptedEngine {
            observer: Arc::clone(&observer),
            callbacks,
        }))
    }
}

/// Small rings, short timeouts, no periodic tasks, directories under `root`.
pub fn test_config(root: &Path) -> ProcessorConfig {
    ProcessorConfig {
        action_ring_buffer_size: 8,
        inbound_pdu_ring_buffer_size: 8,
        ingest_action_ring_buffer_size: 2,
        pipeline_shutdown_timeout_millis: 1_000,
        worker_tasks_executor_shutdown_timeout_millis: 1_000,
        engine_cycler_task_executor_shutdown_timeout_millis: 1_000,
        engine_cycle_minimum_interval_when_idle_millis: 1,
        action_result_timeout_millis: 5_000,
        ingest_result_timeout_millis: 5_000,
        finished_transactions_history_purge_period_millis: 0,
        auto_state_save_period_millis: 0,
        saved_state_directory: root.join("saved"),
        uplink_files_top_level_directory: root.join("uplink"),
        ..ProcessorConfig::default()
    }
}

/// A started processor with a scripted engine.
pub fn start_processor(config: ProcessorConfig, observer: &Arc<Observer>) -> CfdpProcessor {
    let history = Arc::new(FinishedTransactionsHistory::new(config.history_retention()));
    let mut processor = CfdpProcessor::new(config, history);
    processor.start(&scripted_factory(Arc::clone(observer))).unwrap();
    processor
}

/// A PDU with one-byte entity ids and sequence number around `data`.
pub fn pdu(data: &[u8]) -> Vec<u8> {
    let length = (data.len() as u16).to_be_bytes();
    let mut bytes = vec![0x20, length[0], length[1], 0x00, 0x01, 0x02, 0x03];
    bytes.extend_from_slice(data);
    bytes
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
