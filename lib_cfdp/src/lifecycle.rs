//! # Processor Lifecycle
//!
//! [`CfdpProcessor`] wires the pipelines, the cycler and the periodic tasks
//! together, and takes them down again in a fixed order:
//!
//! ```text
//! CREATED ──start()──▶ STARTING ──▶ RUNNING ──shutdown()──▶ STOPPING ──▶ STOPPED
//!                         │                                                ▲
//!                         └──────────────── failure ───────────────────────┘
//! ```
//!
//! Shutdown is best effort and bounded. Every stage has a timeout; a stage
//! that overruns is recorded in the [`ShutdownReport`] and the next stage
//! runs anyway. Threads that will not stop are cancelled and detached.
//! If the caller raises its [`ShutdownInterrupt`] while shutdown is waiting,
//! everything left is force-stopped at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ProcessorConfig};
use crate::dispatch::{ActionClient, EngineCycler, InboundPduPublisher, MessagesToUserMap, PduIngestWorker};
use crate::engine::{EngineCallbacks, EngineError, EngineFactory, OutboundPduSink};
use crate::events::{ActionEvent, InboundPduEvent};
use crate::executor::TaskThread;
use crate::history::TransactionHistory;
use crate::periodic::{PeriodicSchedule, PeriodicTasks};
use crate::ring::{EventPipeline, PipelineError, RingBufferError};
use crate::sync::WaitOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("operation not allowed in state {0:?}")]
    InvalidState(LifecycleState),

    #[error("processor is not running")]
    NotRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create protocol engine: {0}")]
    Engine(#[from] EngineError),

    #[error("failed to build pipeline: {0}")]
    Ring(#[from] RingBufferError),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The caller's handle for cutting a shutdown short (e.g. a second Ctrl-C).
/// Once raised it stays raised.
#[derive(Debug, Clone, Default)]
pub struct ShutdownInterrupt(CancellationToken);

impl ShutdownInterrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// What happened during [`CfdpProcessor::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The caller's interrupt fired and remaining stages were forced.
    pub interrupted: bool,
    /// One entry per stage that overran or had to be forced.
    pub failures: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.failures.is_empty()
    }
}

const ACTION_PIPELINE: &str = "cfdp-actions";
const INBOUND_PIPELINE: &str = "cfdp-inbound-pdus";
const INGEST_PIPELINE: &str = "cfdp-ingest";

/// Everything that only exists while running.
struct Running {
    actions: EventPipeline<ActionEvent>,
    inbound: EventPipeline<InboundPduEvent>,
    ingest: EventPipeline<ActionEvent>,
    periodic: Option<PeriodicTasks>,
    cycler: TaskThread,
    shutting_down: Arc<AtomicBool>,
    client: ActionClient,
    publisher: InboundPduPublisher,
}

pub struct CfdpProcessor {
    config: Arc<ProcessorConfig>,
    history: Arc<dyn TransactionHistory>,
    outbound: Option<OutboundPduSink>,
    state: LifecycleState,
    running: Option<Running>,
}

impl CfdpProcessor {
    pub fn new(config: ProcessorConfig, history: Arc<dyn TransactionHistory>) -> Self {
        Self {
            config: Arc::new(config),
            history,
            outbound: None,
            state: LifecycleState::Created,
            running: None,
        }
    }

    /// Gives the engine somewhere to send the PDUs it produces.
    pub fn with_outbound_pdu_sink(mut self, sink: OutboundPduSink) -> Self {
        self.outbound = Some(sink);
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Builds the engine and every pipeline, then starts the worker threads.
    /// Allowed once, from `Created`.
    pub fn start(&mut self, factory: &dyn EngineFactory) -> Result<(), LifecycleError> {
        if self.state != LifecycleState::Created {
            return Err(LifecycleError::InvalidState(self.state));
        }
        self.state = LifecycleState::Starting;
        match self.try_start(factory) {
            Ok(running) => {
                self.running = Some(running);
                self.state = LifecycleState::Running;
                tracing::info!(local_entity = %self.config.local_entity_id, "CFDP processor running");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "CFDP processor failed to start");
                self.state = LifecycleState::Stopped;
                Err(e)
            }
        }
    }

    fn try_start(&self, factory: &dyn EngineFactory) -> Result<Running, LifecycleError> {
        let config = &self.config;
        config.validate()?;
        let mtu_map = MessagesToUserMap::from_config(config)?;

        let mut callbacks = EngineCallbacks::new(Arc::clone(&self.history));
        if let Some(sink) = &self.outbound {
            callbacks = callbacks.with_outbound_pdu_sink(Arc::clone(sink));
        }
        let engine = factory.create_manager(config.local_entity_id, callbacks)?;

        let mut actions = EventPipeline::new(ACTION_PIPELINE, config.action_ring_buffer_size)?;
        let mut inbound = EventPipeline::new(INBOUND_PIPELINE, config.inbound_pdu_ring_buffer_size)?;
        let mut ingest = EventPipeline::new(INGEST_PIPELINE, config.ingest_action_ring_buffer_size)?;

        let action_poller = actions.new_poller()?;
        let inbound_poller = inbound.new_poller()?;
        ingest.handle_events_with(PduIngestWorker::new(
            inbound.ring(),
            config.pdu_file_read_buffer_size,
            config.ingest_read_interval(),
        ))?;

        let shutting_down = Arc::new(AtomicBool::new(false));
        let cycler = EngineCycler::new(
            Arc::clone(config),
            engine,
            action_poller,
            inbound_poller,
            ingest.ring(),
            Arc::clone(&self.history),
            mtu_map,
            Arc::clone(&shutting_down),
        );

        ingest.start(CancellationToken::new())?;

        let periodic = if config.has_periodic_tasks() {
            let schedule = PeriodicSchedule::from_millis(
                config.finished_transactions_history_purge_period_millis,
                config.auto_state_save_period_millis,
                config.action_result_timeout(),
            );
            match PeriodicTasks::start(schedule, Arc::clone(&self.history), actions.ring()) {
                Ok(periodic) => Some(periodic),
                Err(e) => {
                    ingest.force_stop();
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let cycler = match TaskThread::spawn("cfdp-engine-cycler", CancellationToken::new(), move |cancel| {
            cycler.run(cancel)
        }) {
            Ok(thread) => thread,
            Err(e) => {
                ingest.force_stop();
                if let Some(mut periodic) = periodic {
                    periodic.force_stop();
                }
                return Err(e.into());
            }
        };

        let client = ActionClient::new(
            actions.ring(),
            config.action_result_timeout(),
            config.ingest_result_timeout(),
        );
        let publisher = InboundPduPublisher::new(inbound.ring(), config.inbound_pdu_backpressure);

        Ok(Running {
            actions,
            inbound,
            ingest,
            periodic,
            cycler,
            shutting_down,
            client,
            publisher,
        })
    }

    /// Handle for submitting actions. Only available while running.
    pub fn action_client(&self) -> Result<ActionClient, LifecycleError> {
        match (&self.running, self.state) {
            (Some(running), LifecycleState::Running) => Ok(running.client.clone()),
            _ => Err(LifecycleError::NotRunning),
        }
    }

    /// Handle for publishing inbound PDUs. Only available while running.
    pub fn inbound_pdu_publisher(&self) -> Result<InboundPduPublisher, LifecycleError> {
        match (&self.running, self.state) {
            (Some(running), LifecycleState::Running) => Ok(running.publisher.clone()),
            _ => Err(LifecycleError::NotRunning),
        }
    }

    /// Stops everything, in order, within the configured timeouts. Blocks the
    /// calling thread; async callers should run it on a blocking thread.
    ///
    /// Never fails. Stages that overran are listed in the report. Calling it
    /// in any state other than `Running` only moves a `Created` processor to
    /// `Stopped`.
    pub fn shutdown(&mut self, interrupt: &ShutdownInterrupt) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let Some(mut running) = self.running.take() else {
            if self.state == LifecycleState::Created {
                self.state = LifecycleState::Stopped;
            }
            return report;
        };
        self.state = LifecycleState::Stopping;
        tracing::info!("CFDP processor shutting down");

        let caller = &interrupt.0;
        let config = Arc::clone(&self.config);

        // 1. No more INGEST republishing.
        running.shutting_down.store(true, Ordering::Release);

        // 2. No more publishes into any ring.
        running.actions.halt();
        running.inbound.halt();
        running.ingest.halt();

        // 3. Stop any file ingestion in progress.
        running.ingest.cancel();

        // 4. Let each pipeline's consumer finish what it has.
        let timeout = config.pipeline_shutdown_timeout();
        for pipeline in [&mut running.ingest, &mut running.actions] {
            if let Err(e) = pipeline.shutdown(timeout, caller) {
                record_pipeline_failure(&mut report, e);
            }
        }
        if let Err(e) = running.inbound.shutdown(timeout, caller) {
            record_pipeline_failure(&mut report, e);
        }

        // 5. Periodic tasks.
        if let Some(periodic) = running.periodic.as_mut() {
            if report.interrupted {
                periodic.force_stop();
            } else {
                match periodic.shutdown(config.worker_tasks_shutdown_timeout(), caller) {
                    WaitOutcome::Released => {}
                    WaitOutcome::TimedOut => {
                        tracing::warn!("periodic tasks did not stop in time, forcing");
                        report.failures.push("periodic tasks did not stop in time".to_string());
                        periodic.force_stop();
                    }
                    WaitOutcome::Interrupted => {
                        report.interrupted = true;
                        periodic.force_stop();
                    }
                }
            }
        }

        // 6. The cycler, last, so it can still answer what was drained.
        running.cycler.cancel();
        if report.interrupted {
            running.cycler.force_stop();
        } else {
            self.stop_cycler(&mut running.cycler, &config, caller, &mut report);
        }

        if report.interrupted {
            tracing::warn!("shutdown interrupted, remaining workers forced");
            running.ingest.force_stop();
            running.actions.force_stop();
            running.inbound.force_stop();
            // The caller's interrupt stays raised for whoever checks it next.
            interrupt.raise();
        }

        self.state = LifecycleState::Stopped;
        if report.is_clean() {
            tracing::info!("CFDP processor stopped cleanly");
        } else {
            tracing::warn!(interrupted = report.interrupted, failures = ?report.failures, "CFDP processor stopped");
        }
        report
    }

    fn stop_cycler(&self, cycler: &mut TaskThread, config: &ProcessorConfig, caller: &CancellationToken, report: &mut ShutdownReport) {
        let timeout = config.cycler_shutdown_timeout();
        match cycler.await_termination_or_cancelled(timeout, caller) {
            WaitOutcome::Released => {
                cycler.join();
                return;
            }
            WaitOutcome::Interrupted => {
                report.interrupted = true;
                cycler.force_stop();
                return;
            }
            WaitOutcome::TimedOut => {
                tracing::warn!(?timeout, "engine cycler did not stop in time, escalating");
            }
        }

        // Escalate: every wait the cycler owns already watches its token, so
        // the only thing left is one more period before abandoning it.
        cycler.cancel();
        match cycler.await_termination_or_cancelled(timeout, caller) {
            WaitOutcome::Released => {
                cycler.join();
                report.failures.push("engine cycler stopped only after escalation".to_string());
            }
            WaitOutcome::Interrupted => {
                report.interrupted = true;
                cycler.force_stop();
            }
            WaitOutcome::TimedOut => {
                tracing::error!("engine cycler failed to stop, detaching it");
                report.failures.push("engine cycler failed to stop".to_string());
                cycler.force_stop();
            }
        }
    }
}

fn record_pipeline_failure(report: &mut ShutdownReport, error: PipelineError) {
    match error {
        PipelineError::Interrupted { .. } => report.interrupted = true,
        other => {
            tracing::warn!(error = %other, "pipeline shutdown overran");
            report.failures.push(other.to_string());
        }
    }
}

impl Drop for CfdpProcessor {
    fn drop(&mut self) {
        if self.running.is_some() {
            tracing::warn!("CFDP processor dropped while running, shutting down");
            let interrupt = ShutdownInterrupt::new();
            self.shutdown(&interrupt);
        }
    }
}
