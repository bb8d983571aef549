//! # Engine Cycler
//!
//! The one thread that owns the protocol engine. Each pass of its loop
//!
//! 1. hands at most one inbound PDU to the engine,
//! 2. dispatches at most one action,
//! 3. cycles the engine,
//! 4. sleeps out the rest of the idle interval if none of that did anything.
//!
//! Taking one event per ring per pass keeps PDUs, actions and engine timers
//! interleaved fairly. Every other thread reaches the engine only by
//! publishing into the action or inbound ring.
//!
//! When the cycler is interrupted it drains both rings before returning:
//! pending actions are answered with an internal error and pending PDUs are
//! discarded, so no producer waits on a slot nobody will read.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::ingest_worker::SHUTTING_DOWN;
use super::put::{admit_put, MessagesToUserMap};
use crate::config::ProcessorConfig;
use crate::engine::{EngineError, EngineRequest, ProtocolEngine, RequestScope, TransactionOperation};
use crate::events::{ActionEvent, InboundPduEvent};
use crate::history::TransactionHistory;
use crate::response::RequestResult;
use crate::ring::{PollState, Poller, RingBuffer, RingBufferError};
use crate::sync::CancelWatch;
use crate::translate::copy_ingest;
use crate::types::{ActionType, SelectionMode, TransactionId};

pub const CLEARED_MESSAGE: &str = "CFDP Processor cleared of all states";

fn operation_for(action: ActionType) -> Option<TransactionOperation> {
    let operation = match action {
        ActionType::Cancel => TransactionOperation::Cancel,
        ActionType::Abandon => TransactionOperation::Abandon,
        ActionType::Suspend => TransactionOperation::Suspend,
        ActionType::Resume => TransactionOperation::Resume,
        ActionType::Report => TransactionOperation::Report,
        ActionType::ForceGen => TransactionOperation::ForceGenerate,
        ActionType::PauseTimer => TransactionOperation::Freeze,
        ActionType::ResumeTimer => TransactionOperation::Thaw,
        _ => return None,
    };
    Some(operation)
}

/// Maps the selection fields of a slot to an engine scope.
pub fn request_scope(event: &ActionEvent) -> Result<RequestScope, RequestResult> {
    match event.selection_mode {
        Some(SelectionMode::All) => Ok(RequestScope::All),
        Some(SelectionMode::ByServiceClass) => match event.service_class {
            Some(1) => Ok(RequestScope::ServiceClass1),
            Some(2) => Ok(RequestScope::ServiceClass2),
            other => Err(RequestResult::bad_request(format!(
                "Service class {} is not supported for selection by service class",
                other.map_or_else(|| "<none>".to_string(), |c| c.to_string())
            ))),
        },
        Some(SelectionMode::ByRemoteEntity) => event
            .remote_entity_id
            .map(RequestScope::Entity)
            .ok_or_else(|| RequestResult::bad_request("Selection by remote entity requires a remote entity id")),
        Some(SelectionMode::ByTransactionIds) => {
            let entity = event.transaction_entity_id.ok_or_else(|| {
                RequestResult::bad_request("Selection by transaction ids requires a transaction entity id")
            })?;
            // Only one transaction per request: the first sequence number of the first range.
            let range = event
                .transaction_sequence_numbers
                .first()
                .ok_or_else(|| RequestResult::bad_request("Selection by transaction ids requires a sequence number"))?;
            Ok(RequestScope::Transaction(TransactionId {
                entity,
                sequence: range.start,
            }))
        }
        None => Err(RequestResult::bad_request("Transaction selection mode is missing")),
    }
}

/// The state the cycler needs to act on one action; split from the pollers so
/// both can be borrowed at once.
struct Dispatcher {
    config: Arc<ProcessorConfig>,
    engine: Box<dyn ProtocolEngine>,
    ingest_ring: Arc<RingBuffer<ActionEvent>>,
    history: Arc<dyn TransactionHistory>,
    mtu_map: MessagesToUserMap,
    shutting_down: Arc<AtomicBool>,
}

impl Dispatcher {
    fn give_request(&mut self, request: EngineRequest) -> RequestResult {
        let engine = &mut self.engine;
        match panic::catch_unwind(AssertUnwindSafe(|| engine.give_request(request))) {
            Ok(Ok(result)) => result,
            Ok(Err(EngineError::Rejected(reason))) => RequestResult::bad_request(reason),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "engine failed a request");
                RequestResult::internal_error(e.to_string())
            }
            Err(_) => {
                tracing::error!("engine panicked while handling a request");
                RequestResult::internal_error("Protocol engine failed while handling the request")
            }
        }
    }

    fn reset_statistics(&mut self) -> Result<(), RequestResult> {
        let engine = &mut self.engine;
        panic::catch_unwind(AssertUnwindSafe(|| engine.reset_statistics())).map_err(|_| {
            tracing::error!("engine panicked while resetting statistics");
            RequestResult::internal_error("Protocol engine failed while resetting statistics")
        })
    }

    fn give_pdu(&mut self, event: &InboundPduEvent, sequence: u64) {
        if event.is_empty() {
            tracing::warn!(sequence, "skipping empty inbound PDU slot");
            return;
        }
        let engine = &mut self.engine;
        match panic::catch_unwind(AssertUnwindSafe(|| engine.give_pdu(event.pdu(), &event.provenance))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(sequence, length = event.len(), error = %e, "engine rejected inbound PDU"),
            Err(_) => tracing::error!(sequence, length = event.len(), "engine panicked on inbound PDU"),
        }
    }

    fn cycle_engine(&mut self) -> bool {
        let engine = &mut self.engine;
        match panic::catch_unwind(AssertUnwindSafe(|| engine.cycle())) {
            Ok(outcome) => outcome.pdu_sent,
            Err(_) => {
                tracing::error!("engine panicked during cycle");
                false
            }
        }
    }

    /// Hands an INGEST over to the ingest worker. On success the response
    /// channel has moved with it and nothing is answered here.
    fn forward_ingest(&mut self, event: &mut ActionEvent) -> Result<(), RequestResult> {
        let file = match event.ingest_file_name.as_deref() {
            Some(path) if path.exists() => path.display().to_string(),
            Some(path) => {
                return Err(RequestResult::bad_request(format!(
                    "Ingest file {} does not exist",
                    path.display()
                )))
            }
            None => return Err(RequestResult::bad_request("INGEST request has no file name")),
        };
        if self.shutting_down.load(Ordering::Acquire) {
            tracing::warn!(%file, "discarding INGEST because shutting down");
            return Err(RequestResult::internal_error(format!(
                "Will not ingest file {file} because shutting down"
            )));
        }
        match self.ingest_ring.try_publish_event(copy_ingest, event) {
            Ok(_) => Ok(()),
            Err(RingBufferError::Full) => Err(RequestResult::internal_error(format!(
                "Cannot ingest file {file}: too many ingestions already queued"
            ))),
            Err(RingBufferError::Halted) => Err(RequestResult::internal_error(SHUTTING_DOWN)),
            Err(e) => Err(RequestResult::internal_error(e.to_string())),
        }
    }

    fn clear(&mut self) -> RequestResult {
        let abandoned = self.give_request(EngineRequest::Transaction {
            operation: TransactionOperation::Abandon,
            scope: RequestScope::All,
        });
        if !abandoned.is_success() {
            tracing::warn!(message = ?abandoned.message, "ABANDON ALL during CLEAR did not succeed");
        }
        if let Err(result) = self.reset_statistics() {
            return result;
        }
        self.history.clear();
        tracing::info!("processor cleared of all states");
        RequestResult::ok_with_message(CLEARED_MESSAGE)
    }

    fn dispatch(&mut self, event: &mut ActionEvent, sequence: u64) {
        let request = event.request_label();
        let Some(action) = event.action_type else {
            tracing::error!(sequence, %request, "action event has no action type");
            answer(event, RequestResult::internal_error("Action event has no action type"));
            return;
        };
        tracing::trace!(sequence, %request, %action, "consumed an action");

        let result = match action {
            ActionType::Put => match admit_put(event, &self.config, &self.mtu_map, self.engine.as_ref()) {
                Ok(put) => self.give_request(EngineRequest::Put(put)),
                Err(rejected) => rejected,
            },
            ActionType::Cancel
            | ActionType::Abandon
            | ActionType::Suspend
            | ActionType::Resume
            | ActionType::Report
            | ActionType::ForceGen
            | ActionType::PauseTimer
            | ActionType::ResumeTimer => match (operation_for(action), request_scope(event)) {
                (Some(operation), Ok(scope)) => self.give_request(EngineRequest::Transaction { operation, scope }),
                (_, Err(rejected)) => rejected,
                (None, Ok(_)) => RequestResult::internal_error(format!("Action type {action} is not supported")),
            },
            ActionType::ResetStat => match self.reset_statistics() {
                Ok(()) => RequestResult::ok_with_message("Statistics reset"),
                Err(result) => result,
            },
            ActionType::SaveState => self.give_request(EngineRequest::SaveState {
                directory: self.config.saved_state_directory.clone(),
            }),
            ActionType::Ingest => match self.forward_ingest(event) {
                Ok(()) => return,
                Err(rejected) => rejected,
            },
            ActionType::MtuMap => RequestResult::ok().with_data(self.mtu_map.to_json()),
            ActionType::Clear => self.clear(),
        };

        if !result.is_success() {
            tracing::debug!(%request, %action, message = ?result.message, "action not carried out");
        }
        answer(event, result);
    }
}

fn answer(event: &mut ActionEvent, result: RequestResult) {
    match event.take_response() {
        Some(response) => {
            if !response.send(result) {
                tracing::warn!(request = %event.request_label(), "requester no longer waiting for its result");
            }
        }
        None => tracing::error!(request = %event.request_label(), "action event carried no response channel"),
    }
}

pub struct EngineCycler {
    dispatcher: Dispatcher,
    actions: Poller<ActionEvent>,
    inbound: Poller<InboundPduEvent>,
}

impl EngineCycler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ProcessorConfig>,
        engine: Box<dyn ProtocolEngine>,
        actions: Poller<ActionEvent>,
        inbound: Poller<InboundPduEvent>,
        ingest_ring: Arc<RingBuffer<ActionEvent>>,
        history: Arc<dyn TransactionHistory>,
        mtu_map: MessagesToUserMap,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher {
                config,
                engine,
                ingest_ring,
                history,
                mtu_map,
                shutting_down,
            },
            actions,
            inbound,
        }
    }

    /// One pass of the loop. Returns whether anything happened.
    pub fn cycle_once(&mut self) -> bool {
        let dispatcher = &mut self.dispatcher;
        let pdu = self.inbound.poll(|event, sequence, _| dispatcher.give_pdu(event, sequence));
        let action = self.actions.poll(|event, sequence, _| dispatcher.dispatch(event, sequence));
        let sent = dispatcher.cycle_engine();
        pdu == PollState::Processing || action == PollState::Processing || sent
    }

    /// Runs until `cancel` fires, then drains both rings.
    pub fn run(mut self, cancel: CancellationToken) {
        tracing::info!("engine cycler started");
        let idle = self.dispatcher.config.idle_cycle_interval();
        let mut watch = CancelWatch::new(&cancel);
        while !cancel.is_cancelled() {
            let started = Instant::now();
            if self.cycle_once() {
                continue;
            }
            let left = idle.saturating_sub(started.elapsed());
            if !left.is_zero() && watch.sleep(left).is_err() {
                break;
            }
        }
        tracing::debug!("exited engine cycle loop, draining rings");
        self.drain();
    }

    fn drain(&mut self) {
        self.actions.ring().halt();
        self.inbound.ring().halt();

        let answered = self.actions.drain(|event, _| answer(event, RequestResult::internal_error(SHUTTING_DOWN)));
        let discarded = self.inbound.drain(|_, _| {});
        if answered > 0 || discarded > 0 {
            tracing::warn!(answered, discarded, "engine cycler drained rings on exit");
        }
        tracing::info!("engine cycler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, SequenceRange};

    fn selection(mode: SelectionMode) -> ActionEvent {
        ActionEvent {
            selection_mode: Some(mode),
            ..ActionEvent::default()
        }
    }

    #[test]
    fn test_scope_by_service_class() {
        let mut event = selection(SelectionMode::ByServiceClass);
        event.service_class = Some(2);
        assert_eq!(request_scope(&event), Ok(RequestScope::ServiceClass2));
        event.service_class = Some(3);
        assert!(request_scope(&event).unwrap_err().bad_request);
    }

    #[test]
    fn test_scope_by_transaction_ids_uses_first_sequence() {
        let mut event = selection(SelectionMode::ByTransactionIds);
        event.transaction_entity_id = Some(EntityId(4));
        assert!(request_scope(&event).unwrap_err().bad_request);

        event.transaction_sequence_numbers = vec![SequenceRange { start: 10, end: 20 }, SequenceRange::single(30)];
        assert_eq!(
            request_scope(&event),
            Ok(RequestScope::Transaction(TransactionId {
                entity: EntityId(4),
                sequence: 10,
            }))
        );
    }

    #[test]
    fn test_scope_requires_mode() {
        assert!(request_scope(&ActionEvent::default()).unwrap_err().bad_request);
        let mut event = selection(SelectionMode::ByRemoteEntity);
        event.remote_entity_id = Some(EntityId(9));
        assert_eq!(request_scope(&event), Ok(RequestScope::Entity(EntityId(9))));
    }

    #[test]
    fn test_operations() {
        assert_eq!(operation_for(ActionType::PauseTimer), Some(TransactionOperation::Freeze));
        assert_eq!(operation_for(ActionType::ForceGen), Some(TransactionOperation::ForceGenerate));
        assert_eq!(operation_for(ActionType::Put), None);
    }
}
