//! # Action Client
//!
//! The producer side of the action pipeline, for async callers such as REST
//! handlers. Each call creates a private response channel, publishes the
//! request on a blocking thread (a full ring must not stall the async
//! runtime), then waits for the result with an upper bound.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use crate::events::ActionEvent;
use crate::response::{response_channel, RequestResult, ResponseError};
use crate::ring::{RingBuffer, RingBufferError};
use crate::translate::{
    translate_generic_action, translate_ingest, translate_put, translate_transaction_identifying_action,
    GenericActionRequest, IngestActionRequest, InternalRequest, PutActionRequest, TransactionActionRequest,
};
use crate::types::ActionType;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to publish action: {0}")]
    Publish(#[from] RingBufferError),

    #[error("failed to receive action result: {0}")]
    Response(#[from] ResponseError),

    #[error("publishing task failed: {0}")]
    Join(#[from] JoinError),
}

type Translator<R> = fn(&mut ActionEvent, u64, InternalRequest<R>);

#[derive(Debug, Clone)]
pub struct ActionClient {
    ring: Arc<RingBuffer<ActionEvent>>,
    action_timeout: Duration,
    ingest_timeout: Duration,
}

impl ActionClient {
    pub fn new(ring: Arc<RingBuffer<ActionEvent>>, action_timeout: Duration, ingest_timeout: Duration) -> Self {
        Self {
            ring,
            action_timeout,
            ingest_timeout,
        }
    }

    async fn submit<R>(&self, translator: Translator<R>, request: R, timeout: Duration) -> Result<RequestResult, DispatchError>
    where
        R: Send + 'static,
    {
        let (response, receiver) = response_channel();
        let internal = InternalRequest::new(request, response);
        let request_id = internal.request_id;
        let ring = Arc::clone(&self.ring);

        let sequence = tokio::task::spawn_blocking(move || ring.publish_event(translator, internal)).await??;
        tracing::debug!(%request_id, sequence, "published action");

        let result = receiver.recv(timeout).await;
        if let Err(e) = &result {
            tracing::warn!(%request_id, error = %e, "no result for action");
        }
        Ok(result?)
    }

    pub async fn put(&self, request: PutActionRequest) -> Result<RequestResult, DispatchError> {
        self.submit(translate_put, request, self.action_timeout).await
    }

    /// CANCEL, ABANDON, SUSPEND, RESUME, REPORT, FORCE_GEN, PAUSE_TIMER or
    /// RESUME_TIMER. Any other action type is a bad request and is not published.
    pub async fn transaction_action(&self, request: TransactionActionRequest) -> Result<RequestResult, DispatchError> {
        if !request.action.is_transaction_identifying() {
            return Ok(RequestResult::bad_request(format!(
                "{} is not a transaction-identifying action",
                request.action
            )));
        }
        self.submit(translate_transaction_identifying_action, request, self.action_timeout)
            .await
    }

    /// RESET_STAT, SAVE_STATE, MTU_MAP or CLEAR.
    pub async fn generic_action(&self, request: GenericActionRequest) -> Result<RequestResult, DispatchError> {
        if !matches!(
            request.action,
            ActionType::ResetStat | ActionType::SaveState | ActionType::MtuMap | ActionType::Clear
        ) {
            return Ok(RequestResult::bad_request(format!(
                "{} cannot be requested without parameters",
                request.action
            )));
        }
        self.submit(translate_generic_action, request, self.action_timeout).await
    }

    /// Waits with the ingest timeout, which covers reading the whole file.
    pub async fn ingest(&self, request: IngestActionRequest) -> Result<RequestResult, DispatchError> {
        self.submit(translate_ingest, request, self.ingest_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::PollState;

    #[tokio::test]
    async fn test_result_is_correlated_with_request() {
        let ring = Arc::new(RingBuffer::new(4).unwrap());
        let mut poller = ring.new_poller().unwrap();
        let client = ActionClient::new(ring, Duration::from_secs(5), Duration::from_secs(5));

        let consumer = std::thread::spawn(move || loop {
            let state = poller.poll(|event: &mut ActionEvent, _, _| {
                let action = event.action_type.unwrap();
                let response = event.take_response().unwrap();
                response.send(RequestResult::ok_with_message(action.as_str()));
            });
            if state == PollState::Processing {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        });

        let result = client
            .generic_action(GenericActionRequest {
                action: ActionType::ResetStat,
            })
            .await
            .unwrap();
        assert_eq!(result.message.as_deref(), Some("RESET_STAT"));
        consumer.join().unwrap();
    }

    #[tokio::test]
    async fn test_wrong_action_kind_is_not_published() {
        let ring = Arc::new(RingBuffer::new(4).unwrap());
        let client = ActionClient::new(Arc::clone(&ring), Duration::from_secs(5), Duration::from_secs(5));
        let result = client
            .generic_action(GenericActionRequest { action: ActionType::Put })
            .await
            .unwrap();
        assert!(result.bad_request);
        assert_eq!(ring.cursor(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let ring = Arc::new(RingBuffer::new(4).unwrap());
        let client = ActionClient::new(ring, Duration::from_millis(30), Duration::from_secs(5));
        let err = client
            .generic_action(GenericActionRequest {
                action: ActionType::MtuMap,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Response(ResponseError::Timeout(_))));
    }
}
