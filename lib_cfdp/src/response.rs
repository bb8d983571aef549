//! # Response Correlation
//!
//! Every action published by a producer carries the sending half of a private,
//! single-use channel. Whoever completes the action (the cycler, or the ingest
//! worker for INGEST) deposits exactly one [`RequestResult`] into it; the
//! producer awaits the receiving half with an upper bound.
//!
//! Exactly-once delivery is a property of the types: [`ResponseSender::send`]
//! consumes the sender, and the slot that carries it hands it out with
//! `Option::take`, so a second send cannot even be expressed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

/// # Request Result
///
/// The outcome of one action. A result is successful when neither the
/// `bad_request` nor the `internal_error` flag is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResult {
    /// The request itself was malformed or refers to something that does not exist.
    pub bad_request: bool,
    /// The request was well formed but the processor could not carry it out.
    pub internal_error: bool,
    pub message: Option<String>,
    /// Optional structured payload, e.g. the messages-to-user map for MTU_MAP.
    pub data: Option<serde_json::Value>,
}

impl RequestResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn ok_with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            bad_request: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            internal_error: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_success(&self) -> bool {
        !self.bad_request && !self.internal_error
    }
}

/// Failure to obtain a result from a response channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("no result received within {0:?}")]
    Timeout(Duration),

    #[error("response channel closed before a result was deposited")]
    Dropped,
}

/// Sending half, stored in the ring-buffer slot next to the request.
#[derive(Debug)]
pub struct ResponseSender(oneshot::Sender<RequestResult>);

impl ResponseSender {
    /// Deposits the result. Returns `false` when the producer is no longer
    /// listening (it timed out or was dropped).
    pub fn send(self, result: RequestResult) -> bool {
        self.0.send(result).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Receiving half, kept by the producer.
#[derive(Debug)]
pub struct ResponseReceiver(oneshot::Receiver<RequestResult>);

impl ResponseReceiver {
    /// Waits for the result for at most `timeout`.
    pub async fn recv(self, timeout: Duration) -> Result<RequestResult, ResponseError> {
        match tokio::time::timeout(timeout, self.0).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ResponseError::Dropped),
            Err(_) => Err(ResponseError::Timeout(timeout)),
        }
    }

    /// Non-blocking check, `Ok(None)` while the result is still pending.
    pub fn try_recv(&mut self) -> Result<Option<RequestResult>, ResponseError> {
        match self.0.try_recv() {
            Ok(result) => Ok(Some(result)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(ResponseError::Dropped),
        }
    }
}

/// Creates the private channel for one request.
pub fn response_channel() -> (ResponseSender, ResponseReceiver) {
    let (tx, rx) = oneshot::channel();
    (ResponseSender(tx), ResponseReceiver(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_result_reaches_receiver() {
        let (tx, rx) = response_channel();
        assert!(tx.send(RequestResult::ok_with_message("done")));
        let result = rx.recv(Duration::from_secs(1)).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_reported() {
        let (tx, rx) = response_channel();
        drop(tx);
        assert_eq!(rx.recv(Duration::from_secs(1)).await, Err(ResponseError::Dropped));
    }

    #[tokio::test]
    async fn test_wait_is_bounded() {
        let (_tx, rx) = response_channel();
        let err = rx.recv(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ResponseError::Timeout(_)));
    }

    #[test]
    fn test_send_after_receiver_gone_reports_false() {
        let (tx, rx) = response_channel();
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.send(RequestResult::internal_error("late")));
    }

    #[test]
    fn test_flags_decide_success() {
        assert!(RequestResult::ok().is_success());
        assert!(!RequestResult::bad_request("x").is_success());
        assert!(!RequestResult::internal_error("x").is_success());
    }
}
