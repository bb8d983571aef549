//! # Periodic Tasks
//!
//! Timer-driven work that runs beside the pipelines: purging the finished
//! transactions history and, when enabled, asking the engine to save its
//! state. Both run on one dedicated thread with its own single-threaded
//! tokio runtime, and both stop when the shared [`CancellationToken`] fires.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::ActionEvent;
use crate::executor::TaskThread;
use crate::history::TransactionHistory;
use crate::response::response_channel;
use crate::ring::RingBuffer;
use crate::sync::WaitOutcome;
use crate::translate::{translate_generic_action, GenericActionRequest, InternalRequest};
use crate::types::ActionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicSchedule {
    pub history_purge_period: Option<Duration>,
    pub auto_save_period: Option<Duration>,
    /// How long an auto-save waits for its (discarded) result.
    pub auto_save_result_timeout: Duration,
}

impl PeriodicSchedule {
    pub fn from_millis(history_purge_millis: u64, auto_save_millis: u64, result_timeout: Duration) -> Self {
        let period = |millis: u64| (millis > 0).then(|| Duration::from_millis(millis));
        Self {
            history_purge_period: period(history_purge_millis),
            auto_save_period: period(auto_save_millis),
            auto_save_result_timeout: result_timeout,
        }
    }
}

async fn purge_history(period: Duration, history: Arc<dyn TransactionHistory>, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let purged = history.purge_expired_transactions();
                tracing::trace!(purged, "history purge tick");
            }
        }
    }
    tracing::debug!("history purge task stopped");
}

async fn auto_save(
    period: Duration,
    result_timeout: Duration,
    actions: Arc<RingBuffer<ActionEvent>>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (response, receiver) = response_channel();
        let request = InternalRequest::new(
            GenericActionRequest {
                action: ActionType::SaveState,
            },
            response,
        );
        let request_id = request.request_id;
        // Never block the timer thread on a full ring; the next period retries.
        if let Err(e) = actions.try_publish_event(translate_generic_action, request) {
            tracing::warn!(error = %e, "skipped automatic state save");
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = receiver.recv(result_timeout) => match result {
                Ok(result) if result.is_success() => tracing::debug!(%request_id, "automatic state save done"),
                Ok(result) => tracing::warn!(%request_id, message = ?result.message, "automatic state save failed"),
                Err(e) => tracing::warn!(%request_id, error = %e, "no result for automatic state save"),
            }
        }
    }
    tracing::debug!("auto state save task stopped");
}

/// The timer thread. Its task-thread token is the one the async tasks watch.
pub struct PeriodicTasks {
    thread: TaskThread,
}

impl PeriodicTasks {
    pub fn start(
        schedule: PeriodicSchedule,
        history: Arc<dyn TransactionHistory>,
        actions: Arc<RingBuffer<ActionEvent>>,
    ) -> io::Result<Self> {
        let thread = TaskThread::spawn("cfdp-periodic", CancellationToken::new(), move |token| {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build periodic task runtime");
                    return;
                }
            };
            runtime.block_on(async move {
                let mut tasks = JoinSet::new();
                if let Some(period) = schedule.history_purge_period {
                    tracing::info!(?period, "scheduling finished transactions history purge");
                    tasks.spawn(purge_history(period, history, token.clone()));
                }
                if let Some(period) = schedule.auto_save_period {
                    tracing::info!(?period, "scheduling automatic state save");
                    tasks.spawn(auto_save(period, schedule.auto_save_result_timeout, actions, token.clone()));
                }
                while tasks.join_next().await.is_some() {}
            });
        })?;

        Ok(Self { thread })
    }

    /// Cancels the tasks and waits for the thread to finish.
    pub fn shutdown(&mut self, timeout: Duration, caller: &CancellationToken) -> WaitOutcome {
        self.thread.cancel();
        let outcome = self.thread.await_termination_or_cancelled(timeout, caller);
        if outcome == WaitOutcome::Released {
            self.thread.join();
        }
        outcome
    }

    pub fn force_stop(&mut self) {
        self.thread.force_stop();
    }
}
