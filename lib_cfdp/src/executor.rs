//! # Task Threads
//!
//! A named OS thread with a [`CancellationToken`] it is expected to honour and
//! a [`Latch`] that is released when its body returns, including by panic.
//! This is the unit the lifecycle orchestrator starts, awaits with deadlines
//! and, when a deadline passes, escalates against.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::sync::{latch, Latch, WaitOutcome};

#[derive(Debug)]
pub struct TaskThread {
    name: String,
    handle: Option<JoinHandle<()>>,
    finished: Latch,
    cancel: CancellationToken,
}

impl TaskThread {
    /// Spawns `body` on a new thread named `name`. The body receives a clone
    /// of `cancel`.
    pub fn spawn<F>(name: &str, cancel: CancellationToken, body: F) -> io::Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let (guard, finished) = latch();
        let thread_cancel = cancel.clone();
        let thread_name = name.to_string();

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _guard = guard;
            tracing::debug!(thread = %thread_name, "task thread started");
            body(thread_cancel);
            tracing::debug!(thread = %thread_name, "task thread finished");
        })?;

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            finished,
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_released()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the body to return. `true` if it did within `timeout`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.finished.wait_timeout(timeout)
    }

    /// Like [`await_termination`](Self::await_termination), but gives up as
    /// soon as `caller` is cancelled.
    pub fn await_termination_or_cancelled(&self, timeout: Duration, caller: &CancellationToken) -> WaitOutcome {
        self.finished.wait_timeout_or_cancelled(timeout, caller)
    }

    /// Joins a thread that has finished. Returns `false` if the body panicked.
    /// Must only be called once [`is_finished`](Self::is_finished) is true,
    /// otherwise it blocks.
    pub fn join(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }

    /// Gives up on the thread: it keeps running, unobserved, until it notices
    /// its token or the process exits.
    pub fn detach(&mut self) {
        if self.handle.take().is_some() {
            tracing::warn!(thread = %self.name, "detached task thread that did not terminate");
        }
    }

    /// Cancels and detaches. There is no way to kill an OS thread, so this is
    /// the strongest stop available.
    pub fn force_stop(&mut self) {
        self.cancel();
        if self.is_finished() {
            self.join();
        } else {
            self.detach();
        }
    }
}
