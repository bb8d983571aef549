//! # Cancellable Waiting on Worker Threads
//!
//! Worker threads in the processor are plain OS threads, stopped through a
//! [`CancellationToken`] like the async tasks are. A thread checks
//! `is_cancelled()` between units of work; when it has to block, it waits in
//! a `crossbeam_channel::select!` that includes a [`CancelWatch`], so the wait
//! ends the moment the token is cancelled.
//!
//! [`Latch`] is the matching "done" signal: a channel whose only sender is
//! held by the worker and dropped when it returns, unwinding included.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Wake, Waker};
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait was cancelled")]
pub struct Interrupted;

/// Turns a task wakeup into a message on a channel.
struct ChannelWaker(Sender<()>);

impl Wake for ChannelWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // A wakeup already queued is as good as a second one.
        let _ = self.0.try_send(());
    }
}

/// # Cancel Watch
///
/// Makes a [`CancellationToken`] selectable from synchronous code. The
/// token's cancellation future is polled with a waker that posts to
/// [`wakeups`](Self::wakeups), so a thread blocked in `select!` on that
/// receiver is woken by `cancel()`.
pub struct CancelWatch {
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    waker: Waker,
    wakeups: Receiver<()>,
}

impl CancelWatch {
    pub fn new(token: &CancellationToken) -> Self {
        let (tx, wakeups) = bounded(1);
        Self {
            cancelled: Box::pin(token.clone().cancelled_owned()),
            waker: Waker::from(Arc::new(ChannelWaker(tx))),
            wakeups,
        }
    }

    /// Whether the token is cancelled. While it is not, this (re)arms the
    /// wakeup.
    pub fn is_cancelled(&mut self) -> bool {
        let mut cx = Context::from_waker(&self.waker);
        self.cancelled.as_mut().poll(&mut cx).is_ready()
    }

    /// Receives a message after the token is cancelled. Only meaningful after
    /// a call to [`is_cancelled`](Self::is_cancelled) returned `false`.
    pub fn wakeups(&self) -> &Receiver<()> {
        &self.wakeups
    }

    /// Sleeps for `duration` unless the token is cancelled first.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), Interrupted> {
        let timer = after(duration);
        loop {
            if self.is_cancelled() {
                return Err(Interrupted);
            }
            select! {
                recv(self.wakeups) -> _ => {}
                recv(timer) -> _ => return Ok(()),
            }
        }
    }
}

/// One-off cancellable sleep. Loops that sleep repeatedly keep a
/// [`CancelWatch`] instead.
pub fn sleep(token: &CancellationToken, duration: Duration) -> Result<(), Interrupted> {
    CancelWatch::new(token).sleep(duration)
}

/// What ended a [`Latch`] wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Released,
    TimedOut,
    Interrupted,
}

/// Releases its [`Latch`] when dropped.
#[derive(Debug)]
pub struct LatchGuard {
    _release: Sender<()>,
}

/// Released once its [`LatchGuard`] is gone. Nothing is ever sent; release is
/// the disconnect.
#[derive(Debug, Clone)]
pub struct Latch {
    released: Receiver<()>,
}

pub fn latch() -> (LatchGuard, Latch) {
    let (tx, rx) = bounded(0);
    (LatchGuard { _release: tx }, Latch { released: rx })
}

impl Latch {
    pub fn is_released(&self) -> bool {
        matches!(self.released.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Returns `true` if released within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(self.released.recv_timeout(timeout), Err(RecvTimeoutError::Disconnected))
    }

    /// Waits for release, giving up on timeout or when `cancel` fires.
    pub fn wait_timeout_or_cancelled(&self, timeout: Duration, cancel: &CancellationToken) -> WaitOutcome {
        let mut watch = CancelWatch::new(cancel);
        let deadline = after(timeout);
        loop {
            if self.is_released() {
                return WaitOutcome::Released;
            }
            if watch.is_cancelled() {
                return WaitOutcome::Interrupted;
            }
            select! {
                recv(self.released) -> _ => return WaitOutcome::Released,
                recv(watch.wakeups()) -> _ => {}
                recv(deadline) -> _ => return WaitOutcome::TimedOut,
            }
        }
    }
}
