//! Blocking wait strategy for the ring: one doorbell per condition a thread
//! can park on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Upper bound on a single park. Only matters when more threads park on one
/// doorbell than it holds rings for, i.e. more producers than slots.
const PARK_SLICE: Duration = Duration::from_millis(10);

/// A single-slot channel used as a wakeup. A ring that arrives before anyone
/// parks is kept, so a waiter cannot miss it between its check and its park.
#[derive(Debug)]
pub(crate) struct Doorbell {
    bell: Sender<()>,
    listener: Receiver<()>,
}

impl Default for Doorbell {
    fn default() -> Self {
        let (bell, listener) = bounded(1);
        Self { bell, listener }
    }
}

impl Doorbell {
    /// Parks until `ready` returns true (`true`) or `halted` is raised (`false`).
    pub(crate) fn wait_until(&self, halted: &AtomicBool, mut ready: impl FnMut() -> bool) -> bool {
        loop {
            if ready() {
                return true;
            }
            if halted.load(Ordering::Acquire) {
                return false;
            }
            let _ = self.listener.recv_timeout(PARK_SLICE);
        }
    }

    pub(crate) fn ring(&self) {
        let _ = self.bell.try_send(());
    }
}
