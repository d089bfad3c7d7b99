//! Interruptible stop signal for the driver's helper threads.
//!
//! The rate-submission loop and the throughput monitor sleep in short
//! intervals; a Condvar-backed signal wakes them within milliseconds of
//! the run ending instead of letting the full interval elapse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Cooperative stop signal. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal stop and wake all waiters immediately.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `stop()`. Returns
    /// `true` when stop was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut guard = self.inner.lock.lock();
        let _ = self.inner.cond.wait_for(&mut guard, duration);
        self.is_stopped()
    }
}
