//! Process-wide cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Cancellation flag plus a condvar so sleeping loops wake promptly.
#[derive(Debug, Default)]
pub struct Shutdown {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleeps up to `timeout`, returning early (true) on cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut guard = self.lock.lock();
        if self.is_cancelled() {
            return true;
        }
        self.condvar.wait_for(&mut guard, timeout);
        self.is_cancelled()
    }
}
