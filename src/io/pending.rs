//! Pending-operation tracking
//!
//! Counts operations that were accepted but have not completed yet, so close
//! can wait for them to drain.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Drain-capable counter of in-flight operations
#[derive(Debug, Default)]
pub struct PendingCounter {
    count: Mutex<usize>,
    cond: Condvar,
}

impl PendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An operation was accepted
    pub fn up(&self) {
        *self.count.lock() += 1;
    }

    /// An operation completed
    pub fn down(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "pending counter underflow");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Current number of pending operations
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Wait up to `timeout` for the count to reach zero
    ///
    /// Returns false if operations are still pending when the timeout
    /// elapses; callers re-check in a loop.
    pub fn wait_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}
