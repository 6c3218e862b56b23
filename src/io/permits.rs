//! Admission control for in-flight operations
//!
//! A counting gate sized to `max_io`. Each submitted operation holds one
//! [`Permit`] until its completion is routed; acquiring blocks while the gate
//! is saturated, which pushes back on submitters instead of queueing without
//! bound.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Counting permit gate
#[derive(Debug)]
pub struct IoPermits {
    available: Mutex<usize>,
    cond: Condvar,
    max: usize,
}

/// One unit of the concurrency budget
///
/// Released when dropped. Not `Clone`, so every release pairs with exactly
/// one acquire.
#[derive(Debug)]
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    permits: Arc<IoPermits>,
}

impl IoPermits {
    /// Create a gate with `max` permits
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(max),
            cond: Condvar::new(),
            max,
        })
    }

    /// Acquire a permit, blocking while none are available
    pub fn acquire(self: &Arc<Self>) -> Permit {
        let mut available = self.available.lock();
        while *available == 0 {
            self.cond.wait(&mut available);
        }
        *available -= 1;
        Permit {
            permits: Arc::clone(self),
        }
    }

    /// Acquire a permit without blocking
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit {
            permits: Arc::clone(self),
        })
    }

    /// Take every permit, waiting up to `timeout` for outstanding ones
    ///
    /// On success the gate stays empty; it is only used on the close path,
    /// after which the gate is discarded.
    pub fn acquire_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock();
        while *available < self.max {
            if self.cond.wait_until(&mut available, deadline).timed_out() {
                if *available < self.max {
                    return false;
                }
                break;
            }
        }
        *available = 0;
        true
    }

    /// Number of permits currently available
    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Total number of permits
    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of permits currently held
    pub fn in_use(&self) -> usize {
        self.max - self.available()
    }

    fn release(&self) {
        let mut available = self.available.lock();
        debug_assert!(*available < self.max, "permit released twice");
        *available += 1;
        // Wake everyone: acquire_all waits for the full count
        self.cond.notify_all();
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.permits.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_acquire_up_to_max() {
        let permits = IoPermits::new(3);
        let held: Vec<Permit> = (0..3).map(|_| permits.acquire()).collect();
        assert_eq!(permits.available(), 0);
        assert!(permits.try_acquire().is_none());

        drop(held);
        assert_eq!(permits.available(), 3);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let permits = IoPermits::new(1);
        let first = permits.acquire();
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let permits = permits.clone();
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                let _p = permits.acquire();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_acquire_all_times_out_with_outstanding_permit() {
        let permits = IoPermits::new(2);
        let held = permits.acquire();
        assert!(!permits.acquire_all(Duration::from_millis(20)));
        assert_eq!(permits.in_use(), 1);

        drop(held);
        assert!(permits.acquire_all(Duration::from_millis(20)));
        assert_eq!(permits.available(), 0);
    }
}
