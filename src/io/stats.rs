//! Per-file IO counters
//!
//! Counters are updated by submitting threads and the completion poller and
//! read without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bucket count, see [`LatencyHistogram`] for the bounds
const HISTOGRAM_BUCKETS: usize = 8;

/// Completion latency histogram with fixed buckets
///
/// Buckets: <100us, <1ms, <5ms, <10ms, <50ms, <100ms, <1s, >1s
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; HISTOGRAM_BUCKETS],
    /// Total submit-to-completion time, microseconds
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub const fn new() -> Self {
        Self {
            buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Add one completed operation
    pub fn record(&self, latency: Duration) {
        let us = latency.as_micros() as u64;
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let bucket = match us {
            0..=99 => 0,
            100..=999 => 1,
            1000..=4999 => 2,
            5000..=9999 => 3,
            10000..=49999 => 4,
            50000..=99999 => 5,
            100000..=999999 => 6,
            _ => 7,
        };
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Average recorded latency
    pub fn average(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sum_us.load(Ordering::Relaxed) / count)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Bucket counts, fastest first
    pub fn buckets(&self) -> [u64; HISTOGRAM_BUCKETS] {
        std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed))
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one [`AsyncFile`](crate::io::AsyncFile)
#[derive(Debug, Default)]
pub struct IoStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    drain_warnings: AtomicU64,
    latency: LatencyHistogram,
}

impl IoStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, latency: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drain_warning(&self) {
        self.drain_warnings.fetch_add(1, Ordering::Relaxed);
    }

    /// Operations handed to the backend
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Operations whose callback saw success
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Operations whose callback saw an error
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Times close waited a full interval and logged a warning
    pub fn drain_warnings(&self) -> u64 {
        self.drain_warnings.load(Ordering::Relaxed)
    }

    pub fn latency(&self) -> &LatencyHistogram {
        &self.latency
    }
}
