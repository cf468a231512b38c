//! Per-queue execution statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Live counters updated by a worker pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Tasks that finished, successfully or not.
    pub finished: AtomicU64,

    /// Tasks whose processor returned a value.
    pub succeeded: AtomicU64,

    /// Total processing time (microseconds).
    pub process_time_us: AtomicU64,

    /// Tasks currently being processed.
    pub in_flight: AtomicU64,

    /// Highest value `in_flight` has reached.
    pub peak: AtomicU64,
}

impl PoolStats {
    /// Create zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a task entering its processor.
    pub fn record_started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    /// Record a task leaving its processor.
    pub fn record_finished(&self, elapsed: Duration, success: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.finished.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.process_time_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Get a snapshot of the stats.
    pub fn snapshot(&self) -> QueueStats {
        let total = self.finished.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let process_time_us = self.process_time_us.load(Ordering::Relaxed);

        let (average, success_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                (process_time_us as f64 / total as f64) / 1000.0,
                succeeded as f64 / total as f64,
            )
        };

        QueueStats {
            total,
            average,
            success_rate,
            peak: self.peak.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a queue's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Tasks processed so far.
    pub total: u64,
    /// Average processing time in milliseconds.
    pub average: f64,
    /// Fraction of processed tasks that succeeded, 0.0 to 1.0.
    pub success_rate: f64,
    /// Most tasks processed at the same time.
    pub peak: u64,
}
