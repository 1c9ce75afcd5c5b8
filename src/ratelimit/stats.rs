//! Limiter counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one limiter.
///
/// Updated with relaxed atomics; a snapshot is not a consistent cut across
/// counters, only each counter on its own.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, queued: usize, processing: bool) -> LimiterStats {
        LimiterStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            queued,
            processing,
        }
    }
}

/// Point-in-time view of a limiter's activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Operations accepted into the queue
    pub submitted: u64,
    /// Operations that produced a value
    pub completed: u64,
    /// Operations that failed every attempt or panicked
    pub failed: u64,
    /// Retry attempts across all operations
    pub retries: u64,
    /// Submissions turned away by backpressure or a missing runtime
    pub rejected: u64,
    /// Operations waiting to start
    pub queued: usize,
    /// Whether a drain task is active
    pub processing: bool,
}

impl LimiterStats {
    /// Accepted operations that have not settled yet.
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let counters = Counters::default();
        counters.record_submitted();
        counters.record_submitted();
        counters.record_submitted();
        counters.record_completed();
        counters.record_failed();
        counters.record_retry();
        counters.record_retry();
        counters.record_rejected();

        let stats = counters.snapshot(1, true);
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.queued, 1);
        assert!(stats.processing);
        assert_eq!(stats.in_flight(), 1);
    }

    #[test]
    fn test_serialize() {
        let stats = Counters::default().snapshot(0, false);
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["submitted"], 0);
        assert_eq!(json["processing"], false);
    }
}
