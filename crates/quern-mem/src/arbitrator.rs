//! Process-wide aggregate accounting and hard-limit admission.
//!
//! One arbitrator per worker process (dependency-injected so tests can build
//! isolated instances). The admission answer is advisory: check-then-consume
//! is not atomic across threads, so transient over-commit past the hard
//! limit is possible and resolved by per-task limits and cancellation.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

/// Point-in-time view of process-level usage, serializable for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ArbitratorSnapshot {
    pub hard_limit_bytes: i64,
    pub consumption_bytes: i64,
    pub reclaimed_by_wait_bytes: i64,
}

/// Aggregate memory authority for one worker process.
#[derive(Debug)]
pub struct MemoryArbitrator {
    /// Negative means unlimited.
    hard_limit: i64,
    consumption: AtomicI64,
    reclaimed_by_wait: AtomicI64,
}

impl MemoryArbitrator {
    pub fn new(hard_limit_bytes: i64) -> Self {
        Self {
            hard_limit: hard_limit_bytes,
            consumption: AtomicI64::new(0),
            reclaimed_by_wait: AtomicI64::new(0),
        }
    }

    pub fn hard_limit(&self) -> i64 {
        self.hard_limit
    }

    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Relaxed)
    }

    /// Bytes that became available to waiting threads before they failed.
    pub fn reclaimed_by_wait(&self) -> i64 {
        self.reclaimed_by_wait.load(Ordering::Relaxed)
    }

    /// Would granting `bytes` more cross the process hard limit?
    pub fn would_exceed_hard_limit(&self, bytes: i64) -> bool {
        self.hard_limit >= 0 && self.consumption() + bytes > self.hard_limit
    }

    pub fn consume(&self, bytes: i64) {
        self.consumption.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: i64) {
        self.consumption.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Record that a wait-for-reclaim ended with `bytes` admissible.
    pub fn record_reclaimed(&self, bytes: i64) {
        self.reclaimed_by_wait.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ArbitratorSnapshot {
        ArbitratorSnapshot {
            hard_limit_bytes: self.hard_limit,
            consumption_bytes: self.consumption(),
            reclaimed_by_wait_bytes: self.reclaimed_by_wait(),
        }
    }

    /// Machine-readable process usage summary for diagnostics.
    pub fn usage_summary(&self) -> String {
        let snap = self.snapshot();
        serde_json::to_string(&snap).unwrap_or_else(|_| {
            format!(
                "process used {} of {} bytes",
                snap.consumption_bytes, snap.hard_limit_bytes
            )
        })
    }

    /// Log process-level usage on failure paths.
    pub fn log_process_usage(&self) {
        tracing::warn!(
            hard_limit = self.hard_limit,
            consumption = self.consumption(),
            reclaimed_by_wait = self.reclaimed_by_wait(),
            "process memory usage"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_tracks_consumption() {
        let arb = MemoryArbitrator::new(1_000);
        assert!(!arb.would_exceed_hard_limit(1_000));
        arb.consume(600);
        assert!(!arb.would_exceed_hard_limit(400));
        assert!(arb.would_exceed_hard_limit(401));
        arb.release(600);
        assert!(!arb.would_exceed_hard_limit(1_000));
    }

    #[test]
    fn unlimited_arbitrator_never_refuses() {
        let arb = MemoryArbitrator::new(-1);
        arb.consume(i64::MAX / 2);
        assert!(!arb.would_exceed_hard_limit(i64::MAX / 4));
    }

    #[test]
    fn usage_summary_is_json() {
        let arb = MemoryArbitrator::new(42);
        arb.consume(7);
        let summary = arb.usage_summary();
        assert!(summary.contains("\"hard_limit_bytes\":42"));
        assert!(summary.contains("\"consumption_bytes\":7"));
    }
}
