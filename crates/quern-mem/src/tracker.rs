//! Per-scope memory trackers.
//!
//! A tracker counts consumption for one task (or for the thread's orphan
//! scope) against a soft limit, independent of the process-wide hard limit
//! the arbitrator enforces.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Out-of-band instrumentation notified about every tracked memory region.
///
/// Registered on a tracker at construction; when absent the hooks are
/// no-ops.
pub trait RegionInstrumentation: Send + Sync {
    fn register(&self, addr: usize, size: usize);
    fn unregister(&self, addr: usize, size: usize);
}

/// Returned by [`MemTracker::check_limit`] when consuming `requested` more
/// bytes would cross the tracker's limit.
#[derive(Debug, Clone)]
pub struct LimitExceeded {
    pub label: String,
    pub limit: i64,
    pub consumption: i64,
    pub requested: i64,
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tracker <{}> would exceed its limit: requested {} bytes, consumed {} of {} bytes",
            self.label, self.requested, self.consumption, self.limit
        )
    }
}

/// Point-in-time view of a tracker, serializable for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub label: String,
    pub limit: i64,
    pub consumption: i64,
    pub peak_consumption: i64,
}

/// Consumption counter with a soft limit and a monotonic peak.
pub struct MemTracker {
    label: String,
    /// Negative means unlimited.
    limit: i64,
    consumption: AtomicI64,
    peak_consumption: AtomicI64,
    instrumentation: Option<Arc<dyn RegionInstrumentation>>,
}

impl fmt::Debug for MemTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTracker")
            .field("label", &self.label)
            .field("limit", &self.limit)
            .field("consumption", &self.consumption())
            .field("peak_consumption", &self.peak_consumption())
            .finish()
    }
}

impl MemTracker {
    pub fn limited(label: impl Into<String>, limit_bytes: i64) -> Self {
        Self {
            label: label.into(),
            limit: limit_bytes,
            consumption: AtomicI64::new(0),
            peak_consumption: AtomicI64::new(0),
            instrumentation: None,
        }
    }

    pub fn unlimited(label: impl Into<String>) -> Self {
        Self::limited(label, -1)
    }

    /// Attach out-of-band region instrumentation.
    pub fn with_instrumentation(mut self, hooks: Arc<dyn RegionInstrumentation>) -> Self {
        self.instrumentation = Some(hooks);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Relaxed)
    }

    pub fn peak_consumption(&self) -> i64 {
        self.peak_consumption.load(Ordering::Relaxed)
    }

    /// Would consuming `bytes` more cross the limit?
    pub fn check_limit(&self, bytes: i64) -> Result<(), LimitExceeded> {
        if self.limit < 0 {
            return Ok(());
        }
        let current = self.consumption();
        if current + bytes > self.limit {
            return Err(LimitExceeded {
                label: self.label.clone(),
                limit: self.limit,
                consumption: current,
                requested: bytes,
            });
        }
        Ok(())
    }

    /// Record `bytes` consumed; updates the peak if higher.
    pub fn consume(&self, bytes: i64) {
        let current = self.consumption.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if bytes > 0 {
            let mut peak = self.peak_consumption.load(Ordering::Relaxed);
            while current > peak {
                match self.peak_consumption.compare_exchange(
                    peak,
                    current,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => peak = observed,
                }
            }
        }
    }

    /// The exact inverse of [`consume`](Self::consume).
    pub fn release(&self, bytes: i64) {
        self.consumption.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            label: self.label.clone(),
            limit: self.limit,
            consumption: self.consumption(),
            peak_consumption: self.peak_consumption(),
        }
    }

    /// Log current usage together with the reason it is being printed.
    pub fn log_usage(&self, reason: &str) {
        let snap = self.snapshot();
        tracing::warn!(
            label = %snap.label,
            limit = snap.limit,
            consumption = snap.consumption,
            peak = snap.peak_consumption,
            "{reason}"
        );
    }

    /// Register a memory region with the attached instrumentation, if any.
    pub fn add_region(&self, addr: usize, size: usize) {
        if let Some(hooks) = &self.instrumentation {
            hooks.register(addr, size);
        }
    }

    /// Unregister a memory region from the attached instrumentation, if any.
    pub fn remove_region(&self, addr: usize, size: usize) {
        if let Some(hooks) = &self.instrumentation {
            hooks.unregister(addr, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_release_round_trip() {
        let t = MemTracker::limited("q", 1_000);
        t.consume(600);
        assert_eq!(t.consumption(), 600);
        t.release(600);
        assert_eq!(t.consumption(), 0);
        assert_eq!(t.peak_consumption(), 600);
    }

    #[test]
    fn peak_never_decreases() {
        let t = MemTracker::unlimited("q");
        t.consume(100);
        t.consume(300);
        let peak = t.peak_consumption();
        t.release(400);
        t.consume(50);
        assert_eq!(t.peak_consumption(), peak);
    }

    #[test]
    fn check_limit_flags_exceedance_without_consuming() {
        let t = MemTracker::limited("q", 1_000);
        t.consume(600);
        assert!(t.check_limit(400).is_ok());
        let err = t.check_limit(500).unwrap_err();
        assert_eq!(err.consumption, 600);
        assert_eq!(err.requested, 500);
        assert_eq!(t.consumption(), 600);
    }

    #[test]
    fn unlimited_tracker_accepts_anything() {
        let t = MemTracker::unlimited("orphan");
        assert!(t.check_limit(i64::MAX / 2).is_ok());
    }
}
