//! Engine configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Process-wide hard memory limit in bytes. Negative means unlimited.
    pub hard_limit_bytes: i64,

    /// Probability in [0, 1] that an allocation check fails artificially.
    /// Exists so higher layers can exercise their out-of-memory recovery
    /// paths in tests; keep at 0.0 in production.
    pub alloc_fault_probability: f64,

    /// Maximum total time one task may spend waiting for memory to be
    /// reclaimed, in milliseconds. A task gets one full wait, ever.
    pub wait_reclaim_max_ms: u64,

    /// When true, a failed allocation returns an error to its caller.
    /// When false, the owning task is cancelled asynchronously and the
    /// allocating call itself reports success.
    pub sync_alloc_failure: bool,

    /// Append a captured backtrace to the diagnostic for requests larger
    /// than this many bytes. Zero or negative disables capture.
    pub large_alloc_backtrace_bytes: i64,

    /// Globally disable the wait-for-reclaim poll loop.
    pub disable_wait_reclaim: bool,

    /// Request immediate physical page population for mapped allocations
    /// (trades startup latency against later page-fault stalls).
    pub mmap_populate: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hard_limit_bytes: 4 * 1024 * 1024 * 1024, // 4 GiB default
            alloc_fault_probability: 0.0,
            wait_reclaim_max_ms: 1_000,
            sync_alloc_failure: false,
            large_alloc_backtrace_bytes: 2 * 1024 * 1024 * 1024,
            disable_wait_reclaim: false,
            mmap_populate: false,
        }
    }
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `QUERN_HARD_LIMIT_BYTES`: process hard memory limit in bytes
    /// - `QUERN_ALLOC_FAULT_PROBABILITY`: fault-injection probability
    /// - `QUERN_WAIT_RECLAIM_MAX_MS`: max wait-for-reclaim per task
    /// - `QUERN_SYNC_ALLOC_FAILURE`: "true"/"false"
    /// - `QUERN_LARGE_ALLOC_BACKTRACE_BYTES`: backtrace capture threshold
    /// - `QUERN_DISABLE_WAIT_RECLAIM`: "true"/"false"
    /// - `QUERN_MMAP_POPULATE`: "true"/"false"
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("QUERN_HARD_LIMIT_BYTES") {
            if let Ok(v) = s.parse::<i64>() {
                cfg.hard_limit_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("QUERN_ALLOC_FAULT_PROBABILITY") {
            if let Ok(v) = s.parse::<f64>() {
                cfg.alloc_fault_probability = v;
            }
        }

        if let Ok(s) = std::env::var("QUERN_WAIT_RECLAIM_MAX_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.wait_reclaim_max_ms = v;
            }
        }

        if let Ok(s) = std::env::var("QUERN_SYNC_ALLOC_FAILURE") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.sync_alloc_failure = v;
            }
        }

        if let Ok(s) = std::env::var("QUERN_LARGE_ALLOC_BACKTRACE_BYTES") {
            if let Ok(v) = s.parse::<i64>() {
                cfg.large_alloc_backtrace_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("QUERN_DISABLE_WAIT_RECLAIM") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.disable_wait_reclaim = v;
            }
        }

        if let Ok(s) = std::env::var("QUERN_MMAP_POPULATE") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.mmap_populate = v;
            }
        }

        cfg
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alloc_fault_probability) {
            return Err(Error::Config(format!(
                "alloc_fault_probability must be within [0, 1], got {}",
                self.alloc_fault_probability
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn fault_probability_out_of_range_is_rejected() {
        let cfg = EngineConfig {
            alloc_fault_probability: 1.5,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = EngineConfig {
            hard_limit_bytes: 123,
            sync_alloc_failure: true,
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hard_limit_bytes, 123);
        assert!(back.sync_alloc_failure);
    }
}
