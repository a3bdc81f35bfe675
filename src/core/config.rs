//! Streaming configuration surface
//!
//! All knobs are fixed at model-load time and shared by the download
//! manager, the resident buffer and the sorter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable parameters for the streaming core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Resident buffer budget in bytes
    pub memory_budget_bytes: usize,
    /// Maximum number of tile fetches in flight
    pub max_concurrent_fetches: usize,
    /// Failed attempts are retried this many times before a tile is marked Failed
    pub retry_limit: u32,
    /// Base backoff delay after a failed attempt (milliseconds)
    pub backoff_base_ms: u64,
    /// Upper bound on the backoff delay (milliseconds)
    pub backoff_cap_ms: u64,
    /// Depth key resolution: the sorter uses `1 << depth_bucket_bits` buckets
    pub depth_bucket_bits: u32,
    /// Async results older than this many generations are discarded on arrival
    pub generation_drift: u64,
    /// Angular footprint (extent / distance) above which a tile refines to
    /// its children; at exactly the threshold the coarser level wins
    pub refine_threshold: f32,
    /// Fraction of the budget `enforce_budget` reclaims down to
    pub target_utilization: f32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 512 * 1024 * 1024,
            max_concurrent_fetches: 8,
            retry_limit: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 5_000,
            depth_bucket_bits: 16,
            generation_drift: 2,
            refine_threshold: 0.35,
            target_utilization: 0.9,
        }
    }
}

impl StreamingConfig {
    /// Backoff delay before the given retry (1-based), exponential with a cap.
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        let exp = retries.saturating_sub(1).min(16);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.backoff_cap_ms))
    }
}
