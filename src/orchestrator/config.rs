use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for a [`Pipeline`](crate::orchestrator::Pipeline).
///
/// An explicit value injected at construction; there is no module-level
/// mutable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum units of one batch driven concurrently. A batch with fewer
    /// pending units uses fewer workers.
    pub concurrency_ceiling: usize,

    /// Retry budget stamped onto every unit at creation
    pub max_attempts: u32,

    /// Base of the exponential backoff: the sleep after attempt `n` is
    /// `backoff_base_seconds ^ n` seconds (2s, 4s, 8s, 16s with the default)
    pub backoff_base_seconds: u64,

    /// Ceiling on a single backoff sleep
    pub max_backoff: Duration,

    /// Add up to 10% random jitter to each backoff sleep
    pub jitter: bool,

    /// How long a unit may sit `Running` without a write before the
    /// staleness query reports it orphaned
    pub stale_after: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency_ceiling: 4,
            max_attempts: 3,
            backoff_base_seconds: 2,
            max_backoff: Duration::from_secs(60),
            jitter: true,
            stale_after: Duration::from_secs(30 * 60),
        }
    }
}
