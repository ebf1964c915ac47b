//! Runtime configuration for scheduler behavior.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for a scheduler node.
///
/// All fields have working defaults; deserialize from your application
/// configuration (keys are kebab-case) or build one programmatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulerConfig {
    /// Master switch; a disabled scheduler ignores `start`.
    pub enabled: bool,
    /// Lease owner string; blank or absent means auto-generated from
    /// hostname, pid, and a random suffix.
    pub worker_id: Option<String>,
    /// Poll cadence; also the width of each claim window.
    pub process_every: Duration,
    /// Lease granted on claim, and the shutdown grace for in-flight jobs.
    pub default_lock_lifetime: Duration,
    /// Node-wide cap on concurrently running handlers.
    pub max_concurrency: usize,
    /// Per-handler-name cap on concurrently running handlers.
    pub default_concurrency: usize,
    /// Cap on in-flight plus queued locked jobs; 0 means unbounded.
    pub lock_limit: usize,
    /// Maximum jobs claimed per store round-trip.
    pub batch_size: usize,
    /// Failures after which a job stops being rescheduled; 0 retries forever.
    pub max_retry_count: u32,
    /// Delete one-shot jobs after a successful run.
    pub cleanup_finished_jobs: bool,
    /// Create the required indexes at startup instead of leaving them to
    /// operators.
    pub ensure_indexes_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enabled: true,
            worker_id: None,
            process_every: Duration::from_secs(5),
            default_lock_lifetime: Duration::from_secs(10 * 60),
            max_concurrency: 20,
            default_concurrency: 5,
            lock_limit: 0,
            batch_size: 5,
            max_retry_count: 5,
            cleanup_finished_jobs: true,
            ensure_indexes_on_startup: false,
        }
    }
}
