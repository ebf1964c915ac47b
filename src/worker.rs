use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::errors::Error;
use crate::interval;
use crate::job_registry::JobRegistry;
use crate::schema::ScheduledJob;
use crate::storage::JobStore;
use crate::util;

/// Executes claimed jobs and writes back their outcome.
#[derive(Clone)]
pub(crate) struct Worker {
    pub(crate) store: JobStore,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) worker_id: Arc<str>,
    pub(crate) max_retry_count: u32,
    pub(crate) cleanup_finished_jobs: bool,
}

impl Worker {
    /// Run one claimed job to completion and record the result.
    ///
    /// Store failures during write-back are logged, never raised: the lock
    /// expires on its own and the job is reclaimed then.
    pub(crate) async fn run_job(&self, job: ScheduledJob) {
        let span = info_span!("job", job.id = %job.id, job.name = %job.name);
        self.run_job_inner(&job).instrument(span).await;
    }

    async fn run_job_inner(&self, job: &ScheduledJob) {
        let started_at = Utc::now();
        debug!("Running job…");

        // Next-run computation is inside the fallible path: a job whose
        // stored schedule no longer parses counts as a failed attempt.
        let outcome = match self.execute(job).await {
            Ok(()) => {
                let finished_at = Utc::now();
                interval::compute_next_run_at(
                    job.repeat_interval.as_deref(),
                    job.repeat_timezone.as_deref(),
                    job.next_run_at.map(|at| at.to_chrono()),
                    Some(finished_at),
                )
                .map(|next_run_at| (finished_at, next_run_at))
                .map_err(anyhow::Error::from)
            }
            Err(error) => Err(error),
        };

        match outcome {
            Ok((finished_at, next_run_at)) => {
                debug!("Job succeeded");
                self.finalize_success(job, started_at, finished_at, next_run_at)
                    .await;
            }
            Err(error) => {
                warn!(%error, "Job failed");
                self.finalize_failure(job).await;
            }
        }
    }

    /// Resolve the handler and run it, converting panics into failures.
    async fn execute(&self, job: &ScheduledJob) -> anyhow::Result<()> {
        let Some(run) = self.registry.get(&job.name) else {
            return Err(Error::UnknownHandler(job.name.clone()).into());
        };

        AssertUnwindSafe(run(job.data.clone()))
            .catch_unwind()
            .await
            .map_err(|panic| util::panic_error(&*panic))
            .and_then(std::convert::identity)
    }

    async fn finalize_success(
        &self,
        job: &ScheduledJob,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) {
        if next_run_at.is_none() && self.cleanup_finished_jobs {
            debug!("Deleting finished one-shot job…");
            if let Err(error) = self.store.delete_by_id(job.id).await {
                error!(%error, "Failed to delete finished job");
            }
            return;
        }

        match self
            .store
            .mark_success(job.id, &self.worker_id, started_at, finished_at, next_run_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("Job lease no longer held; skipping success write-back"),
            Err(error) => error!(%error, "Failed to record job success"),
        }
    }

    async fn finalize_failure(&self, job: &ScheduledJob) {
        let failed_at = Utc::now();
        let attempt = u32::try_from(job.fail_count.max(0)).unwrap_or(u32::MAX).saturating_add(1);

        let next_run_at = if self.max_retry_count > 0 && attempt >= self.max_retry_count {
            warn!(
                attempt,
                max_retry_count = self.max_retry_count,
                "Job reached its retry limit; disabling further runs"
            );
            None
        } else {
            failed_at.checked_add_signed(retry_delay(attempt))
        };

        match self
            .store
            .mark_failure(job.id, &self.worker_id, failed_at, next_run_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("Job lease no longer held; skipping failure write-back"),
            Err(error) => error!(%error, "Failed to record job failure"),
        }
    }
}

/// Retry delay for handler failures. `attempt` starts at 1 (first failure):
/// 10s, 20s, 40s, 80s… capped at 10 minutes.
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let millis = (10_000_u64 << exp).min(600_000);
    Duration::milliseconds(millis as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        assert_eq!(retry_delay(1), Duration::seconds(10));
        assert_eq!(retry_delay(2), Duration::seconds(20));
        assert_eq!(retry_delay(3), Duration::seconds(40));
        assert_eq!(retry_delay(4), Duration::seconds(80));
        assert_eq!(retry_delay(5), Duration::seconds(160));
        assert_eq!(retry_delay(6), Duration::seconds(320));
        assert_eq!(retry_delay(7), Duration::seconds(600));
        assert_eq!(retry_delay(50), Duration::seconds(600));
        assert_eq!(retry_delay(u32::MAX), Duration::seconds(600));
    }

    #[test]
    fn retry_delay_floors_at_first_attempt() {
        assert_eq!(retry_delay(0), Duration::seconds(10));
    }
}
