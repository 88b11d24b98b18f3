//! Stuck-job detection.
//!
//! Staleness is judged only from the persisted `started_at`; the queue
//! engine's own liveness signals are never consulted.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::error::JobResult;
use crate::jobs::JobLifecycle;

pub const DEFAULT_STALE_THRESHOLD_MINUTES: i64 = 30;

#[derive(Debug, Clone)]
pub struct StuckJobDetector {
    lifecycle: Arc<JobLifecycle>,
    threshold: Duration,
}

impl StuckJobDetector {
    pub fn new(lifecycle: Arc<JobLifecycle>) -> Self {
        Self {
            lifecycle,
            threshold: Duration::minutes(DEFAULT_STALE_THRESHOLD_MINUTES),
        }
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Mark every job active since before `now - threshold` as stuck.
    ///
    /// Returns how many jobs were transitioned. A job that finished or was
    /// deleted between the scan and its transition is skipped.
    pub async fn sweep(&self) -> JobResult<u64> {
        let cutoff = Utc::now() - self.threshold;
        let candidates = self
            .lifecycle
            .store()
            .find_active_started_before(cutoff)
            .await?;

        let mut marked = 0;
        for job in candidates {
            match self.lifecycle.mark_stuck(job.id).await {
                Ok(Some(stuck)) => {
                    warn!(
                        job_id = %stuck.id,
                        queue = %stuck.queue_name,
                        started_at = ?stuck.started_at,
                        "job marked stuck"
                    );
                    marked += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to mark job stuck");
                }
            }
        }

        info!(marked, threshold_minutes = self.threshold.num_minutes(), "stuck-job sweep finished");
        Ok(marked)
    }
}
