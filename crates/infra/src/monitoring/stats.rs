//! Aggregate job statistics, computed fresh on every call.

use std::sync::Arc;

use serde::Serialize;

use jobwarden_core::{JobStatus, JobType, OwnerId};

use crate::error::JobResult;
use crate::store::{JobStore, StatusCounts};

/// Percentage of finished jobs that completed; 0 when nothing has finished.
pub fn success_rate(completed: u64, failed: u64) -> f64 {
    let finished = completed + failed;
    if finished == 0 {
        0.0
    } else {
        completed as f64 / finished as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStats {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub count: u64,
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsOverview {
    pub total: u64,
    pub by_status: StatusCounts,
    pub success_rate: f64,
    /// Milliseconds, over completed jobs with a positive duration.
    pub avg_duration: f64,
    pub by_type: Vec<TypeStats>,
}

#[derive(Clone)]
pub struct StatisticsAggregator {
    store: Arc<dyn JobStore>,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn overview(&self, owner_id: Option<OwnerId>) -> JobResult<StatsOverview> {
        let by_status = self.store.aggregate_by_status(owner_id).await?;
        let avg_duration = self
            .store
            .avg_duration(JobStatus::Completed, owner_id)
            .await?;
        let by_type = self
            .store
            .aggregate_by_type(owner_id)
            .await?
            .into_iter()
            .map(|t| TypeStats {
                job_type: t.job_type,
                count: t.count,
                completed: t.completed,
                failed: t.failed,
                success_rate: success_rate(t.completed, t.failed),
                avg_duration: t.avg_duration_ms,
            })
            .collect();

        Ok(StatsOverview {
            total: by_status.total(),
            success_rate: success_rate(by_status.completed, by_status.failed),
            by_status,
            avg_duration,
            by_type,
        })
    }
}

impl std::fmt::Debug for StatisticsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsAggregator").finish_non_exhaustive()
    }
}
