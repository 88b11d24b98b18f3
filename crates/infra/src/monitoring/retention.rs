//! Retention sweep over the record store.
//!
//! Deletes job records (and, by cascade, their log lines). Engine-side
//! cleanup is the queue controller's `clean`, not this.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use jobwarden_core::JobStatus;

use crate::error::{JobError, JobResult};
use crate::store::JobStore;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Largest accepted `older_than_days` (roughly a century).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Delete records created more than `older_than_days` ago, oldest first.
    ///
    /// `status` restricts the sweep to one status; `limit` bounds the batch.
    pub async fn clean(
        &self,
        older_than_days: Option<u32>,
        status: Option<JobStatus>,
        limit: Option<u64>,
    ) -> JobResult<u64> {
        let days = older_than_days.unwrap_or(DEFAULT_RETENTION_DAYS);
        let cutoff = cutoff_for(days, Utc::now())?;
        let deleted = self
            .store
            .bulk_delete_older_than(cutoff, status, limit)
            .await?;
        info!(deleted, older_than_days = days, status = ?status, limit = ?limit, "retention sweep finished");
        Ok(deleted)
    }
}

/// Creation-time cutoff `days` before `now`.
fn cutoff_for(days: u32, now: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
    if !(1..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(JobError::Validation(format!(
            "olderThanDays must be between 1 and {MAX_RETENTION_DAYS}, got {days}"
        )));
    }
    Duration::try_days(i64::from(days))
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| JobError::Validation(format!("olderThanDays {days} is out of range")))
}

impl std::fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweeper").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryJobStore, JobFilter, PageRequest};
    use jobwarden_core::{Job, JobType, NewJob};
    use serde_json::json;

    fn created_days_ago(engine_id: &str, days: i64, status: JobStatus) -> Job {
        let mut job = Job::new(
            NewJob::new(engine_id, "maintenance", JobType::CacheCleanup, json!({})),
            Utc::now() - Duration::days(days),
        );
        job.status = status;
        job
    }

    async fn remaining(store: &InMemoryJobStore) -> Vec<String> {
        let mut ids: Vec<String> = store
            .query(&JobFilter::default(), &PageRequest::new(None, Some(100)))
            .await
            .unwrap()
            .items
            .into_iter()
            .map(|j| j.engine_job_id.to_string())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn deletes_only_rows_older_than_the_cutoff() {
        let store = InMemoryJobStore::arc();
        store.put(created_days_ago("old", 31, JobStatus::Completed)).unwrap();
        store.put(created_days_ago("young", 29, JobStatus::Completed)).unwrap();

        let sweeper = RetentionSweeper::new(store.clone());
        assert_eq!(sweeper.clean(Some(30), None, None).await.unwrap(), 1);
        assert_eq!(remaining(&store).await, vec!["young"]);
    }

    #[tokio::test]
    async fn status_filter_restricts_deletion() {
        let store = InMemoryJobStore::arc();
        store.put(created_days_ago("done", 40, JobStatus::Completed)).unwrap();
        store.put(created_days_ago("broken", 40, JobStatus::Failed)).unwrap();

        let sweeper = RetentionSweeper::new(store.clone());
        assert_eq!(sweeper.clean(None, Some(JobStatus::Failed), None).await.unwrap(), 1);
        assert_eq!(remaining(&store).await, vec!["done"]);
    }

    #[tokio::test]
    async fn limit_bounds_the_batch() {
        let store = InMemoryJobStore::arc();
        for i in 0..5 {
            store.put(created_days_ago(&format!("j{i}"), 40 + i, JobStatus::Completed)).unwrap();
        }
        let sweeper = RetentionSweeper::new(store.clone());
        assert_eq!(sweeper.clean(Some(30), None, Some(2)).await.unwrap(), 2);
        // Oldest go first.
        assert_eq!(remaining(&store).await, vec!["j0", "j1", "j2"]);
    }

    #[tokio::test]
    async fn zero_days_is_rejected() {
        let sweeper = RetentionSweeper::new(InMemoryJobStore::arc());
        assert!(matches!(
            sweeper.clean(Some(0), None, None).await,
            Err(JobError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn day_counts_past_the_maximum_are_rejected() {
        let store = InMemoryJobStore::arc();
        store.put(created_days_ago("old", 400, JobStatus::Completed)).unwrap();
        let sweeper = RetentionSweeper::new(store.clone());

        for days in [MAX_RETENTION_DAYS + 1, u32::MAX] {
            assert!(matches!(
                sweeper.clean(Some(days), None, None).await,
                Err(JobError::Validation(_))
            ));
        }
        assert_eq!(remaining(&store).await, vec!["old"]);
        assert_eq!(sweeper.clean(Some(MAX_RETENTION_DAYS), None, None).await.unwrap(), 0);
    }

    #[test]
    fn cutoff_near_the_start_of_time_does_not_overflow() {
        let early = DateTime::<Utc>::MIN_UTC + Duration::days(10);
        assert!(matches!(cutoff_for(365, early), Err(JobError::Validation(_))));
        assert_eq!(
            cutoff_for(10, early).unwrap(),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
