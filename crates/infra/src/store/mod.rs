//! Durable job record store.
//!
//! Persistence contract over two entities, `Job` and `JobLogEntry`, with no
//! business logic of its own. All writes are single-row; job state changes
//! go through [`JobStore::update`], which is a compare-and-set on the status
//! the caller read, so concurrent writers never silently undo each other's
//! transitions.

pub mod in_memory;
pub mod postgres;
pub mod query;

use chrono::{DateTime, Utc};

use jobwarden_core::{EngineJobId, Job, JobId, JobLogEntry, JobStatus, OwnerId};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use query::{
    JobFilter, Page, PageRequest, SortDirection, SortField, StatusCounts, TypeBreakdown,
};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Job record store abstraction.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record.
    ///
    /// Idempotent on `(queue_name, engine_job_id)`: if a record already exists
    /// for that pair it is returned unchanged and `job` is discarded.
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn find_by_engine_id(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
    ) -> Result<Option<Job>, StoreError>;

    /// Overwrite a record, but only if its stored status is still `expected_status`.
    ///
    /// Returns `false` when the guard did not match (another writer got there first).
    /// Returns `NotFound` when the record no longer exists.
    async fn update(&self, job: &Job, expected_status: JobStatus) -> Result<bool, StoreError>;

    /// Filtered, sorted, paginated listing with a total count.
    async fn query(&self, filter: &JobFilter, page: &PageRequest) -> Result<Page<Job>, StoreError>;

    /// Delete a record and its log lines. Returns whether a record was removed.
    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;

    /// Delete records created before `cutoff`, oldest first, at most `limit` rows.
    async fn bulk_delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        status: Option<JobStatus>,
        limit: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Active records whose `started_at` is before `cutoff`.
    async fn find_active_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    async fn aggregate_by_status(&self, owner_id: Option<OwnerId>)
    -> Result<StatusCounts, StoreError>;

    async fn aggregate_by_type(
        &self,
        owner_id: Option<OwnerId>,
    ) -> Result<Vec<TypeBreakdown>, StoreError>;

    /// Mean duration over records in `status` with a positive duration; 0 when there are none.
    async fn avg_duration(
        &self,
        status: JobStatus,
        owner_id: Option<OwnerId>,
    ) -> Result<f64, StoreError>;

    /// Every owner that has at least one job record.
    async fn distinct_owner_ids(&self) -> Result<Vec<OwnerId>, StoreError>;

    /// Append a log line. The store assigns `created_at`, non-decreasing per job.
    async fn append_log(&self, entry: JobLogEntry) -> Result<JobLogEntry, StoreError>;

    /// Most recent log lines for a job, newest first.
    async fn recent_logs(&self, job_id: JobId, limit: u32) -> Result<Vec<JobLogEntry>, StoreError>;
}
