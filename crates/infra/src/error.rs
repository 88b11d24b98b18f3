//! Operator-facing error taxonomy for job orchestration.

use jobwarden_core::{DomainError, JobId, JobStatus};

use crate::queue::EngineError;
use crate::store::StoreError;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("cannot {action} job {job_id} in status {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        action: &'static str,
    },

    #[error("job {job_id} in status {status} cannot be cancelled")]
    NotCancelable { job_id: JobId, status: JobStatus },

    #[error("queue engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl JobError {
    /// Attach the job id to a domain state-machine rejection.
    pub fn from_domain(job_id: JobId, err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, action } => JobError::InvalidTransition {
                job_id,
                from,
                action,
            },
            DomainError::NotCancelable(status) => JobError::NotCancelable { job_id, status },
            other => other.into(),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => JobError::NotFound(id.to_string()),
            StoreError::Storage(msg) | StoreError::Serialization(msg) => JobError::Persistence(msg),
        }
    }
}

impl From<EngineError> for JobError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::JobNotFound(id) => JobError::NotFound(format!("engine job {id}")),
            EngineError::Unavailable(msg) | EngineError::Rejected(msg) => {
                JobError::EngineUnavailable(msg)
            }
        }
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobError::Validation(msg),
            // Without a job id there is nothing better to attach; callers that have one use `from_domain`.
            other => JobError::Validation(other.to_string()),
        }
    }
}
