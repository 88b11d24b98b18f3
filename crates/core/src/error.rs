//! Domain error model.

use thiserror::Error;

use crate::job::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, state-machine violations).
/// Storage and queue-engine failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The requested transition is not allowed from the job's current status.
    #[error("cannot {action} a job in status {from}")]
    InvalidTransition { from: JobStatus, action: &'static str },

    /// The job can no longer be cancelled.
    #[error("job in status {0} cannot be cancelled")]
    NotCancelable(JobStatus),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(from: JobStatus, action: &'static str) -> Self {
        Self::InvalidTransition { from, action }
    }
}
