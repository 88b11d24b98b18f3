//! `jobwarden-core`: job model and lifecycle state machine.
//!
//! This crate contains **pure domain** types (no storage or queue-engine concerns).

pub mod error;
pub mod id;
pub mod job;
pub mod log;

pub use error::{DomainError, DomainResult};
pub use id::{EngineJobId, JobId, LogEntryId, OwnerId};
pub use job::{
    Job, JobPriority, JobProgress, JobResult, JobStatus, JobType, NewJob, Transition,
};
pub use log::{JobLogEntry, LogLevel};
