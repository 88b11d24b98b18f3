//! Infrastructure layer: job record stores, queue engine adapters, the
//! lifecycle manager, monitoring sweeps, the scheduler and configuration.

pub mod config;
pub mod error;
pub mod jobs;
pub mod monitoring;
pub mod queue;
pub mod scheduler;
pub mod store;


pub use error::{JobError, JobResult};
