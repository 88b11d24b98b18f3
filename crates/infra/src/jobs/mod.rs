//! Job lifecycle, logging and worker-side processing.
//!
//! ## Components
//!
//! - `JobLifecycle`: guarded state transitions over the record store, plus operator retry/cancel
//! - `JobLogger`: per-job structured log lines that never fail the caller
//! - `JobHooks` / `JobProcessor`: worker-side hook template and handler registry
//! - `CacheCleanupHandler`: built-in handler for scheduler-enqueued maintenance work
//! - `spawn_worker`: polling worker over any `JobSource`

pub mod lifecycle;
pub mod logger;
pub mod maintenance;
pub mod processor;
pub mod worker;

pub use lifecycle::{JobLifecycle, SubmitOptions};
pub use logger::{DEFAULT_RECENT_LIMIT, JobLogger};
pub use maintenance::{CacheCleanupHandler, register_builtin_handlers};
pub use processor::{FnHandler, JobHandler, JobHooks, JobProcessor, ProgressReporter};
pub use worker::{WorkerConfig, WorkerHandle, WorkerStats, spawn_worker};
