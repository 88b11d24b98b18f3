//! Structured per-job log lines.
//!
//! Writing a log line never fails the caller: an unknown engine id or a store
//! error drops the line with a local diagnostic.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{error, warn};

use jobwarden_core::{EngineJobId, JobId, JobLogEntry, LogLevel};

use crate::error::JobResult;
use crate::store::JobStore;

pub const DEFAULT_RECENT_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct JobLogger {
    store: Arc<dyn JobStore>,
}

impl JobLogger {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Append a line to the job identified by `(queue, engine job id)`.
    ///
    /// Returns the stored entry, or `None` when the line was dropped.
    pub async fn log(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
        level: LogLevel,
        message: impl Into<String>,
        context: Option<JsonValue>,
        stack_trace: Option<String>,
    ) -> Option<JobLogEntry> {
        let message = message.into();
        let job = match self.store.find_by_engine_id(queue_name, engine_job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(
                    queue = %queue_name,
                    engine_job_id = %engine_job_id,
                    %level,
                    message = %message,
                    "dropping job log line: no job record for engine id"
                );
                return None;
            }
            Err(e) => {
                error!(error = %e, queue = %queue_name, engine_job_id = %engine_job_id, "dropping job log line: lookup failed");
                return None;
            }
        };
        self.log_for(job.id, level, message, context, stack_trace).await
    }

    /// Append a line to the job with record id `job_id`.
    pub async fn log_for(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: impl Into<String>,
        context: Option<JsonValue>,
        stack_trace: Option<String>,
    ) -> Option<JobLogEntry> {
        let entry = JobLogEntry::new(job_id, level, message, Utc::now())
            .with_context(context)
            .with_stack_trace(stack_trace);
        match self.store.append_log(entry).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                error!(error = %e, job_id = %job_id, "dropping job log line: append failed");
                None
            }
        }
    }

    /// Most recent lines for a job, newest first.
    pub async fn recent(&self, job_id: JobId, limit: Option<u32>) -> JobResult<Vec<JobLogEntry>> {
        Ok(self
            .store
            .recent_logs(job_id, limit.unwrap_or(DEFAULT_RECENT_LIMIT))
            .await?)
    }
}

impl std::fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLogger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryJobStore, JobStore};
    use jobwarden_core::{Job, JobType, NewJob};
    use serde_json::json;

    #[tokio::test]
    async fn log_resolves_engine_id_and_orders_newest_first() {
        let store = InMemoryJobStore::arc();
        let job = store
            .create(Job::new(
                NewJob::new("9", "reports", JobType::ReportGeneration, json!({})),
                Utc::now(),
            ))
            .await
            .unwrap();
        let logger = JobLogger::new(store.clone());
        let id = EngineJobId::from("9");

        logger.log("reports", &id, LogLevel::Info, "started", None, None).await.unwrap();
        logger
            .log("reports", &id, LogLevel::Error, "boom", Some(json!({"step": 2})), Some("trace".into()))
            .await
            .unwrap();

        let lines = logger.recent(job.id, None).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "boom");
        assert_eq!(lines[0].level, LogLevel::Error);
        assert_eq!(lines[0].context, Some(json!({"step": 2})));
        assert_eq!(lines[1].message, "started");
    }

    #[tokio::test]
    async fn unknown_engine_id_drops_the_line() {
        let logger = JobLogger::new(InMemoryJobStore::arc());
        let dropped = logger
            .log("reports", &EngineJobId::from("nope"), LogLevel::Info, "hello", None, None)
            .await;
        assert!(dropped.is_none());
    }
}
