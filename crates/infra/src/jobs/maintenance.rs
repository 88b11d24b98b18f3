//! Built-in handlers for the maintenance job types the scheduler enqueues.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use tracing::info;

use jobwarden_core::{JobType, LogLevel};

use super::processor::{JobHandler, JobProcessor, ProgressReporter};
use crate::queue::{DequeuedJob, QueueController};

/// `CACHE_CLEANUP`: removes finished engine jobs older than `grace` from every queue.
pub struct CacheCleanupHandler {
    queues: Arc<QueueController>,
    grace: Duration,
}

impl CacheCleanupHandler {
    pub fn new(queues: Arc<QueueController>, grace: Duration) -> Self {
        Self { queues, grace }
    }
}

#[async_trait::async_trait]
impl JobHandler for CacheCleanupHandler {
    async fn handle(&self, _job: DequeuedJob, progress: ProgressReporter) -> anyhow::Result<JsonValue> {
        let names: Vec<String> = self.queues.names().map(str::to_string).collect();
        let mut removed = 0;
        for (done, name) in names.iter().enumerate() {
            let n = self.queues.clean(name, self.grace).await?;
            removed += n;
            if n > 0 {
                progress
                    .log(LogLevel::Info, format!("removed {n} finished jobs from {name}"))
                    .await;
            }
            let percentage = ((done + 1) * 100 / names.len()) as u8;
            progress.report(percentage, name).await;
        }
        info!(removed, queues = names.len(), "cache cleanup finished");
        Ok(json!({ "removed": removed, "queues": names.len() }))
    }
}

/// Register every built-in handler on `processor`.
pub fn register_builtin_handlers(
    processor: &mut JobProcessor,
    queues: Arc<QueueController>,
    cache_cleanup_grace: Duration,
) {
    processor.register(
        JobType::CacheCleanup,
        CacheCleanupHandler::new(queues, cache_cleanup_grace),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobHooks, JobLifecycle, JobLogger, SubmitOptions};
    use crate::queue::{EngineJobState, InMemoryQueueEngine, QueueEngine};
    use crate::store::{InMemoryJobStore, JobStore};
    use jobwarden_core::JobStatus;

    #[tokio::test]
    async fn cache_cleanup_cleans_every_queue_and_completes() {
        let store = InMemoryJobStore::arc();
        let reports = Arc::new(InMemoryQueueEngine::new("reports"));
        let maintenance = Arc::new(InMemoryQueueEngine::new("maintenance"));
        let queues = Arc::new(
            QueueController::new()
                .with_queue(reports.clone())
                .with_queue(maintenance.clone()),
        );
        let lifecycle = Arc::new(JobLifecycle::new(store.clone(), queues.clone()));
        let mut processor =
            JobProcessor::new(JobHooks::new(lifecycle.clone(), JobLogger::new(store.clone())));
        register_builtin_handlers(&mut processor, queues.clone(), Duration::ZERO);

        // One finished report job for the cleanup to remove.
        lifecycle
            .submit("reports", JobType::ReportGeneration, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let done = reports.dequeue().unwrap().unwrap();
        assert_eq!(
            reports.finish(&done.engine_job_id, true).unwrap(),
            EngineJobState::Completed
        );

        let cleanup = lifecycle
            .submit("maintenance", JobType::CacheCleanup, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let delivered = maintenance.dequeue().unwrap().unwrap();
        let result = processor.execute(delivered).await.unwrap();

        assert_eq!(result["removed"], 1);
        assert_eq!(result["queues"], 2);
        assert_eq!(reports.counts().await.unwrap().completed, 0);
        let record = store.find_by_id(cleanup.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress.unwrap().percentage, 100);
    }
}
