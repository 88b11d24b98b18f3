//! Worker-side adapter between the queue engine's execution callback and
//! the lifecycle manager.
//!
//! [`JobHooks`] holds the four hook points. Each hook catches and logs its
//! own persistence failures, so monitoring never changes a job's business
//! outcome. [`JobProcessor`] adds a handler registry and runs the full
//! template around the handler for one delivered job.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, error};

use jobwarden_core::{EngineJobId, JobProgress, JobType, LogLevel, NewJob, OwnerId};

use super::lifecycle::JobLifecycle;
use super::logger::JobLogger;
use crate::queue::DequeuedJob;

/// Business logic for one job type.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: DequeuedJob, progress: ProgressReporter) -> anyhow::Result<JsonValue>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(DequeuedJob, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send,
{
    async fn handle(&self, job: DequeuedJob, progress: ProgressReporter) -> anyhow::Result<JsonValue> {
        (self.0)(job, progress).await
    }
}

/// Lifecycle hook points invoked around a job's execution.
#[derive(Clone)]
pub struct JobHooks {
    lifecycle: Arc<JobLifecycle>,
    logger: JobLogger,
}

impl JobHooks {
    pub fn new(lifecycle: Arc<JobLifecycle>, logger: JobLogger) -> Self {
        Self { lifecycle, logger }
    }

    /// Record the job (idempotent) and mark it active.
    pub async fn on_dequeue(&self, job: &DequeuedJob) {
        let mut new = NewJob::new(
            job.engine_job_id.clone(),
            job.queue_name.clone(),
            job.job_type,
            job.payload.clone(),
        )
        .with_priority(job.priority)
        .with_max_attempts(job.max_attempts);
        if let Some(owner_id) = owner_from_payload(&job.payload) {
            new = new.with_owner(owner_id);
        }

        if let Err(e) = self.lifecycle.create(new).await {
            error!(error = %e, queue = %job.queue_name, engine_job_id = %job.engine_job_id, "on_dequeue: failed to record job");
            return;
        }
        match self
            .lifecycle
            .mark_active(&job.queue_name, &job.engine_job_id)
            .await
        {
            Ok(_) => {
                self.logger
                    .log(
                        &job.queue_name,
                        &job.engine_job_id,
                        LogLevel::Info,
                        format!("attempt {} of {} started", job.attempts_made, job.max_attempts),
                        None,
                        None,
                    )
                    .await;
            }
            Err(e) => {
                error!(error = %e, queue = %job.queue_name, engine_job_id = %job.engine_job_id, "on_dequeue: failed to mark job active");
            }
        }
    }

    pub async fn on_progress(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
        percentage: u8,
        step: &str,
    ) {
        let progress = match JobProgress::new(percentage, step) {
            Ok(progress) => progress,
            Err(e) => {
                error!(error = %e, queue = %queue_name, engine_job_id = %engine_job_id, "on_progress: invalid progress");
                return;
            }
        };
        if let Err(e) = self
            .lifecycle
            .update_progress(queue_name, engine_job_id, progress)
            .await
        {
            error!(error = %e, queue = %queue_name, engine_job_id = %engine_job_id, "on_progress: failed to persist progress");
        }
        self.logger
            .log(
                queue_name,
                engine_job_id,
                LogLevel::Info,
                format!("progress {percentage}%: {step}"),
                None,
                None,
            )
            .await;
    }

    pub async fn on_success(&self, queue_name: &str, engine_job_id: &EngineJobId, result: &JsonValue) {
        if let Err(e) = self
            .lifecycle
            .complete(queue_name, engine_job_id, result.clone())
            .await
        {
            error!(error = %e, queue = %queue_name, engine_job_id = %engine_job_id, "on_success: failed to persist completion");
        }
        self.logger
            .log(queue_name, engine_job_id, LogLevel::Info, "job completed", None, None)
            .await;
    }

    /// Record a failed attempt. With `will_retry` the job goes to `Delayed`
    /// and waits for the engine's next delivery; otherwise it fails for good.
    pub async fn on_error(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
        err: &anyhow::Error,
        will_retry: bool,
    ) {
        let message = err.to_string();
        let stack_trace = Some(format!("{err:?}"));

        if will_retry {
            if let Err(e) = self.lifecycle.mark_delayed(queue_name, engine_job_id).await {
                error!(error = %e, queue = %queue_name, engine_job_id = %engine_job_id, "on_error: failed to mark job delayed");
            }
            self.logger
                .log(
                    queue_name,
                    engine_job_id,
                    LogLevel::Warning,
                    format!("attempt failed, engine will retry: {message}"),
                    None,
                    stack_trace,
                )
                .await;
            return;
        }

        if let Err(e) = self
            .lifecycle
            .fail(queue_name, engine_job_id, message.clone(), stack_trace.clone())
            .await
        {
            error!(error = %e, queue = %queue_name, engine_job_id = %engine_job_id, "on_error: failed to persist failure");
        }
        self.logger
            .log(
                queue_name,
                engine_job_id,
                LogLevel::Error,
                format!("job failed: {message}"),
                None,
                stack_trace,
            )
            .await;
    }
}

impl std::fmt::Debug for JobHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHooks").finish_non_exhaustive()
    }
}

/// Handed to a running handler so it can report progress and write job log lines.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    hooks: JobHooks,
    queue_name: String,
    engine_job_id: EngineJobId,
}

impl ProgressReporter {
    pub async fn report(&self, percentage: u8, step: &str) {
        self.hooks
            .on_progress(&self.queue_name, &self.engine_job_id, percentage, step)
            .await;
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.hooks
            .logger
            .log(&self.queue_name, &self.engine_job_id, level, message, None, None)
            .await;
    }
}

/// Handler registry plus the hook template.
pub struct JobProcessor {
    hooks: JobHooks,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobProcessor {
    pub fn new(hooks: JobHooks) -> Self {
        Self {
            hooks,
            handlers: HashMap::new(),
        }
    }

    pub fn hooks(&self) -> &JobHooks {
        &self.hooks
    }

    /// Register the handler for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: JobType, handler: impl JobHandler + 'static) {
        self.handlers.insert(job_type, Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: JobType, handler: F)
    where
        F: Fn(DequeuedJob, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
    {
        self.register(job_type, FnHandler(handler));
    }

    /// Run one delivered job through `on_dequeue`, its handler, then
    /// `on_success` or `on_error`. The handler's outcome is returned unchanged.
    pub async fn execute(&self, job: DequeuedJob) -> anyhow::Result<JsonValue> {
        self.hooks.on_dequeue(&job).await;

        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            let err = anyhow::anyhow!("no handler registered for job type {}", job.job_type);
            self.hooks
                .on_error(&job.queue_name, &job.engine_job_id, &err, false)
                .await;
            return Err(err);
        };

        let reporter = ProgressReporter {
            hooks: self.hooks.clone(),
            queue_name: job.queue_name.clone(),
            engine_job_id: job.engine_job_id.clone(),
        };
        let queue_name = job.queue_name.clone();
        let engine_job_id = job.engine_job_id.clone();
        let will_retry = job.will_retry_on_failure();

        match handler.handle(job, reporter).await {
            Ok(result) => {
                debug!(queue = %queue_name, engine_job_id = %engine_job_id, "handler succeeded");
                self.hooks.on_success(&queue_name, &engine_job_id, &result).await;
                Ok(result)
            }
            Err(err) => {
                debug!(queue = %queue_name, engine_job_id = %engine_job_id, error = %err, "handler failed");
                self.hooks
                    .on_error(&queue_name, &engine_job_id, &err, will_retry)
                    .await;
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Producers may tag a payload with `"ownerId"`; anything unparseable is ignored.
fn owner_from_payload(payload: &JsonValue) -> Option<OwnerId> {
    payload.get("ownerId")?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueueEngine, QueueController};
    use crate::store::{InMemoryJobStore, JobStore};
    use jobwarden_core::JobStatus;
    use serde_json::json;

    fn processor() -> (JobProcessor, Arc<InMemoryJobStore>) {
        let store = InMemoryJobStore::arc();
        let queues = Arc::new(QueueController::new().with_queue(Arc::new(InMemoryQueueEngine::new("sync"))));
        let lifecycle = Arc::new(JobLifecycle::new(store.clone(), queues));
        let hooks = JobHooks::new(lifecycle, JobLogger::new(store.clone()));
        (JobProcessor::new(hooks), store)
    }

    fn delivered(id: &str, attempts_made: u32, max_attempts: u32) -> DequeuedJob {
        DequeuedJob {
            queue_name: "sync".into(),
            engine_job_id: EngineJobId::from(id),
            job_type: JobType::EmailSync,
            payload: json!({"mailbox": "inbox"}),
            priority: Default::default(),
            attempts_made,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn failing_handler_result_is_returned_unchanged() {
        let (mut processor, store) = processor();
        processor.register_fn(JobType::EmailSync, |_job, _progress| async {
            Err(anyhow::anyhow!("imap timeout"))
        });

        let err = processor.execute(delivered("1", 1, 1)).await.unwrap_err();
        assert_eq!(err.to_string(), "imap timeout");

        let job = store
            .find_by_engine_id("sync", &EngineJobId::from("1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("imap timeout"));
    }

    #[tokio::test]
    async fn retryable_failure_marks_job_delayed_then_reactivates() {
        let (mut processor, store) = processor();
        processor.register_fn(JobType::EmailSync, |job, _progress| async move {
            if job.attempts_made < 2 {
                Err(anyhow::anyhow!("flaky"))
            } else {
                Ok(json!({"synced": 12}))
            }
        });

        assert!(processor.execute(delivered("1", 1, 3)).await.is_err());
        let job = store
            .find_by_engine_id("sync", &EngineJobId::from("1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Delayed);

        processor.execute(delivered("1", 2, 3)).await.unwrap();
        let job = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn missing_handler_fails_the_job() {
        let (processor, store) = processor();
        assert!(processor.execute(delivered("7", 1, 3)).await.is_err());
        let job = store
            .find_by_engine_id("sync", &EngineJobId::from("7"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn invalid_progress_does_not_abort_the_handler() {
        let (mut processor, _) = processor();
        processor.register_fn(JobType::EmailSync, |_job, progress| async move {
            progress.report(250, "impossible").await;
            Ok(json!("done"))
        });
        assert_eq!(processor.execute(delivered("3", 1, 3)).await.unwrap(), json!("done"));
    }

    #[test]
    fn owner_is_read_from_payload_when_present() {
        let owner = OwnerId::new();
        assert_eq!(owner_from_payload(&json!({"ownerId": owner.to_string()})), Some(owner));
        assert_eq!(owner_from_payload(&json!({"ownerId": "not-a-uuid"})), None);
        assert_eq!(owner_from_payload(&json!([1, 2])), None);
    }
}
