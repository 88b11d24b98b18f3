//! Job lifecycle manager.
//!
//! Every transition is a guarded read-check-write: load the record, let the
//! domain state machine check the precondition, then write back with a
//! compare-and-set on the status that was read.
//!
//! Worker callbacks (`mark_active`, `update_progress`, `complete`, `fail`,
//! `mark_delayed`) address jobs by `(queue, engine job id)` and tolerate
//! stale delivery: an unknown engine id, a duplicate terminal callback or a
//! lost compare-and-set is logged at WARN and reported as `Ok(None)`.
//! Operator calls (`retry`, `cancel`) address jobs by record id and surface
//! every failure.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use jobwarden_core::{
    DomainResult, EngineJobId, Job, JobId, JobPriority, JobProgress, JobType, NewJob, OwnerId,
    Transition,
};

use crate::error::{JobError, JobResult};
use crate::queue::{EngineJobState, EnqueueOptions, QueueController};
use crate::store::{JobStore, StoreError};

/// Options for [`JobLifecycle::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: JobPriority,
    /// Falls back to the lifecycle's default when unset.
    pub max_attempts: Option<u32>,
    pub owner_id: Option<OwnerId>,
    pub timeout_ms: Option<u64>,
}

impl SubmitOptions {
    pub fn for_owner(owner_id: OwnerId) -> Self {
        Self {
            owner_id: Some(owner_id),
            ..Default::default()
        }
    }
}

pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    queues: Arc<QueueController>,
    default_max_attempts: u32,
}

impl JobLifecycle {
    pub fn new(store: Arc<dyn JobStore>, queues: Arc<QueueController>) -> Self {
        Self {
            store,
            queues,
            default_max_attempts: 3,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queues(&self) -> &Arc<QueueController> {
        &self.queues
    }

    /// Create a `Waiting` record, or return the existing one for the same
    /// `(queue, engine job id)`.
    pub async fn create(&self, new: NewJob) -> JobResult<Job> {
        let candidate = Job::new(new, Utc::now());
        let candidate_id = candidate.id;
        let job = self.store.create(candidate).await?;
        if job.id == candidate_id {
            debug!(job_id = %job.id, queue = %job.queue_name, engine_job_id = %job.engine_job_id, "job record created");
        } else {
            debug!(job_id = %job.id, queue = %job.queue_name, engine_job_id = %job.engine_job_id, "job record already exists");
        }
        Ok(job)
    }

    /// Enqueue into `queue_name` and record the new job as `Waiting`.
    pub async fn submit(
        &self,
        queue_name: &str,
        job_type: JobType,
        payload: JsonValue,
        options: SubmitOptions,
    ) -> JobResult<Job> {
        let max_attempts = options.max_attempts.unwrap_or(self.default_max_attempts);
        let engine_job_id = self
            .queues
            .enqueue(
                queue_name,
                job_type,
                payload.clone(),
                EnqueueOptions {
                    priority: options.priority,
                    attempts: max_attempts,
                    ..Default::default()
                },
            )
            .await?;

        let mut new = NewJob::new(engine_job_id, queue_name, job_type, payload)
            .with_priority(options.priority)
            .with_max_attempts(max_attempts);
        if let Some(owner_id) = options.owner_id {
            new = new.with_owner(owner_id);
        }
        if let Some(timeout_ms) = options.timeout_ms {
            new = new.with_timeout_ms(timeout_ms);
        }
        self.create(new).await
    }

    pub async fn get(&self, job_id: JobId) -> JobResult<Job> {
        self.store
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Waiting | Delayed → Active. No-op when already active.
    pub async fn mark_active(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
    ) -> JobResult<Option<Job>> {
        self.callback(queue_name, engine_job_id, "mark_active", |job| {
            job.activate(Utc::now())
        })
        .await
    }

    /// Replace the progress snapshot of an active job.
    pub async fn update_progress(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
        progress: JobProgress,
    ) -> JobResult<Option<Job>> {
        self.callback(queue_name, engine_job_id, "update_progress", |job| {
            job.set_progress(progress).map(|()| Transition::Applied)
        })
        .await
    }

    pub async fn complete(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
        data: JsonValue,
    ) -> JobResult<Option<Job>> {
        self.callback(queue_name, engine_job_id, "complete", |job| {
            job.complete(data, Utc::now())
        })
        .await
    }

    pub async fn fail(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
        error: impl Into<String>,
        stack_trace: Option<String>,
    ) -> JobResult<Option<Job>> {
        let error = error.into();
        self.callback(queue_name, engine_job_id, "fail", |job| {
            job.fail(error, stack_trace, Utc::now())
        })
        .await
    }

    /// Active → Delayed: the attempt failed but the engine will deliver it again.
    pub async fn mark_delayed(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
    ) -> JobResult<Option<Job>> {
        self.callback(queue_name, engine_job_id, "mark_delayed", |job| job.delay())
            .await
    }

    /// Active → Stuck. Used by the stuck-job detector.
    pub async fn mark_stuck(&self, job_id: JobId) -> JobResult<Option<Job>> {
        let Some(job) = self.store.find_by_id(job_id).await? else {
            warn!(job_id = %job_id, "stale stuck mark: job record no longer exists");
            return Ok(None);
        };
        self.guarded_write(job, "mark_stuck", |job| job.mark_stuck())
            .await
    }

    /// Operator retry of a failed or stuck job.
    ///
    /// A failed or hung engine job is retried in place and one that is still
    /// queued is left alone. When the engine no longer has the job (or already
    /// counts it as completed) the same type and payload are enqueued afresh
    /// and the record is rebound to the new engine job id.
    pub async fn retry(&self, job_id: JobId, reset_attempts: bool) -> JobResult<Job> {
        let mut job = self.get(job_id).await?;
        if !job.status.is_retryable() {
            return Err(JobError::InvalidTransition {
                job_id,
                from: job.status,
                action: "retry",
            });
        }
        let previous = job.status;

        let mut fresh_engine_job = None;
        let engine_state = self
            .queues
            .get_job(&job.queue_name, &job.engine_job_id)
            .await?
            .map(|snapshot| snapshot.state);
        match engine_state {
            Some(EngineJobState::Failed | EngineJobState::Active) => {
                self.queues
                    .retry_job(&job.queue_name, &job.engine_job_id)
                    .await?;
            }
            Some(
                state @ (EngineJobState::Waiting | EngineJobState::Delayed | EngineJobState::Paused),
            ) => {
                debug!(job_id = %job.id, engine_job_id = %job.engine_job_id, ?state, "engine job still queued");
            }
            Some(EngineJobState::Completed) | None => {
                let engine_job_id = self
                    .queues
                    .enqueue(
                        &job.queue_name,
                        job.job_type,
                        job.data.clone(),
                        EnqueueOptions {
                            priority: job.priority,
                            attempts: job.max_attempts,
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(
                    job_id = %job.id,
                    old_engine_job_id = %job.engine_job_id,
                    new_engine_job_id = %engine_job_id,
                    "engine job gone; re-enqueued"
                );
                fresh_engine_job = Some(engine_job_id.clone());
                job.engine_job_id = engine_job_id;
            }
        }

        job.reset_for_retry(reset_attempts)
            .map_err(|e| JobError::from_domain(job_id, e))?;

        let written = self.store.update(&job, previous).await;
        if !matches!(written, Ok(true)) {
            if let Some(orphan) = &fresh_engine_job {
                self.discard_engine_job(&job.queue_name, orphan).await;
            }
        }
        if !written? {
            let current = self.get(job_id).await?;
            return Err(JobError::InvalidTransition {
                job_id,
                from: current.status,
                action: "retry",
            });
        }
        info!(job_id = %job.id, queue = %job.queue_name, reset_attempts, "job retried");
        Ok(job)
    }

    /// Remove an engine job enqueued for a retry whose record write lost.
    async fn discard_engine_job(&self, queue_name: &str, engine_job_id: &EngineJobId) {
        match self.queues.remove_job(queue_name, engine_job_id).await {
            Ok(()) => {
                debug!(queue = %queue_name, engine_job_id = %engine_job_id, "discarded re-enqueued engine job");
            }
            Err(e) => {
                warn!(queue = %queue_name, engine_job_id = %engine_job_id, error = %e, "failed to discard re-enqueued engine job");
            }
        }
    }

    /// Operator cancel: remove from the engine, then delete the record.
    pub async fn cancel(&self, job_id: JobId) -> JobResult<()> {
        let job = self.get(job_id).await?;
        job.ensure_cancelable()
            .map_err(|e| JobError::from_domain(job_id, e))?;

        match self
            .queues
            .remove_job(&job.queue_name, &job.engine_job_id)
            .await
        {
            Ok(()) => {}
            Err(JobError::NotFound(_)) => {
                debug!(job_id = %job.id, engine_job_id = %job.engine_job_id, "engine job already gone");
            }
            Err(e) => return Err(e),
        }

        // Nothing spans the engine and the store; a crash here leaves an orphaned record.
        warn!(
            job_id = %job.id,
            queue = %job.queue_name,
            engine_job_id = %job.engine_job_id,
            "engine job removed; deleting job record"
        );

        if !self.store.delete(job.id).await? {
            warn!(job_id = %job.id, "job record was already deleted");
        }
        info!(job_id = %job.id, "job cancelled");
        Ok(())
    }

    async fn callback<F>(
        &self,
        queue_name: &str,
        engine_job_id: &EngineJobId,
        action: &'static str,
        apply: F,
    ) -> JobResult<Option<Job>>
    where
        F: FnOnce(&mut Job) -> DomainResult<Transition> + Send,
    {
        let Some(job) = self
            .store
            .find_by_engine_id(queue_name, engine_job_id)
            .await?
        else {
            warn!(
                queue = %queue_name,
                engine_job_id = %engine_job_id,
                action,
                "stale callback: no job record for engine id"
            );
            return Ok(None);
        };
        self.guarded_write(job, action, apply).await
    }

    async fn guarded_write<F>(
        &self,
        mut job: Job,
        action: &'static str,
        apply: F,
    ) -> JobResult<Option<Job>>
    where
        F: FnOnce(&mut Job) -> DomainResult<Transition> + Send,
    {
        let expected = job.status;
        match apply(&mut job) {
            Ok(Transition::Applied) => {}
            Ok(Transition::AlreadyApplied) => {
                warn!(job_id = %job.id, status = %expected, action, "stale callback: transition already applied");
                return Ok(None);
            }
            Err(e) => return Err(JobError::from_domain(job.id, e)),
        }

        match self.store.update(&job, expected).await {
            Ok(true) => {
                debug!(job_id = %job.id, from = %expected, to = %job.status, action, "job transitioned");
                Ok(Some(job))
            }
            Ok(false) => {
                warn!(job_id = %job.id, expected = %expected, action, "stale callback: job changed concurrently");
                Ok(None)
            }
            Err(StoreError::NotFound(id)) => {
                warn!(job_id = %id, action, "stale callback: job record deleted");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for JobLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLifecycle")
            .field("queues", &self.queues)
            .field("default_max_attempts", &self.default_max_attempts)
            .finish_non_exhaustive()
    }
}
