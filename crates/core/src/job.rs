//! Job record model and lifecycle state machine.
//!
//! ## States
//!
//! - `Waiting` → `Active` (first dequeue) → `Completed` | `Failed`
//! - `Delayed` → `Active` (engine-driven retry after backoff)
//! - `Active` → `Stuck` (staleness sweep); `Stuck` may still complete or fail late
//! - `Failed` | `Stuck` → `Waiting` (operator retry)
//!
//! Every transition is a guarded method on [`Job`]: it checks the current
//! status first and either applies the change, reports that the change was
//! already applied (duplicate delivery), or rejects it.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{EngineJobId, JobId, OwnerId};

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Enqueued, waiting for a worker
    Waiting,
    /// Currently being executed
    Active,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Waiting for an engine-side retry backoff to elapse
    Delayed,
    /// Held by a paused queue
    Paused,
    /// Active for longer than the staleness threshold
    Stuck,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Delayed,
        JobStatus::Paused,
        JobStatus::Stuck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Active => "ACTIVE",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Delayed => "DELAYED",
            JobStatus::Paused => "PAUSED",
            JobStatus::Stuck => "STUCK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Stuck)
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(
            self,
            JobStatus::Waiting | JobStatus::Active | JobStatus::Delayed | JobStatus::Paused
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Kind of work a job performs. Routing key for worker-side handlers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    EmailSync,
    ReportGeneration,
    InsightsGeneration,
    BudgetRefresh,
    NotificationDigest,
    CacheCleanup,
    BackupVerification,
    AccountReconciliation,
    DataExport,
}

impl JobType {
    pub const ALL: [JobType; 9] = [
        JobType::EmailSync,
        JobType::ReportGeneration,
        JobType::InsightsGeneration,
        JobType::BudgetRefresh,
        JobType::NotificationDigest,
        JobType::CacheCleanup,
        JobType::BackupVerification,
        JobType::AccountReconciliation,
        JobType::DataExport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EmailSync => "EMAIL_SYNC",
            JobType::ReportGeneration => "REPORT_GENERATION",
            JobType::InsightsGeneration => "INSIGHTS_GENERATION",
            JobType::BudgetRefresh => "BUDGET_REFRESH",
            JobType::NotificationDigest => "NOTIFICATION_DIGEST",
            JobType::CacheCleanup => "CACHE_CLEANUP",
            JobType::BackupVerification => "BACKUP_VERIFICATION",
            JobType::AccountReconciliation => "ACCOUNT_RECONCILIATION",
            JobType::DataExport => "DATA_EXPORT",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Informational priority; ordering is enforced by the queue engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> DomainResult<Self> {
        match value {
            1 => Ok(JobPriority::Low),
            2 => Ok(JobPriority::Normal),
            3 => Ok(JobPriority::High),
            4 => Ok(JobPriority::Critical),
            other => Err(DomainError::validation(format!("unknown job priority: {other}"))),
        }
    }
}

/// Progress snapshot reported by a worker. Overwritten wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub percentage: u8,
    pub current_step: String,
    pub total_steps: u32,
    pub completed_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobProgress {
    /// Progress with a single step description; percentage must be within 0–100.
    pub fn new(percentage: u8, current_step: impl Into<String>) -> DomainResult<Self> {
        if percentage > 100 {
            return Err(DomainError::validation(format!(
                "progress percentage must be within 0-100, got {percentage}"
            )));
        }
        Ok(Self {
            percentage,
            current_step: current_step.into(),
            total_steps: 100,
            completed_steps: u32::from(percentage),
            estimated_time_remaining_ms: None,
            message: None,
        })
    }

    pub fn with_steps(mut self, completed_steps: u32, total_steps: u32) -> Self {
        self.completed_steps = completed_steps;
        self.total_steps = total_steps;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_estimated_time_remaining_ms(mut self, ms: u64) -> Self {
        self.estimated_time_remaining_ms = Some(ms);
        self
    }
}

/// Outcome recorded exactly once, at the terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl JobResult {
    pub fn success(data: JsonValue) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: None,
        }
    }
}

/// Outcome of applying a transition to a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The job changed state.
    Applied,
    /// The job was already in the target state (duplicate delivery).
    AlreadyApplied,
}

/// Parameters for a new job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub engine_job_id: EngineJobId,
    pub queue_name: String,
    pub job_type: JobType,
    pub data: JsonValue,
    pub priority: JobPriority,
    pub max_attempts: u32,
    pub owner_id: Option<OwnerId>,
    pub timeout_ms: Option<u64>,
}

impl NewJob {
    pub fn new(
        engine_job_id: impl Into<EngineJobId>,
        queue_name: impl Into<String>,
        job_type: JobType,
        data: JsonValue,
    ) -> Self {
        Self {
            engine_job_id: engine_job_id.into(),
            queue_name: queue_name.into(),
            job_type,
            data,
            priority: JobPriority::default(),
            max_attempts: 3,
            owner_id: None,
            timeout_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Persisted record of one unit of work submitted to a queue engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub engine_job_id: EngineJobId,
    pub queue_name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub data: JsonValue,
    pub progress: Option<JobProgress>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub owner_id: Option<OwnerId>,
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Job {
    /// Create a `Waiting` record.
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            engine_job_id: new.engine_job_id,
            queue_name: new.queue_name,
            job_type: new.job_type,
            status: JobStatus::Waiting,
            priority: new.priority,
            data: new.data,
            progress: None,
            result: None,
            error: None,
            stack_trace: None,
            attempts: 0,
            max_attempts: new.max_attempts,
            owner_id: new.owner_id,
            timeout_ms: new.timeout_ms,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            duration_ms: None,
        }
    }

    /// Waiting | Delayed → Active. Counts a processing attempt.
    ///
    /// `started_at` is only set on the first activation.
    pub fn activate(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        match self.status {
            JobStatus::Active => Ok(Transition::AlreadyApplied),
            JobStatus::Waiting | JobStatus::Delayed => {
                self.status = JobStatus::Active;
                self.attempts += 1;
                self.started_at.get_or_insert(now);
                Ok(Transition::Applied)
            }
            from => Err(DomainError::invalid_transition(from, "activate")),
        }
    }

    /// Replace the progress snapshot (last write wins). Active only.
    pub fn set_progress(&mut self, progress: JobProgress) -> DomainResult<()> {
        if self.status != JobStatus::Active {
            return Err(DomainError::invalid_transition(self.status, "update progress of"));
        }
        self.progress = Some(progress);
        Ok(())
    }

    /// Active | Stuck → Completed.
    pub fn complete(&mut self, data: JsonValue, now: DateTime<Utc>) -> DomainResult<Transition> {
        match self.status {
            status if status.is_terminal() => Ok(Transition::AlreadyApplied),
            JobStatus::Active | JobStatus::Stuck => {
                self.status = JobStatus::Completed;
                self.completed_at = Some(now);
                self.duration_ms = Some(self.elapsed_ms(now));
                self.result = Some(JobResult::success(data));
                Ok(Transition::Applied)
            }
            from => Err(DomainError::invalid_transition(from, "complete")),
        }
    }

    /// Active | Stuck → Failed.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        stack_trace: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        match self.status {
            status if status.is_terminal() => Ok(Transition::AlreadyApplied),
            JobStatus::Active | JobStatus::Stuck => {
                let error = error.into();
                self.status = JobStatus::Failed;
                self.failed_at = Some(now);
                self.duration_ms = Some(self.elapsed_ms(now));
                self.result = Some(JobResult::failure(error.clone()));
                self.error = Some(error);
                self.stack_trace = stack_trace;
                Ok(Transition::Applied)
            }
            from => Err(DomainError::invalid_transition(from, "fail")),
        }
    }

    /// Active → Delayed, when the engine will retry the attempt after a backoff.
    pub fn delay(&mut self) -> DomainResult<Transition> {
        match self.status {
            JobStatus::Delayed => Ok(Transition::AlreadyApplied),
            JobStatus::Active => {
                self.status = JobStatus::Delayed;
                Ok(Transition::Applied)
            }
            from => Err(DomainError::invalid_transition(from, "delay")),
        }
    }

    /// Active → Stuck.
    pub fn mark_stuck(&mut self) -> DomainResult<Transition> {
        match self.status {
            JobStatus::Stuck => Ok(Transition::AlreadyApplied),
            JobStatus::Active => {
                self.status = JobStatus::Stuck;
                Ok(Transition::Applied)
            }
            from => Err(DomainError::invalid_transition(from, "mark stuck")),
        }
    }

    /// Failed | Stuck → Waiting, clearing the previous execution's outcome.
    pub fn reset_for_retry(&mut self, reset_attempts: bool) -> DomainResult<()> {
        if !self.status.is_retryable() {
            return Err(DomainError::invalid_transition(self.status, "retry"));
        }
        self.status = JobStatus::Waiting;
        self.started_at = None;
        self.completed_at = None;
        self.failed_at = None;
        self.duration_ms = None;
        self.result = None;
        self.error = None;
        self.stack_trace = None;
        self.progress = None;
        if reset_attempts {
            self.attempts = 0;
        }
        Ok(())
    }

    pub fn ensure_cancelable(&self) -> DomainResult<()> {
        if self.status.is_cancelable() {
            Ok(())
        } else {
            Err(DomainError::NotCancelable(self.status))
        }
    }

    /// Whether the job has been active since before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.started_at.is_some_and(|at| at < cutoff)
    }

    /// Timestamp invariants that must hold for every persisted record.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.completed_at.is_some() && self.failed_at.is_some() {
            return Err(DomainError::validation("completed_at and failed_at are both set"));
        }
        let terminal_at = self.completed_at.or(self.failed_at);
        if terminal_at.is_some() != self.duration_ms.is_some() {
            return Err(DomainError::validation(
                "duration must be present exactly when a terminal timestamp is",
            ));
        }
        if let (Some(started), Some(ended)) = (self.started_at, terminal_at) {
            if started > ended {
                return Err(DomainError::validation("started_at is after the terminal timestamp"));
            }
        }
        match self.status {
            JobStatus::Completed if self.completed_at.is_none() => {
                Err(DomainError::validation("completed job without completed_at"))
            }
            JobStatus::Failed if self.failed_at.is_none() => {
                Err(DomainError::validation("failed job without failed_at"))
            }
            _ => Ok(()),
        }
    }

    fn elapsed_ms(&mut self, now: DateTime<Utc>) -> i64 {
        let started = *self.started_at.get_or_insert(now);
        (now - started).num_milliseconds().max(0)
    }
}
