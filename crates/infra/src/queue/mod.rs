//! Boundary to the external work queue engine.
//!
//! The engine owns delivery, worker concurrency and backoff. This layer only
//! consumes the narrow per-queue surface below; one [`QueueEngine`] instance
//! represents one named queue.
//!
//! ## Components
//!
//! - `QueueEngine`: per-queue engine handle (enqueue, inspect, per-job retry/remove, queue controls)
//! - `QueueController`: resolves queue names and exposes the administrative actions
//! - `JobSource`: worker-facing delivery (`next_job`, `report`) used by the polling worker
//! - `InMemoryQueueEngine`: process-local engine for dev and tests
//! - `RedisQueueEngine` (feature `redis`): engine state kept in Redis, shared between processes

pub mod controller;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_engine;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobwarden_core::{EngineJobId, JobPriority, JobType};

pub use controller::{QueueController, QueueStatus};
pub use in_memory::InMemoryQueueEngine;
#[cfg(feature = "redis")]
pub use redis_engine::RedisQueueEngine;

/// Queue engine error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Network failure, timeout or engine down.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine job not found: {0}")]
    JobNotFound(EngineJobId),
    /// The engine refused the request (e.g. retrying a job that is not failed).
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

/// Engine-side job state, as reported by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineJobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

/// Backoff the engine applies between its own delivery attempts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { delay_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential { delay_ms: 2_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    pub priority: JobPriority,
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// Per-queue job counts as reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

/// Read-only view of one engine job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineJobSnapshot {
    pub id: EngineJobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: JsonValue,
    pub state: EngineJobState,
    pub attempts_made: u32,
}

/// A job as delivered by the engine to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DequeuedJob {
    pub queue_name: String,
    pub engine_job_id: EngineJobId,
    pub job_type: JobType,
    pub payload: JsonValue,
    pub priority: JobPriority,
    /// Includes the attempt being handed out.
    pub attempts_made: u32,
    pub max_attempts: u32,
}

impl DequeuedJob {
    /// Whether a failure of this attempt will be retried by the engine.
    pub fn will_retry_on_failure(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// One named queue in the external engine.
#[async_trait::async_trait]
pub trait QueueEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue(
        &self,
        job_type: JobType,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<EngineJobId, EngineError>;

    async fn get_job(&self, id: &EngineJobId) -> Result<Option<EngineJobSnapshot>, EngineError>;

    /// Move a failed engine job back to waiting.
    async fn retry_job(&self, id: &EngineJobId) -> Result<(), EngineError>;

    async fn remove_job(&self, id: &EngineJobId) -> Result<(), EngineError>;

    /// Stop handing out jobs. `grace` lets in-flight work drain first where supported.
    async fn pause(&self, grace: Option<Duration>) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    /// Remove jobs in `state` that finished more than `grace` ago. Returns the count removed.
    async fn clean(&self, grace: Duration, state: EngineJobState) -> Result<u64, EngineError>;

    /// Remove every waiting job, and delayed ones too when `remove_delayed`.
    async fn drain(&self, remove_delayed: bool) -> Result<(), EngineError>;

    async fn counts(&self) -> Result<QueueCounts, EngineError>;

    async fn is_paused(&self) -> Result<bool, EngineError>;
}

/// Worker-side delivery from one queue.
#[async_trait::async_trait]
pub trait JobSource: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Hand the next eligible job to a worker, or `None` when paused or empty.
    async fn next_job(&self) -> Result<Option<DequeuedJob>, EngineError>;

    /// Report the outcome of an active attempt. Returns the job's new engine state.
    async fn report(&self, id: &EngineJobId, success: bool) -> Result<EngineJobState, EngineError>;
}
