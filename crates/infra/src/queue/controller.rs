//! Administrative control over registered queues.
//!
//! Every call is a single round-trip to the engine. There is no local retry:
//! the actions are operator-triggered and idempotent, so the operator retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;

use jobwarden_core::{EngineJobId, JobType};

use super::{EngineJobSnapshot, EngineJobState, EnqueueOptions, QueueCounts, QueueEngine};
use crate::error::{JobError, JobResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub name: String,
    pub is_paused: bool,
    pub counts: QueueCounts,
}

/// Registry of named queue handles.
#[derive(Clone, Default)]
pub struct QueueController {
    queues: BTreeMap<String, Arc<dyn QueueEngine>>,
}

impl std::fmt::Debug for QueueController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueController")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl QueueController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue under its engine name. Replaces an existing registration.
    pub fn register(&mut self, engine: Arc<dyn QueueEngine>) {
        self.queues.insert(engine.name().to_string(), engine);
    }

    pub fn with_queue(mut self, engine: Arc<dyn QueueEngine>) -> Self {
        self.register(engine);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn resolve(&self, queue_name: &str) -> JobResult<&Arc<dyn QueueEngine>> {
        self.queues
            .get(queue_name)
            .ok_or_else(|| JobError::QueueNotFound(queue_name.to_string()))
    }

    pub async fn status(&self, queue_name: &str) -> JobResult<QueueStatus> {
        let queue = self.resolve(queue_name)?;
        Ok(QueueStatus {
            name: queue_name.to_string(),
            is_paused: queue.is_paused().await?,
            counts: queue.counts().await?,
        })
    }

    /// Status of every registered queue, in name order.
    pub async fn list(&self) -> JobResult<Vec<QueueStatus>> {
        let mut statuses = Vec::with_capacity(self.queues.len());
        for name in self.queues.keys() {
            statuses.push(self.status(name).await?);
        }
        Ok(statuses)
    }

    pub async fn pause(&self, queue_name: &str, grace: Option<Duration>) -> JobResult<()> {
        self.resolve(queue_name)?.pause(grace).await?;
        info!(queue = %queue_name, grace_ms = ?grace.map(|g| g.as_millis()), "queue paused");
        Ok(())
    }

    pub async fn resume(&self, queue_name: &str) -> JobResult<()> {
        self.resolve(queue_name)?.resume().await?;
        info!(queue = %queue_name, "queue resumed");
        Ok(())
    }

    /// Remove completed and failed engine jobs older than `grace`. Never touches the record store.
    pub async fn clean(&self, queue_name: &str, grace: Duration) -> JobResult<u64> {
        let queue = self.resolve(queue_name)?;
        let completed = queue.clean(grace, EngineJobState::Completed).await?;
        let failed = queue.clean(grace, EngineJobState::Failed).await?;
        info!(queue = %queue_name, completed, failed, "queue cleaned");
        Ok(completed + failed)
    }

    pub async fn drain(&self, queue_name: &str, remove_delayed: bool) -> JobResult<()> {
        self.resolve(queue_name)?.drain(remove_delayed).await?;
        info!(queue = %queue_name, remove_delayed, "queue drained");
        Ok(())
    }

    pub async fn enqueue(
        &self,
        queue_name: &str,
        job_type: JobType,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> JobResult<EngineJobId> {
        Ok(self
            .resolve(queue_name)?
            .enqueue(job_type, payload, options)
            .await?)
    }

    pub async fn get_job(
        &self,
        queue_name: &str,
        id: &EngineJobId,
    ) -> JobResult<Option<EngineJobSnapshot>> {
        Ok(self.resolve(queue_name)?.get_job(id).await?)
    }

    pub async fn retry_job(&self, queue_name: &str, id: &EngineJobId) -> JobResult<()> {
        Ok(self.resolve(queue_name)?.retry_job(id).await?)
    }

    pub async fn remove_job(&self, queue_name: &str, id: &EngineJobId) -> JobResult<()> {
        Ok(self.resolve(queue_name)?.remove_job(id).await?)
    }
}
