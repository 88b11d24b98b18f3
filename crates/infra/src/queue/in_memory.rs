//! In-memory queue engine for dev and tests.
//!
//! Implements the consumed engine surface plus `dequeue`/`finish`, which stand
//! in for the engine's own worker delivery. A failed attempt with attempts
//! left goes to `Delayed` and is immediately eligible again; there is no
//! backoff timer.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;

use jobwarden_core::{EngineJobId, JobType};

use super::{
    DequeuedJob, EngineError, EngineJobSnapshot, EngineJobState, EnqueueOptions, JobSource,
    QueueCounts, QueueEngine,
};

#[derive(Debug)]
struct Entry {
    job_type: JobType,
    payload: JsonValue,
    options: EnqueueOptions,
    state: EngineJobState,
    attempts_made: u32,
    changed_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    // Keyed by enqueue sequence, so iteration is FIFO.
    entries: BTreeMap<u64, Entry>,
    paused: bool,
}

impl QueueState {
    fn find_mut(&mut self, id: &EngineJobId) -> Option<&mut Entry> {
        let seq = id.as_str().parse::<u64>().ok()?;
        self.entries.get_mut(&seq)
    }
}

#[derive(Debug)]
pub struct InMemoryQueueEngine {
    name: String,
    state: Mutex<QueueState>,
}

impl InMemoryQueueEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, EngineError> {
        self.state
            .lock()
            .map_err(|_| EngineError::Unavailable(format!("queue {} lock poisoned", self.name)))
    }

    /// Hand the next eligible job to a worker: highest priority first, then FIFO.
    ///
    /// Returns `None` when the queue is paused or empty.
    pub fn dequeue(&self) -> Result<Option<DequeuedJob>, EngineError> {
        let mut state = self.lock()?;
        if state.paused {
            return Ok(None);
        }

        let next = state
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, EngineJobState::Waiting | EngineJobState::Delayed))
            .max_by(|(a_seq, a), (b_seq, b)| {
                a.options
                    .priority
                    .cmp(&b.options.priority)
                    .then_with(|| b_seq.cmp(a_seq))
            })
            .map(|(seq, _)| *seq);

        let Some(seq) = next else {
            return Ok(None);
        };
        let Some(entry) = state.entries.get_mut(&seq) else {
            return Ok(None);
        };
        entry.state = EngineJobState::Active;
        entry.attempts_made += 1;
        entry.changed_at = Instant::now();

        Ok(Some(DequeuedJob {
            queue_name: self.name.clone(),
            engine_job_id: EngineJobId::new(seq.to_string()),
            job_type: entry.job_type,
            payload: entry.payload.clone(),
            priority: entry.options.priority,
            attempts_made: entry.attempts_made,
            max_attempts: entry.options.attempts,
        }))
    }

    /// Report the outcome of an active attempt. Returns the job's new engine state.
    pub fn finish(&self, id: &EngineJobId, success: bool) -> Result<EngineJobState, EngineError> {
        let mut state = self.lock()?;
        let entry = state
            .find_mut(id)
            .ok_or_else(|| EngineError::JobNotFound(id.clone()))?;
        if entry.state != EngineJobState::Active {
            return Err(EngineError::Rejected(format!(
                "job {id} is not active ({:?})",
                entry.state
            )));
        }
        entry.state = if success {
            EngineJobState::Completed
        } else if entry.attempts_made < entry.options.attempts {
            EngineJobState::Delayed
        } else {
            EngineJobState::Failed
        };
        entry.changed_at = Instant::now();
        Ok(entry.state)
    }
}

#[async_trait::async_trait]
impl QueueEngine for InMemoryQueueEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        job_type: JobType,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<EngineJobId, EngineError> {
        let mut state = self.lock()?;
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.insert(
            seq,
            Entry {
                job_type,
                payload,
                options,
                state: EngineJobState::Waiting,
                attempts_made: 0,
                changed_at: Instant::now(),
            },
        );
        Ok(EngineJobId::new(seq.to_string()))
    }

    async fn get_job(&self, id: &EngineJobId) -> Result<Option<EngineJobSnapshot>, EngineError> {
        let mut state = self.lock()?;
        Ok(state.find_mut(id).map(|entry| EngineJobSnapshot {
            id: id.clone(),
            job_type: entry.job_type,
            payload: entry.payload.clone(),
            state: entry.state,
            attempts_made: entry.attempts_made,
        }))
    }

    async fn retry_job(&self, id: &EngineJobId) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let entry = state
            .find_mut(id)
            .ok_or_else(|| EngineError::JobNotFound(id.clone()))?;
        // Active is accepted so a hung attempt can be handed out again.
        match entry.state {
            EngineJobState::Failed | EngineJobState::Active => {
                entry.state = EngineJobState::Waiting;
                entry.changed_at = Instant::now();
                Ok(())
            }
            other => Err(EngineError::Rejected(format!(
                "job {id} cannot be retried from {other:?}"
            ))),
        }
    }

    async fn remove_job(&self, id: &EngineJobId) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        let seq = id
            .as_str()
            .parse::<u64>()
            .map_err(|_| EngineError::JobNotFound(id.clone()))?;
        state
            .entries
            .remove(&seq)
            .map(|_| ())
            .ok_or_else(|| EngineError::JobNotFound(id.clone()))
    }

    async fn pause(&self, _grace: Option<Duration>) -> Result<(), EngineError> {
        // No in-flight workers to wait for.
        self.lock()?.paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.lock()?.paused = false;
        Ok(())
    }

    async fn clean(&self, grace: Duration, target: EngineJobState) -> Result<u64, EngineError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| !(e.state == target && now.duration_since(e.changed_at) >= grace));
        Ok((before - state.entries.len()) as u64)
    }

    async fn drain(&self, remove_delayed: bool) -> Result<(), EngineError> {
        let mut state = self.lock()?;
        state.entries.retain(|_, e| match e.state {
            EngineJobState::Waiting | EngineJobState::Paused => false,
            EngineJobState::Delayed => !remove_delayed,
            _ => true,
        });
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, EngineError> {
        let state = self.lock()?;
        let mut counts = QueueCounts::default();
        for entry in state.entries.values() {
            match entry.state {
                // A paused queue reports its backlog as paused.
                EngineJobState::Waiting if state.paused => counts.paused += 1,
                EngineJobState::Waiting => counts.waiting += 1,
                EngineJobState::Active => counts.active += 1,
                EngineJobState::Completed => counts.completed += 1,
                EngineJobState::Failed => counts.failed += 1,
                EngineJobState::Delayed => counts.delayed += 1,
                EngineJobState::Paused => counts.paused += 1,
            }
        }
        Ok(counts)
    }

    async fn is_paused(&self) -> Result<bool, EngineError> {
        Ok(self.lock()?.paused)
    }
}

#[async_trait::async_trait]
impl JobSource for InMemoryQueueEngine {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn next_job(&self) -> Result<Option<DequeuedJob>, EngineError> {
        self.dequeue()
    }

    async fn report(&self, id: &EngineJobId, success: bool) -> Result<EngineJobState, EngineError> {
        self.finish(id, success)
    }
}
