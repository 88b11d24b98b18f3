//! Polling worker that drives a [`JobSource`] through a [`JobProcessor`].
//!
//! Runs the built-in maintenance handlers in the server and stands in for
//! the producers' worker pools in end-to-end tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::processor::JobProcessor;
use crate::queue::JobSource;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll when the queue is empty
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request shutdown and wait for the in-flight job to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}

/// Spawn a worker task consuming `engine`.
pub fn spawn_worker(
    engine: Arc<dyn JobSource>,
    processor: Arc<JobProcessor>,
    config: WorkerConfig,
) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats = Arc::new(Mutex::new(WorkerStats::default()));
    let join = tokio::spawn(worker_loop(engine, processor, config, shutdown_rx, stats.clone()));
    WorkerHandle {
        shutdown: shutdown_tx,
        join: Some(join),
        stats,
    }
}

async fn worker_loop(
    engine: Arc<dyn JobSource>,
    processor: Arc<JobProcessor>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %config.name, queue = %engine.queue_name(), "job worker started");

    while !*shutdown.borrow() {
        match engine.next_job().await {
            Ok(Some(job)) => {
                let engine_job_id = job.engine_job_id.clone();
                debug!(worker = %config.name, engine_job_id = %engine_job_id, job_type = %job.job_type, "dequeued job");

                let success = processor.execute(job).await.is_ok();
                if let Err(e) = engine.report(&engine_job_id, success).await {
                    error!(worker = %config.name, engine_job_id = %engine_job_id, error = %e, "failed to report job outcome to engine");
                }

                if let Ok(mut s) = stats.lock() {
                    s.jobs_processed += 1;
                    if success {
                        s.jobs_succeeded += 1;
                    } else {
                        s.jobs_failed += 1;
                    }
                }
            }
            Ok(None) => {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // Handle dropped without an explicit shutdown.
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                error!(worker = %config.name, error = %e, "failed to dequeue job");
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }

    info!(worker = %config.name, "job worker stopped");
}
