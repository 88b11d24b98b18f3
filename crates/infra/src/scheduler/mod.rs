//! Calendar-driven recurring triggers.
//!
//! Each trigger runs its own loop: sleep until the next calendar time, then
//! spawn the firing and go straight back to sleeping. A firing that errors or
//! panics is logged by a watcher task and never stops the loop. Inside a
//! per-owner firing every owner's enqueue is isolated from the others.
//!
//! Nothing here persists firing history; after a restart a firing may be
//! repeated, which job creation tolerates by being idempotent.

mod owners;
mod triggers;

pub use owners::{CombinedOwners, OwnerDirectory, StaticOwners, StoreOwners};
pub use triggers::{Trigger, TriggerAction, default_triggers};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{JobError, JobResult};
use crate::jobs::{JobLifecycle, SubmitOptions};
use crate::monitoring::{RetentionSweeper, StuckJobDetector};

/// What a single firing did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FiringOutcome {
    #[serde(rename_all = "camelCase")]
    Enqueued { submitted: u64, failed: u64 },
    StuckSwept { marked: u64 },
    RetentionSwept { deleted: u64 },
}

pub struct Scheduler {
    triggers: Vec<Trigger>,
    lifecycle: Arc<JobLifecycle>,
    owners: Arc<dyn OwnerDirectory>,
    stuck: StuckJobDetector,
    retention: RetentionSweeper,
}

impl Scheduler {
    pub fn new(
        triggers: Vec<Trigger>,
        lifecycle: Arc<JobLifecycle>,
        owners: Arc<dyn OwnerDirectory>,
        stuck: StuckJobDetector,
        retention: RetentionSweeper,
    ) -> Self {
        Self {
            triggers,
            lifecycle,
            owners,
            stuck,
            retention,
        }
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Fire the named trigger immediately, outside its calendar.
    pub async fn fire_now(&self, name: &str) -> JobResult<FiringOutcome> {
        let trigger = self
            .triggers
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| JobError::NotFound(format!("trigger {name}")))?;
        self.fire(trigger, Utc::now()).await
    }

    async fn fire(&self, trigger: &Trigger, scheduled_at: DateTime<Utc>) -> JobResult<FiringOutcome> {
        match trigger.action() {
            TriggerAction::EnqueuePerOwner { queue, job_type } => {
                let owners = self.owners.owners().await?;
                let mut submitted = 0;
                let mut failed = 0;
                for owner in owners {
                    let payload = json!({
                        "ownerId": owner,
                        "trigger": trigger.name(),
                        "scheduledAt": scheduled_at,
                    });
                    match self
                        .lifecycle
                        .submit(queue, *job_type, payload, SubmitOptions::for_owner(owner))
                        .await
                    {
                        Ok(job) => {
                            debug!(trigger = trigger.name(), owner_id = %owner, job_id = %job.id, "scheduled job submitted");
                            submitted += 1;
                        }
                        Err(e) => {
                            warn!(trigger = trigger.name(), owner_id = %owner, error = %e, "scheduled job submission failed");
                            failed += 1;
                        }
                    }
                }
                Ok(FiringOutcome::Enqueued { submitted, failed })
            }
            TriggerAction::EnqueueOnce { queue, job_type } => {
                let payload = json!({
                    "trigger": trigger.name(),
                    "scheduledAt": scheduled_at,
                });
                let job = self
                    .lifecycle
                    .submit(queue, *job_type, payload, SubmitOptions::default())
                    .await?;
                debug!(trigger = trigger.name(), job_id = %job.id, "scheduled job submitted");
                Ok(FiringOutcome::Enqueued {
                    submitted: 1,
                    failed: 0,
                })
            }
            TriggerAction::StuckSweep => Ok(FiringOutcome::StuckSwept {
                marked: self.stuck.sweep().await?,
            }),
            TriggerAction::RetentionSweep {
                older_than_days,
                limit,
            } => Ok(FiringOutcome::RetentionSwept {
                deleted: self
                    .retention
                    .clean(Some(*older_than_days), None, Some(*limit))
                    .await?,
            }),
        }
    }

    /// Start one loop per trigger.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = (0..self.triggers.len())
            .map(|index| tokio::spawn(trigger_loop(self.clone(), index, shutdown_rx.clone())))
            .collect();
        info!(triggers = self.triggers.len(), "scheduler started");
        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("triggers", &self.triggers)
            .finish_non_exhaustive()
    }
}

async fn trigger_loop(scheduler: Arc<Scheduler>, index: usize, mut shutdown: watch::Receiver<bool>) {
    let trigger = &scheduler.triggers[index];
    debug!(trigger = trigger.name(), expression = trigger.expression(), "trigger loop started");

    while !*shutdown.borrow() {
        let now = Utc::now();
        let Some(next) = trigger.next_after(now) else {
            info!(trigger = trigger.name(), "trigger has no further firings");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(wait) => {
                let firing = {
                    let scheduler = scheduler.clone();
                    tokio::spawn(async move {
                        let trigger = &scheduler.triggers[index];
                        scheduler.fire(trigger, next).await
                    })
                };
                let name = trigger.name().to_string();
                tokio::spawn(async move {
                    match firing.await {
                        Ok(Ok(outcome)) => info!(trigger = %name, ?outcome, "trigger fired"),
                        Ok(Err(e)) => error!(trigger = %name, error = %e, "trigger firing failed"),
                        Err(e) => error!(trigger = %name, error = %e, "trigger firing panicked"),
                    }
                });
            }
        }
    }

    debug!(trigger = trigger.name(), "trigger loop stopped");
}

/// Handle to a started scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop every trigger loop. Firings already in flight run to completion on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "trigger loop ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::Duration;
    use jobwarden_core::{EngineJobId, Job, JobStatus, JobType, NewJob, OwnerId};
    use serde_json::Value as JsonValue;

    use crate::queue::{
        EngineError, EngineJobSnapshot, EngineJobState, EnqueueOptions, InMemoryQueueEngine,
        QueueController, QueueCounts, QueueEngine,
    };
    use crate::store::{InMemoryJobStore, JobFilter, JobStore, PageRequest};

    /// Engine that rejects enqueues for one owner and delegates everything else.
    struct RejectingOwner {
        inner: InMemoryQueueEngine,
        rejected: OwnerId,
    }

    #[async_trait]
    impl QueueEngine for RejectingOwner {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn enqueue(
            &self,
            job_type: JobType,
            payload: JsonValue,
            options: EnqueueOptions,
        ) -> Result<EngineJobId, EngineError> {
            if payload["ownerId"] == json!(self.rejected) {
                return Err(EngineError::Unavailable("connection reset".to_string()));
            }
            self.inner.enqueue(job_type, payload, options).await
        }

        async fn get_job(&self, id: &EngineJobId) -> Result<Option<EngineJobSnapshot>, EngineError> {
            self.inner.get_job(id).await
        }

        async fn retry_job(&self, id: &EngineJobId) -> Result<(), EngineError> {
            self.inner.retry_job(id).await
        }

        async fn remove_job(&self, id: &EngineJobId) -> Result<(), EngineError> {
            self.inner.remove_job(id).await
        }

        async fn pause(&self, grace: Option<StdDuration>) -> Result<(), EngineError> {
            self.inner.pause(grace).await
        }

        async fn resume(&self) -> Result<(), EngineError> {
            self.inner.resume().await
        }

        async fn clean(&self, grace: StdDuration, state: EngineJobState) -> Result<u64, EngineError> {
            self.inner.clean(grace, state).await
        }

        async fn drain(&self, remove_delayed: bool) -> Result<(), EngineError> {
            self.inner.drain(remove_delayed).await
        }

        async fn counts(&self) -> Result<QueueCounts, EngineError> {
            self.inner.counts().await
        }

        async fn is_paused(&self) -> Result<bool, EngineError> {
            self.inner.is_paused().await
        }
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        scheduler: Arc<Scheduler>,
    }

    fn fixture(triggers: Vec<Trigger>, owners: Vec<OwnerId>, reports: Arc<dyn QueueEngine>) -> Fixture {
        let store = InMemoryJobStore::arc();
        let queues = QueueController::new()
            .with_queue(reports)
            .with_queue(Arc::new(InMemoryQueueEngine::new("maintenance")));
        let lifecycle = Arc::new(JobLifecycle::new(store.clone(), Arc::new(queues)));
        let scheduler = Scheduler::new(
            triggers,
            lifecycle.clone(),
            Arc::new(StaticOwners(owners)),
            StuckJobDetector::new(lifecycle),
            RetentionSweeper::new(store.clone()),
        );
        Fixture {
            store,
            scheduler: Arc::new(scheduler),
        }
    }

    async fn all_jobs(store: &InMemoryJobStore) -> Vec<Job> {
        store
            .query(&JobFilter::default(), &PageRequest::new(None, Some(100)))
            .await
            .unwrap()
            .items
    }

    fn weekly_reports() -> Trigger {
        Trigger::new(
            "weekly-reports",
            "0 0 9 * * Mon",
            TriggerAction::EnqueuePerOwner {
                queue: "reports".to_string(),
                job_type: JobType::ReportGeneration,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn per_owner_firing_submits_one_job_per_owner() {
        let owners = vec![OwnerId::new(), OwnerId::new()];
        let fx = fixture(
            vec![weekly_reports()],
            owners.clone(),
            Arc::new(InMemoryQueueEngine::new("reports")),
        );

        let outcome = fx.scheduler.fire_now("weekly-reports").await.unwrap();
        assert_eq!(outcome, FiringOutcome::Enqueued { submitted: 2, failed: 0 });

        let jobs = all_jobs(&fx.store).await;
        assert_eq!(jobs.len(), 2);
        for job in &jobs {
            assert_eq!(job.status, JobStatus::Waiting);
            assert_eq!(job.job_type, JobType::ReportGeneration);
            assert!(owners.contains(&job.owner_id.unwrap()));
            assert_eq!(job.data["trigger"], "weekly-reports");
        }
    }

    #[tokio::test]
    async fn one_owner_failing_does_not_stop_the_others() {
        let good = OwnerId::new();
        let bad = OwnerId::new();
        let engine = RejectingOwner {
            inner: InMemoryQueueEngine::new("reports"),
            rejected: bad,
        };
        let fx = fixture(vec![weekly_reports()], vec![bad, good], Arc::new(engine));

        let outcome = fx.scheduler.fire_now("weekly-reports").await.unwrap();
        assert_eq!(outcome, FiringOutcome::Enqueued { submitted: 1, failed: 1 });

        let jobs = all_jobs(&fx.store).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].owner_id, Some(good));
    }

    #[tokio::test]
    async fn unknown_trigger_is_not_found() {
        let fx = fixture(vec![], vec![], Arc::new(InMemoryQueueEngine::new("reports")));
        assert!(matches!(
            fx.scheduler.fire_now("nope").await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sweep_triggers_invoke_detector_and_sweeper() {
        let triggers = vec![
            Trigger::new("stuck-job-sweep", "0 */10 * * * *", TriggerAction::StuckSweep).unwrap(),
            Trigger::new(
                "retention-sweep",
                "0 0 3 * * *",
                TriggerAction::RetentionSweep {
                    older_than_days: 30,
                    limit: 100,
                },
            )
            .unwrap(),
        ];
        let fx = fixture(triggers, vec![], Arc::new(InMemoryQueueEngine::new("reports")));

        let now = Utc::now();
        let mut hung = Job::new(
            NewJob::new("hung", "reports", JobType::ReportGeneration, json!({})),
            now - Duration::hours(1),
        );
        hung.activate(now - Duration::minutes(45)).unwrap();
        fx.store.put(hung.clone()).unwrap();

        let mut ancient = Job::new(
            NewJob::new("ancient", "maintenance", JobType::CacheCleanup, json!({})),
            now - Duration::days(90),
        );
        ancient.status = JobStatus::Completed;
        fx.store.put(ancient).unwrap();

        assert_eq!(
            fx.scheduler.fire_now("stuck-job-sweep").await.unwrap(),
            FiringOutcome::StuckSwept { marked: 1 }
        );
        assert_eq!(
            fx.store.find_by_id(hung.id).await.unwrap().unwrap().status,
            JobStatus::Stuck
        );

        assert_eq!(
            fx.scheduler.fire_now("retention-sweep").await.unwrap(),
            FiringOutcome::RetentionSwept { deleted: 1 }
        );
        assert_eq!(all_jobs(&fx.store).await.len(), 1);
    }

    #[tokio::test]
    async fn started_trigger_fires_on_its_calendar_until_shutdown() {
        let every_second = Trigger::new(
            "every-second",
            "* * * * * *",
            TriggerAction::EnqueueOnce {
                queue: "maintenance".to_string(),
                job_type: JobType::CacheCleanup,
            },
        )
        .unwrap();
        // A trigger whose queue is missing fails on every firing without
        // affecting the other loop.
        let broken = Trigger::new(
            "broken",
            "* * * * * *",
            TriggerAction::EnqueueOnce {
                queue: "ghost".to_string(),
                job_type: JobType::CacheCleanup,
            },
        )
        .unwrap();
        let fx = fixture(
            vec![every_second, broken],
            vec![],
            Arc::new(InMemoryQueueEngine::new("reports")),
        );

        let handle = fx.scheduler.clone().start();
        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
        while all_jobs(&fx.store).await.len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        handle.shutdown().await;

        let fired = all_jobs(&fx.store).await.len();
        assert!(fired >= 2, "expected at least two firings, saw {fired}");

        tokio::time::sleep(StdDuration::from_millis(1200)).await;
        // In-flight firings at shutdown time may still land.
        assert!(all_jobs(&fx.store).await.len() <= fired + 1);
    }
}
