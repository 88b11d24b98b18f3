use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tracing::{info, warn};

use jobwarden_infra::config::{AppConfig, WorkersConfig};
use jobwarden_infra::jobs::{
    JobHooks, JobLifecycle, JobLogger, JobProcessor, WorkerConfig, WorkerHandle,
    register_builtin_handlers, spawn_worker,
};
use jobwarden_infra::monitoring::{RetentionSweeper, StatisticsAggregator, StuckJobDetector};
use jobwarden_infra::queue::{InMemoryQueueEngine, JobSource, QueueController, QueueEngine};
use jobwarden_infra::scheduler::{
    CombinedOwners, Scheduler, StaticOwners, StoreOwners, default_triggers,
};
use jobwarden_infra::store::{InMemoryJobStore, JobStore, PostgresJobStore};

/// Everything the HTTP handlers and the background scheduler share.
#[derive(Clone)]
pub struct AppServices {
    pub lifecycle: Arc<JobLifecycle>,
    pub logger: JobLogger,
    pub queues: Arc<QueueController>,
    pub stats: StatisticsAggregator,
    pub stuck: StuckJobDetector,
    pub retention: RetentionSweeper,
    pub scheduler: Arc<Scheduler>,
    /// Built-in handlers run by in-process workers.
    pub processor: Arc<JobProcessor>,
    sources: BTreeMap<String, Arc<dyn JobSource>>,
}

/// One configured queue: the admin handle and the worker-side delivery handle.
pub struct RegisteredQueue {
    pub engine: Arc<dyn QueueEngine>,
    pub source: Arc<dyn JobSource>,
}

pub fn in_memory_queues(names: &[String]) -> Vec<RegisteredQueue> {
    names
        .iter()
        .map(|name| {
            let engine = Arc::new(InMemoryQueueEngine::new(name.clone()));
            RegisteredQueue {
                engine: engine.clone(),
                source: engine,
            }
        })
        .collect()
}

#[cfg(feature = "redis")]
pub async fn redis_queues(url: &str, names: &[String]) -> anyhow::Result<Vec<RegisteredQueue>> {
    use jobwarden_infra::queue::RedisQueueEngine;

    let Some((first, rest)) = names.split_first() else {
        return Ok(Vec::new());
    };
    let first = Arc::new(RedisQueueEngine::connect(url, first.clone()).await?);
    let conn = first.connection();
    let mut queues = vec![RegisteredQueue {
        engine: first.clone(),
        source: first,
    }];
    for name in rest {
        let engine = Arc::new(RedisQueueEngine::with_connection(conn.clone(), name.clone()));
        queues.push(RegisteredQueue {
            engine: engine.clone(),
            source: engine,
        });
    }
    Ok(queues)
}

#[cfg(not(feature = "redis"))]
pub async fn redis_queues(_url: &str, _names: &[String]) -> anyhow::Result<Vec<RegisteredQueue>> {
    anyhow::bail!("redis_url is set but this build has no redis support (enable the `redis` feature)")
}

impl AppServices {
    /// Wire services over `store`, with one in-memory engine per configured queue.
    pub fn with_store(config: &AppConfig, store: Arc<dyn JobStore>) -> anyhow::Result<Self> {
        Self::assemble(config, store, in_memory_queues(&config.queues))
    }

    pub fn assemble(
        config: &AppConfig,
        store: Arc<dyn JobStore>,
        registered: Vec<RegisteredQueue>,
    ) -> anyhow::Result<Self> {
        let mut controller = QueueController::new();
        let mut sources = BTreeMap::new();
        for queue in registered {
            sources.insert(queue.source.queue_name().to_string(), queue.source);
            controller.register(queue.engine);
        }
        let queues = Arc::new(controller);

        let lifecycle = Arc::new(
            JobLifecycle::new(store.clone(), queues.clone())
                .with_default_max_attempts(config.default_max_attempts),
        );
        let stuck = StuckJobDetector::new(lifecycle.clone())
            .with_threshold(Duration::minutes(i64::from(config.stuck.threshold_minutes)));
        let retention = RetentionSweeper::new(store.clone());

        let owners = CombinedOwners::new()
            .with(Arc::new(StaticOwners(config.owners.clone())))
            .with(Arc::new(StoreOwners(store.clone())));
        let scheduler = Scheduler::new(
            default_triggers(config)?,
            lifecycle.clone(),
            Arc::new(owners),
            stuck.clone(),
            retention.clone(),
        );

        let logger = JobLogger::new(store.clone());
        let mut processor = JobProcessor::new(JobHooks::new(lifecycle.clone(), logger.clone()));
        register_builtin_handlers(
            &mut processor,
            queues.clone(),
            StdDuration::from_secs(config.workers.cache_cleanup_grace_minutes.saturating_mul(60)),
        );

        Ok(Self {
            logger,
            processor: Arc::new(processor),
            sources,
            stats: StatisticsAggregator::new(store),
            lifecycle,
            queues,
            stuck,
            retention,
            scheduler: Arc::new(scheduler),
        })
    }

    /// Start one polling worker per queue in `config.queues`.
    pub fn spawn_workers(&self, config: &WorkersConfig) -> Vec<WorkerHandle> {
        let poll_interval = StdDuration::from_millis(config.poll_interval_ms);
        config
            .queues
            .iter()
            .filter_map(|name| match self.sources.get(name) {
                Some(source) => Some(spawn_worker(
                    source.clone(),
                    self.processor.clone(),
                    WorkerConfig::default()
                        .with_name(format!("{name}-worker"))
                        .with_poll_interval(poll_interval),
                )),
                None => {
                    warn!(queue = %name, "no such queue; worker not started");
                    None
                }
            })
            .collect()
    }

    /// In-memory store; used by tests and local runs without a database.
    pub fn in_memory(config: &AppConfig) -> anyhow::Result<Self> {
        Self::with_store(config, InMemoryJobStore::arc())
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url, config.database_max_connections).await?;
            store.ensure_schema().await?;
            info!(max_connections = config.database_max_connections, "using postgres job store");
            Arc::new(store)
        }
        None => {
            warn!("database_url not set; job records are kept in memory");
            InMemoryJobStore::arc()
        }
    };
    let queues = match &config.redis_url {
        Some(url) => {
            let queues = redis_queues(url, &config.queues).await?;
            info!(queues = queues.len(), "using redis queue engine");
            queues
        }
        None => {
            warn!("redis_url not set; queues are kept in process memory");
            in_memory_queues(&config.queues)
        }
    };
    AppServices::assemble(config, store, queues)
}
