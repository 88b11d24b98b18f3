//! Configuration loading and representation.
//!
//! Sources, later ones winning: built-in defaults, an optional `jobwarden.toml`
//! (or the file named by `JOBWARDEN_CONFIG`), then `JOBWARDEN_*` environment
//! variables. Nested keys use `__` (`JOBWARDEN_STUCK__THRESHOLD_MINUTES=45`);
//! list keys take comma-separated values (`JOBWARDEN_QUEUES=reports,sync`).

use std::net::SocketAddr;
use std::str::FromStr;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use jobwarden_core::OwnerId;

use crate::monitoring::retention::MAX_RETENTION_DAYS;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StuckConfig {
    pub threshold_minutes: u32,
    pub sweep_cron: String,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            threshold_minutes: 30,
            sweep_cron: "0 */10 * * * *".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    pub older_than_days: u32,
    pub batch_limit: u64,
    pub sweep_cron: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            older_than_days: 30,
            batch_limit: 10_000,
            sweep_cron: "0 0 3 * * *".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// In-process workers for the built-in maintenance handlers.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkersConfig {
    pub enabled: bool,
    /// Queues polled by in-process workers, one worker each.
    pub queues: Vec<String>,
    pub poll_interval_ms: u64,
    /// `CACHE_CLEANUP` removes finished engine jobs older than this.
    pub cache_cleanup_grace_minutes: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queues: vec!["maintenance".to_string()],
            poll_interval_ms: 500,
            cache_cleanup_grace_minutes: 24 * 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub http_addr: String,
    /// Postgres URL. When absent the process runs on the in-memory store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Redis URL for the shared queue engine. When absent queues live in process memory.
    pub redis_url: Option<String>,
    /// Queue names registered with the queue controller.
    pub queues: Vec<String>,
    /// Owners the scheduler always enqueues for, on top of owners found in the store.
    pub owners: Vec<OwnerId>,
    pub default_max_attempts: u32,
    pub stuck: StuckConfig,
    pub retention: RetentionConfig,
    pub scheduler: SchedulerConfig,
    pub workers: WorkersConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            database_max_connections: 10,
            redis_url: None,
            queues: [
                "reports",
                "insights",
                "budgets",
                "notifications",
                "maintenance",
                "sync",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            owners: Vec::new(),
            default_max_attempts: 3,
            stuck: StuckConfig::default(),
            retention: RetentionConfig::default(),
            scheduler: SchedulerConfig::default(),
            workers: WorkersConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the default file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("JOBWARDEN_CONFIG").unwrap_or_else(|_| "jobwarden".to_string());
        let config = Config::builder()
            .add_source(File::with_name(&file).required(false))
            .add_source(environment())
            .build()?;
        Self::from_config(config)
    }

    /// Parse a TOML document on top of the defaults. Mostly for tests.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::from_config(config)
    }

    fn from_config(config: Config) -> Result<Self, ConfigError> {
        let parsed: AppConfig = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.http_addr
            .parse()
            .map_err(|e| ConfigError::Message(format!("invalid http_addr {:?}: {e}", self.http_addr)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        if self.database_max_connections == 0 {
            return Err(invalid("database_max_connections must be positive"));
        }
        if self.queues.is_empty() {
            return Err(invalid("at least one queue must be configured"));
        }
        if self.default_max_attempts == 0 {
            return Err(invalid("default_max_attempts must be positive"));
        }
        if self.stuck.threshold_minutes == 0 {
            return Err(invalid("stuck.threshold_minutes must be positive"));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention.older_than_days) {
            return Err(ConfigError::Message(format!(
                "retention.older_than_days must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        if self.retention.batch_limit == 0 {
            return Err(invalid("retention.batch_limit must be positive"));
        }
        if self.workers.poll_interval_ms == 0 {
            return Err(invalid("workers.poll_interval_ms must be positive"));
        }
        if let Some(queue) = self.workers.queues.iter().find(|q| !self.queues.contains(q)) {
            return Err(ConfigError::Message(format!(
                "workers.queues names unknown queue {queue:?}"
            )));
        }
        for (key, expr) in [
            ("stuck.sweep_cron", &self.stuck.sweep_cron),
            ("retention.sweep_cron", &self.retention.sweep_cron),
        ] {
            cron::Schedule::from_str(expr)
                .map_err(|e| ConfigError::Message(format!("invalid {key} {expr:?}: {e}")))?;
        }
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix("JOBWARDEN")
        .prefix_separator("_")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("queues")
        .with_list_parse_key("owners")
        .with_list_parse_key("workers.queues")
        .try_parsing(true)
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Message(msg.to_string())
}
