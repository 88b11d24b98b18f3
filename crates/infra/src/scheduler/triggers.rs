//! The fixed trigger table.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use jobwarden_core::JobType;

use crate::config::AppConfig;
use crate::error::{JobError, JobResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerAction {
    /// Enqueue one job per known owner.
    EnqueuePerOwner { queue: String, job_type: JobType },
    /// Enqueue a single, owner-less job.
    EnqueueOnce { queue: String, job_type: JobType },
    StuckSweep,
    RetentionSweep { older_than_days: u32, limit: u64 },
}

#[derive(Debug, Clone)]
pub struct Trigger {
    name: String,
    expression: String,
    schedule: Schedule,
    action: TriggerAction,
}

impl Trigger {
    /// `expression` uses the six-field (seconds first) cron syntax.
    pub fn new(
        name: impl Into<String>,
        expression: impl Into<String>,
        action: TriggerAction,
    ) -> JobResult<Self> {
        let name = name.into();
        let expression = expression.into();
        let schedule = Schedule::from_str(&expression).map_err(|e| {
            JobError::Validation(format!("trigger {name}: invalid cron expression {expression:?}: {e}"))
        })?;
        Ok(Self {
            name,
            expression,
            schedule,
            action,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn action(&self) -> &TriggerAction {
        &self.action
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Triggers the service runs with.
pub fn default_triggers(config: &AppConfig) -> JobResult<Vec<Trigger>> {
    let per_owner = |queue: &str, job_type| TriggerAction::EnqueuePerOwner {
        queue: queue.to_string(),
        job_type,
    };

    Ok(vec![
        Trigger::new(
            "weekly-reports",
            "0 0 9 * * Mon",
            per_owner("reports", JobType::ReportGeneration),
        )?,
        Trigger::new(
            "monthly-insights",
            "0 0 6 1 * *",
            per_owner("insights", JobType::InsightsGeneration),
        )?,
        Trigger::new(
            "hourly-budget-refresh",
            "0 0 * * * *",
            per_owner("budgets", JobType::BudgetRefresh),
        )?,
        Trigger::new(
            "daily-notification-digest",
            "0 0 8 * * *",
            per_owner("notifications", JobType::NotificationDigest),
        )?,
        Trigger::new(
            "nightly-cache-cleanup",
            "0 30 2 * * *",
            TriggerAction::EnqueueOnce {
                queue: "maintenance".to_string(),
                job_type: JobType::CacheCleanup,
            },
        )?,
        Trigger::new(
            "stuck-job-sweep",
            config.stuck.sweep_cron.as_str(),
            TriggerAction::StuckSweep,
        )?,
        Trigger::new(
            "retention-sweep",
            config.retention.sweep_cron.as_str(),
            TriggerAction::RetentionSweep {
                older_than_days: config.retention.older_than_days,
                limit: config.retention.batch_limit,
            },
        )?,
    ])
}
