//! Filtering, paging and aggregate shapes for job queries.

use serde::{Deserialize, Serialize};

use jobwarden_core::{JobStatus, JobType, OwnerId};

/// Filter criteria for job listings. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    #[serde(rename = "type")]
    pub job_type: Option<JobType>,
    pub queue_name: Option<String>,
    pub owner_id: Option<OwnerId>,
}

impl JobFilter {
    pub fn owned_by(owner_id: Option<OwnerId>) -> Self {
        Self {
            owner_id,
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &jobwarden_core::Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.is_none_or(|t| job.job_type == t)
            && self
                .queue_name
                .as_deref()
                .is_none_or(|q| job.queue_name == q)
            && self.owner_id.is_none_or(|o| job.owner_id == Some(o))
    }
}

/// Sortable job columns.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    CreatedAt,
    StartedAt,
    CompletedAt,
    Duration,
    Priority,
    Status,
    #[serde(rename = "type")]
    Type,
}

impl SortField {
    /// Column name; only ever one of these fixed identifiers reaches SQL.
    pub fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::StartedAt => "started_at",
            SortField::CompletedAt => "completed_at",
            SortField::Duration => "duration_ms",
            SortField::Priority => "priority",
            SortField::Status => "status",
            SortField::Type => "job_type",
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One page of a listing (1-based page numbers).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub sort_by: SortField,
    pub sort_dir: SortDirection,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: Self::DEFAULT_PAGE_SIZE,
            sort_by: SortField::CreatedAt,
            sort_dir: SortDirection::Desc,
        }
    }
}

impl PageRequest {
    pub const DEFAULT_PAGE_SIZE: u32 = 20;
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(Self::DEFAULT_PAGE_SIZE)
                .clamp(1, Self::MAX_PAGE_SIZE),
            ..Default::default()
        }
    }

    pub fn sorted(mut self, sort_by: SortField, sort_dir: SortDirection) -> Self {
        self.sort_by = sort_by;
        self.sort_dir = sort_dir;
        self
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

/// A page of results plus the total match count for UI paging.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size))
    }
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
    pub stuck: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        let slot = match status {
            JobStatus::Waiting => &mut self.waiting,
            JobStatus::Active => &mut self.active,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Delayed => &mut self.delayed,
            JobStatus::Paused => &mut self.paused,
            JobStatus::Stuck => &mut self.stuck,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        self.waiting
            + self.active
            + self.completed
            + self.failed
            + self.delayed
            + self.paused
            + self.stuck
    }
}

/// Per-type breakdown. `avg_duration_ms` covers completed jobs with a positive duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeBreakdown {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub count: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
}
