use axum::http::{HeaderMap, header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use jobwarden_core::{Job, JobId, JobLogEntry, JobStatus, JobType, OwnerId};
use jobwarden_infra::scheduler::{Trigger, TriggerAction};
use jobwarden_infra::store::{JobFilter, Page, PageRequest, SortDirection, SortField};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub queue: Option<String>,
    pub owner: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
}

impl ListJobsQuery {
    pub fn filter(&self) -> Result<JobFilter, axum::response::Response> {
        Ok(JobFilter {
            status: self.status.as_deref().map(parse_status).transpose()?,
            job_type: self.job_type.as_deref().map(parse_job_type).transpose()?,
            queue_name: self.queue.clone().filter(|q| !q.is_empty()),
            owner_id: self.owner.as_deref().map(parse_owner_id).transpose()?,
        })
    }

    pub fn page(&self) -> Result<PageRequest, axum::response::Response> {
        let sort_by: SortField = match self.sort_by.as_deref() {
            Some(raw) => parse_keyword(raw, "invalid_sort_by", "sortBy")?,
            None => SortField::default(),
        };
        let sort_dir: SortDirection = match self.sort_dir.as_deref() {
            Some(raw) => parse_keyword(&raw.to_ascii_lowercase(), "invalid_sort_dir", "sortDir")?,
            None => SortDirection::default(),
        };
        Ok(PageRequest::new(self.page, self.page_size).sorted(sort_by, sort_dir))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub owner: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    #[serde(default)]
    pub reset_attempts: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueActionRequest {
    pub grace_ms: Option<u64>,
    pub remove_delayed: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub older_than_days: Option<u32>,
    pub status: Option<String>,
    pub limit: Option<u64>,
}

/// Decode an optional JSON request body.
///
/// An empty body yields `T::default()`. Anything else must carry a JSON
/// content type and deserialize into `T`, or the request is rejected with 400.
pub fn parse_optional_body<T>(headers: &HeaderMap, body: &[u8]) -> Result<T, axum::response::Response>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    if !has_json_content_type(headers) {
        return Err(errors::bad_request(
            "invalid_body",
            "request body must be sent with Content-Type: application/json",
        ));
    }
    serde_json::from_slice(body)
        .map_err(|e| errors::bad_request("invalid_body", format!("invalid JSON body: {e}")))
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .is_some_and(|mime| {
            mime.eq_ignore_ascii_case("application/json")
                || (mime.starts_with("application/") && mime.ends_with("+json"))
        })
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

impl From<Page<Job>> for JobListResponse {
    fn from(page: Page<Job>) -> Self {
        Self {
            total_pages: page.total_pages(),
            total: page.total,
            page: page.page,
            page_size: page.page_size,
            jobs: page.items,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    pub job: Job,
    pub logs: Vec<JobLogEntry>,
}

#[derive(Debug, Serialize)]
pub struct TriggerView {
    pub name: String,
    pub expression: String,
    pub action: String,
}

impl From<&Trigger> for TriggerView {
    fn from(trigger: &Trigger) -> Self {
        let action = match trigger.action() {
            TriggerAction::EnqueuePerOwner { queue, job_type } => {
                format!("enqueue {job_type} into {queue} for every owner")
            }
            TriggerAction::EnqueueOnce { queue, job_type } => {
                format!("enqueue {job_type} into {queue}")
            }
            TriggerAction::StuckSweep => "stuck-job sweep".to_string(),
            TriggerAction::RetentionSweep {
                older_than_days,
                limit,
            } => format!("retention sweep older than {older_than_days} days, up to {limit} rows"),
        };
        Self {
            name: trigger.name().to_string(),
            expression: trigger.expression().to_string(),
            action,
        }
    }
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::bad_request("invalid_id", format!("invalid job id: {raw}")))
}

pub fn parse_owner_id(raw: &str) -> Result<OwnerId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::bad_request("invalid_owner", format!("invalid owner id: {raw}")))
}

pub fn parse_status(raw: &str) -> Result<JobStatus, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::bad_request("invalid_status", format!("unknown job status: {raw}")))
}

pub fn parse_job_type(raw: &str) -> Result<JobType, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::bad_request("invalid_type", format!("unknown job type: {raw}")))
}

/// Parse a unit enum through its serde names.
fn parse_keyword<T: serde::de::DeserializeOwned>(
    raw: &str,
    code: &'static str,
    param: &str,
) -> Result<T, axum::response::Response> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| errors::bad_request(code, format!("unsupported {param}: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_builds_filter_and_page() {
        let owner = OwnerId::new();
        let query = ListJobsQuery {
            status: Some("failed".into()),
            job_type: Some("REPORT_GENERATION".into()),
            queue: Some("reports".into()),
            owner: Some(owner.to_string()),
            page: Some(2),
            page_size: Some(500),
            sort_by: Some("duration".into()),
            sort_dir: Some("ASC".into()),
        };

        let filter = query.filter().unwrap();
        assert_eq!(filter.status, Some(JobStatus::Failed));
        assert_eq!(filter.job_type, Some(JobType::ReportGeneration));
        assert_eq!(filter.owner_id, Some(owner));

        let page = query.page().unwrap();
        assert_eq!(page.page, 2);
        assert_eq!(page.page_size, PageRequest::MAX_PAGE_SIZE);
        assert_eq!(page.sort_by, SortField::Duration);
        assert_eq!(page.sort_dir, SortDirection::Asc);
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let query = ListJobsQuery {
            sort_by: Some("payload".into()),
            ..Default::default()
        };
        assert!(query.page().is_err());

        let query = ListJobsQuery {
            status: Some("sleeping".into()),
            ..Default::default()
        };
        assert!(query.filter().is_err());
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json; charset=utf-8".parse().unwrap());
        headers
    }

    #[test]
    fn empty_body_yields_defaults() {
        let body: CleanupRequest = parse_optional_body(&HeaderMap::new(), b"").unwrap();
        assert!(body.older_than_days.is_none());
        let body: RetryRequest = parse_optional_body(&json_headers(), b"  \n").unwrap();
        assert!(!body.reset_attempts);
    }

    #[test]
    fn typed_json_body_is_decoded() {
        let body: CleanupRequest =
            parse_optional_body(&json_headers(), br#"{"olderThanDays":90,"status":"FAILED"}"#).unwrap();
        assert_eq!(body.older_than_days, Some(90));
        assert_eq!(body.status.as_deref(), Some("FAILED"));
    }

    #[test]
    fn untyped_or_malformed_bodies_are_rejected() {
        let untyped = parse_optional_body::<CleanupRequest>(&HeaderMap::new(), br#"{"olderThanDays":90}"#);
        assert_eq!(untyped.unwrap_err().status(), axum::http::StatusCode::BAD_REQUEST);

        let malformed = parse_optional_body::<RetryRequest>(&json_headers(), b"{resetAttempts: true");
        assert_eq!(malformed.unwrap_err().status(), axum::http::StatusCode::BAD_REQUEST);

        let wrong_type = parse_optional_body::<CleanupRequest>(&json_headers(), br#"{"olderThanDays":"soon"}"#);
        assert_eq!(wrong_type.unwrap_err().status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
