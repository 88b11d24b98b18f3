use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job).delete(cancel_job))
        .route("/:id/retry", post(retry_job))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let filter = match query.filter() {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let page = match query.page() {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match services.lifecycle.store().query(&filter, &page).await {
        Ok(result) => Json(dto::JobListResponse::from(result)).into_response(),
        Err(e) => errors::job_error_to_response(e.into()),
    }
}

pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::StatsQuery>,
) -> axum::response::Response {
    let owner = match query.owner.as_deref().map(dto::parse_owner_id).transpose() {
        Ok(o) => o,
        Err(resp) => return resp,
    };

    match services.stats.overview(owner).await {
        Ok(overview) => Json(overview).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let job = match services.lifecycle.get(job_id).await {
        Ok(job) => job,
        Err(e) => return errors::job_error_to_response(e),
    };
    let logs = match services.logger.recent(job_id, None).await {
        Ok(logs) => logs,
        Err(e) => return errors::job_error_to_response(e),
    };

    Json(dto::JobDetailResponse { job, logs }).into_response()
}

pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body: dto::RetryRequest = match dto::parse_optional_body(&headers, &body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match services.lifecycle.retry(job_id, body.reset_attempts).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.lifecycle.cancel(job_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
