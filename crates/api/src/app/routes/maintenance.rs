use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::Extension,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
};
use serde_json::json;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/cleanup", post(cleanup))
        .route("/stuck-sweep", post(stuck_sweep))
}

/// Retention sweep over job records (not the engine; see `POST /queues/:name/clean`).
pub async fn cleanup(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let body: dto::CleanupRequest = match dto::parse_optional_body(&headers, &body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let status = match body.status.as_deref().map(dto::parse_status).transpose() {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    match services
        .retention
        .clean(body.older_than_days, status, body.limit)
        .await
    {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn stuck_sweep(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.stuck.sweep().await {
        Ok(marked) => Json(json!({
            "marked": marked,
            "thresholdMinutes": services.stuck.threshold().num_minutes(),
        }))
        .into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
