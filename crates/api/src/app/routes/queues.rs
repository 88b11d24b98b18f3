use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_queues))
        .route("/:name", get(queue_status))
        .route("/:name/:action", post(queue_action))
}

pub async fn list_queues(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.queues.list().await {
        Ok(queues) => Json(queues).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn queue_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match services.queues.status(&name).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// `pause`, `resume`, `clean` or `drain`. Responds with the queue's status afterwards.
pub async fn queue_action(
    Extension(services): Extension<Arc<AppServices>>,
    Path((name, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let body: dto::QueueActionRequest = match dto::parse_optional_body(&headers, &body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let queues = &services.queues;

    let outcome = match action.as_str() {
        "pause" => queues
            .pause(&name, body.grace_ms.map(Duration::from_millis))
            .await
            .map(|()| None),
        "resume" => queues.resume(&name).await.map(|()| None),
        "clean" => queues
            .clean(&name, Duration::from_millis(body.grace_ms.unwrap_or(0)))
            .await
            .map(Some),
        "drain" => queues
            .drain(&name, body.remove_delayed.unwrap_or(false))
            .await
            .map(|()| None),
        other => {
            return errors::bad_request(
                "invalid_action",
                format!("unknown queue action {other:?}; expected pause, resume, clean or drain"),
            );
        }
    };
    let removed = match outcome {
        Ok(removed) => removed,
        Err(e) => return errors::job_error_to_response(e),
    };

    match queues.status(&name).await {
        Ok(status) => Json(json!({
            "queue": name,
            "action": action,
            "removed": removed,
            "status": status,
        }))
        .into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
