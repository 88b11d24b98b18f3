use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/triggers", get(list_triggers))
        .route("/triggers/:name/fire", post(fire_trigger))
}

pub async fn list_triggers(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let triggers: Vec<dto::TriggerView> = services
        .scheduler
        .triggers()
        .iter()
        .map(dto::TriggerView::from)
        .collect();
    Json(triggers).into_response()
}

pub async fn fire_trigger(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match services.scheduler.fire_now(&name).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
