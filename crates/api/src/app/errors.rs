use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use jobwarden_infra::JobError;

pub fn job_error_to_response(err: JobError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        JobError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        JobError::QueueNotFound(_) => json_error(StatusCode::BAD_REQUEST, "queue_not_found", message),
        JobError::InvalidTransition { .. } => {
            json_error(StatusCode::BAD_REQUEST, "invalid_transition", message)
        }
        JobError::NotCancelable { .. } => json_error(StatusCode::BAD_REQUEST, "not_cancelable", message),
        JobError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        JobError::EngineUnavailable(_) => {
            tracing::error!(error = %message, "queue engine failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "engine_unavailable", message)
        }
        JobError::Persistence(_) => {
            tracing::error!(error = %message, "persistence failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "persistence_error", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn bad_request(code: &'static str, message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwarden_core::{JobId, JobStatus};

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let id = JobId::new();
        let cases = [
            (JobError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (JobError::QueueNotFound("x".into()), StatusCode::BAD_REQUEST),
            (
                JobError::NotCancelable {
                    job_id: id,
                    status: JobStatus::Completed,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                JobError::InvalidTransition {
                    job_id: id,
                    from: JobStatus::Waiting,
                    action: "retry",
                },
                StatusCode::BAD_REQUEST,
            ),
            (JobError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (JobError::Persistence("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (JobError::EngineUnavailable("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(job_error_to_response(err).status(), expected);
        }
    }
}
