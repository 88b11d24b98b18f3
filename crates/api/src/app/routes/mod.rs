use axum::Router;

pub mod jobs;
pub mod maintenance;
pub mod queues;
pub mod scheduler;
pub mod system;

/// Router for the job monitoring and administration endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/queues", queues::router())
        .nest("/maintenance", maintenance::router())
        .nest("/scheduler", scheduler::router())
}
