use std::sync::Arc;

use jobwarden_api::app::{AppServices, build_app};
use chrono::{Duration, Utc};
use jobwarden_core::{Job, JobStatus, JobType, NewJob, OwnerId};
use jobwarden_infra::config::AppConfig;
use jobwarden_infra::jobs::SubmitOptions;
use reqwest::StatusCode;
use serde_json::{Value, json};

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(&AppConfig::default()).await
    }

    async fn spawn_with(config: &AppConfig) -> Self {
        // Same router as prod over the in-memory store, bound to an ephemeral port.
        let services = Arc::new(AppServices::in_memory(config).unwrap());
        let app = build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn submit(&self, queue: &str, job_type: JobType, owner: Option<OwnerId>) -> Job {
        let options = SubmitOptions {
            owner_id: owner,
            ..Default::default()
        };
        self.services
            .lifecycle
            .submit(queue, job_type, json!({"source": "test"}), options)
            .await
            .unwrap()
    }

    /// Insert a finished record created `days` ago, bypassing the engine.
    async fn seed_finished(&self, status: JobStatus, days: i64) -> Job {
        let mut job = Job::new(
            NewJob::new(
                format!("seed-{}", jobwarden_core::JobId::new()),
                "reports",
                JobType::ReportGeneration,
                json!({}),
            ),
            Utc::now() - Duration::days(days),
        );
        job.status = status;
        self.services.lifecycle.store().create(job).await.unwrap()
    }

    /// Drive a submitted job to FAILED through the worker callbacks.
    async fn fail(&self, job: &Job, error: &str) {
        let lifecycle = &self.services.lifecycle;
        lifecycle
            .mark_active(&job.queue_name, &job.engine_job_id)
            .await
            .unwrap();
        lifecycle
            .fail(&job.queue_name, &job.engine_job_id, error, None)
            .await
            .unwrap();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn jobs_are_listed_filtered_and_paged() {
    let srv = TestServer::spawn().await;
    let owner = OwnerId::new();
    for _ in 0..3 {
        srv.submit("reports", JobType::ReportGeneration, Some(owner)).await;
    }
    srv.submit("sync", JobType::EmailSync, None).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .get(srv.url(&format!("/jobs?owner={owner}&pageSize=2")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 3);
    assert_eq!(body["pageSize"], 2);
    assert_eq!(body["totalPages"], 2);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
    assert_eq!(body["jobs"][0]["type"], "REPORT_GENERATION");
    assert_eq!(body["jobs"][0]["status"], "WAITING");

    let body: Value = client
        .get(srv.url("/jobs?type=EMAIL_SYNC"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);

    let res = client.get(srv.url("/jobs?sortBy=payload")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn job_detail_includes_logs() {
    let srv = TestServer::spawn().await;
    let job = srv.submit("reports", JobType::ReportGeneration, None).await;
    srv.fail(&job, "disk full").await;
    srv.services
        .logger
        .log_for(job.id, jobwarden_core::LogLevel::Error, "disk full", None, None)
        .await;

    let res = reqwest::get(srv.url(&format!("/jobs/{}", job.id))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["job"]["status"], "FAILED");
    assert_eq!(body["job"]["error"], "disk full");
    assert_eq!(body["logs"][0]["message"], "disk full");

    let res = reqwest::get(srv.url("/jobs/not-a-uuid")).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = reqwest::get(srv.url(&format!("/jobs/{}", jobwarden_core::JobId::new())))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn failed_job_can_be_retried_with_reset() {
    let srv = TestServer::spawn().await;
    let job = srv.submit("reports", JobType::ReportGeneration, None).await;
    srv.fail(&job, "disk full").await;

    let client = reqwest::Client::new();
    let res = client
        .post(srv.url(&format!("/jobs/{}/retry", job.id)))
        .json(&json!({ "resetAttempts": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "WAITING");
    assert_eq!(body["attempts"], 0);

    // A waiting job is not retryable.
    let res = client
        .post(srv.url(&format!("/jobs/{}/retry", job.id)))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_transition");
}

#[tokio::test]
async fn cancel_removes_waiting_jobs_only() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let waiting = srv.submit("reports", JobType::ReportGeneration, None).await;
    let res = client
        .delete(srv.url(&format!("/jobs/{}", waiting.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    let res = client
        .get(srv.url(&format!("/jobs/{}", waiting.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let done = srv.submit("reports", JobType::ReportGeneration, None).await;
    let lifecycle = &srv.services.lifecycle;
    lifecycle.mark_active("reports", &done.engine_job_id).await.unwrap();
    lifecycle
        .complete("reports", &done.engine_job_id, json!({"url": "s3://r"}))
        .await
        .unwrap();
    let res = client
        .delete(srv.url(&format!("/jobs/{}", done.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_cancelable");
}

#[tokio::test]
async fn stats_report_success_rate() {
    let srv = TestServer::spawn().await;
    let lifecycle = &srv.services.lifecycle;
    for i in 0..3 {
        let job = srv.submit("reports", JobType::ReportGeneration, None).await;
        lifecycle.mark_active("reports", &job.engine_job_id).await.unwrap();
        if i == 0 {
            lifecycle
                .fail("reports", &job.engine_job_id, "boom", None)
                .await
                .unwrap();
        } else {
            lifecycle
                .complete("reports", &job.engine_job_id, json!(null))
                .await
                .unwrap();
        }
    }

    let body: Value = reqwest::get(srv.url("/jobs/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 3);
    assert_eq!(body["byStatus"]["completed"], 2);
    assert_eq!(body["byStatus"]["failed"], 1);
    let rate = body["successRate"].as_f64().unwrap();
    assert!((rate - 200.0 / 3.0).abs() < 1e-9);
    assert_eq!(body["byType"][0]["type"], "REPORT_GENERATION");
}

#[tokio::test]
async fn queue_controls_round_trip() {
    let srv = TestServer::spawn().await;
    srv.submit("reports", JobType::ReportGeneration, None).await;
    srv.submit("reports", JobType::ReportGeneration, None).await;
    let client = reqwest::Client::new();

    let all: Value = client
        .get(srv.url("/queues"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        all.as_array().unwrap().len(),
        AppConfig::default().queues.len()
    );

    let res = client.post(srv.url("/queues/reports/pause")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"]["isPaused"], true);

    let res = client.post(srv.url("/queues/reports/resume")).send().await.unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"]["isPaused"], false);
    assert_eq!(body["status"]["counts"]["waiting"], 2);

    let res = client
        .post(srv.url("/queues/reports/drain"))
        .json(&json!({ "removeDelayed": true }))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"]["counts"]["waiting"], 0);

    let res = client.get(srv.url("/queues/nowhere")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "queue_not_found");

    let res = client.post(srv.url("/queues/reports/explode")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn maintenance_endpoints_run_sweeps() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/maintenance/cleanup"))
        .json(&json!({ "olderThanDays": 30, "status": "COMPLETED" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["deleted"], 0);

    let res = client
        .post(srv.url("/maintenance/cleanup"))
        .json(&json!({ "olderThanDays": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(srv.url("/maintenance/stuck-sweep"))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["marked"], 0);
    assert_eq!(body["thresholdMinutes"], 30);
}

#[tokio::test]
async fn triggers_can_be_listed_and_fired() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let triggers: Value = client
        .get(srv.url("/scheduler/triggers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(
        triggers
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["name"] == "nightly-cache-cleanup")
    );

    let res = client
        .post(srv.url("/scheduler/triggers/nightly-cache-cleanup/fire"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["kind"], "enqueued");
    assert_eq!(body["submitted"], 1);

    let listed: Value = client
        .get(srv.url("/jobs?queue=maintenance"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["jobs"][0]["type"], "CACHE_CLEANUP");

    let res = client
        .post(srv.url("/scheduler/triggers/nope/fire"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cleanup_deletes_only_matching_records() {
    let srv = TestServer::spawn().await;
    let completed = srv.seed_finished(JobStatus::Completed, 40).await;
    let failed = srv.seed_finished(JobStatus::Failed, 40).await;
    let recent = srv.seed_finished(JobStatus::Failed, 5).await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/maintenance/cleanup"))
        .json(&json!({ "olderThanDays": 30, "status": "FAILED" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["deleted"], 1);

    let status_of = |id: jobwarden_core::JobId| {
        let client = client.clone();
        let url = srv.url(&format!("/jobs/{id}"));
        async move { client.get(url).send().await.unwrap().status() }
    };
    assert_eq!(status_of(failed.id).await, StatusCode::NOT_FOUND);
    assert_eq!(status_of(completed.id).await, StatusCode::OK);
    assert_eq!(status_of(recent.id).await, StatusCode::OK);
}

#[tokio::test]
async fn cleanup_rejects_bodies_it_cannot_read() {
    let srv = TestServer::spawn().await;
    let old = srv.seed_finished(JobStatus::Completed, 40).await;
    let client = reqwest::Client::new();

    // No content type: must not fall back to the default 30-day, any-status sweep.
    let res = client
        .post(srv.url("/maintenance/cleanup"))
        .body(r#"{"olderThanDays":90,"status":"FAILED"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_body");

    let res = client
        .post(srv.url("/maintenance/cleanup"))
        .header("content-type", "application/json")
        .body(r#"{"olderThanDays": 90,"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(srv.url("/maintenance/cleanup"))
        .json(&json!({ "olderThanDays": 4_000_000_000u32 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .get(srv.url(&format!("/jobs/{}", old.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn retry_and_queue_actions_reject_untyped_bodies() {
    let srv = TestServer::spawn().await;
    let job = srv.submit("reports", JobType::ReportGeneration, None).await;
    srv.fail(&job, "disk full").await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url(&format!("/jobs/{}/retry", job.id)))
        .body(r#"{"resetAttempts":true}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let res = reqwest::get(srv.url(&format!("/jobs/{}", job.id))).await.unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["job"]["status"], "FAILED");
    assert_eq!(body["job"]["attempts"], 1);

    // An empty body still means defaults.
    let res = client
        .post(srv.url(&format!("/jobs/{}/retry", job.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "WAITING");
    assert_eq!(body["attempts"], 1);

    let res = client
        .post(srv.url("/queues/reports/drain"))
        .body("removeDelayed=true")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let status: Value = client
        .get(srv.url("/queues/reports"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["counts"]["waiting"], 1);
}

#[tokio::test]
async fn fired_cache_cleanup_is_run_by_in_process_worker() {
    let mut config = AppConfig::default();
    config.workers.enabled = true;
    config.workers.poll_interval_ms = 5;
    let srv = TestServer::spawn_with(&config).await;
    let workers = srv.services.spawn_workers(&config.workers);
    assert_eq!(workers.len(), 1);
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/scheduler/triggers/nightly-cache-cleanup/fire"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let job = loop {
        let listed: Value = client
            .get(srv.url("/jobs?queue=maintenance"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let job = listed["jobs"][0].clone();
        if job["status"] == "COMPLETED" {
            break job;
        }
        assert!(tokio::time::Instant::now() < deadline, "cleanup job stuck at {}", job["status"]);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    assert_eq!(job["type"], "CACHE_CLEANUP");
    assert_eq!(job["result"]["success"], true);
    assert_eq!(job["attempts"], 1);

    for worker in workers {
        worker.shutdown().await;
    }
}
