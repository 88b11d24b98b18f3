use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use jobwarden_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobwarden_observability::init();

    let config = AppConfig::load().context("failed to load configuration")?;
    let addr = config.socket_addr()?;

    let services = Arc::new(jobwarden_api::app::build_services(&config).await?);

    let scheduler = if config.scheduler.enabled {
        Some(services.scheduler.clone().start())
    } else {
        info!("scheduler disabled by configuration");
        None
    };

    let workers = if config.workers.enabled {
        let workers = services.spawn_workers(&config.workers);
        info!(workers = workers.len(), "in-process workers started");
        workers
    } else {
        Vec::new()
    };

    let app = jobwarden_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    for worker in workers {
        worker.shutdown().await;
    }
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
