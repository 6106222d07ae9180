use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, EnvFilter};

use hyvideo_worker::routes::{router, AppState};
use hyvideo_worker::{EngineClient, Orchestrator, TemplateStore, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = WorkerConfig::from_env().context("invalid configuration")?;
    let templates = TemplateStore::load(config.workflow_dir.as_deref()).context("failed to load workflow templates")?;
    if templates.get(&config.default_workflow).is_none() {
        anyhow::bail!(
            "default workflow {:?} not found (available: {})",
            config.default_workflow,
            templates.names().join(", ")
        );
    }

    let engine = Arc::new(EngineClient::new(config.engine_base_url()));
    tracing::info!(
        engine = engine.base_url(),
        output_dir = %config.output_dir.display(),
        poll_interval_ms = config.polling.interval.as_millis() as u64,
        poll_max_attempts = config.polling.max_attempts,
        refresh_worker = config.refresh_worker,
        "Worker configured"
    );

    let port = config.port;
    let state = AppState {
        orchestrator: Arc::new(Orchestrator::new(config, templates, engine)),
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
