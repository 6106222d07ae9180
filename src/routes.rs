use axum::{extract::State, routing::{get, post}, Json, Router};
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    handler::Orchestrator,
    models::{GenerationResponse, HealthReport, JobRequest, JobResult, JobStatus},
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run_job))
        .route("/runsync", post(run_job))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run one job envelope to completion. The HTTP status is always 200; the
/// outcome lives in `status` and `output`.
pub async fn run_job(State(state): State<AppState>, Json(body): Json<Value>) -> Json<JobResult> {
    let (id, input) = match serde_json::from_value::<JobRequest>(body) {
        Ok(job) => (job.id, Ok(job.input)),
        Err(e) => (None, Err(e)),
    };
    let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

    tracing::info!(job_id = %id, "🚀 Job received");

    let output = match input {
        Err(e) => {
            tracing::warn!(job_id = %id, error = %e, "⚠️ Unreadable job envelope");
            GenerationResponse::error(format!("Invalid job envelope: {e}"))
        }
        Ok(None) => GenerationResponse::error("Missing job input"),
        Ok(Some(input)) => {
            // isolate the handler so a panic becomes an error response
            let orchestrator = state.orchestrator.clone();
            match tokio::spawn(async move { orchestrator.handle(&input).await }).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "❌ Generation task aborted");
                    GenerationResponse::error("Internal error: generation task aborted")
                }
            }
        }
    };

    let status = if output.is_error() { JobStatus::Failed } else { JobStatus::Completed };
    tracing::info!(job_id = %id, ?status, "✅ Job finished");

    let refresh_worker = state.orchestrator.config().refresh_worker.then_some(true);
    Json(JobResult { id, status, output, refresh_worker })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        engine_ready: state.orchestrator.engine_ready(),
        templates: state.orchestrator.templates().names(),
    })
}
