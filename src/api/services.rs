//! HTTP handlers. Thin: validation and lifecycle logic live in the
//! orchestrator; handlers only translate between the wire and the core.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::jobs::JobSpec;

use super::error::ApiError;
use super::models::{HealthResponse, ReloadResponse, SubmitRequest, SubmitResponse};
use super::state::AppState;

/// POST /api/jobs
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = JobSpec::builder()
        .url(request.url)
        .maybe_kind(request.kind)
        .destination(request.destination)
        .maybe_format_hint(request.format_hint)
        .build();
    let job = state.orchestrator.submit(spec).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id: job.id })))
}

/// GET /api/jobs
pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.list().await)
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.get(id).await?;
    Ok(Json(job))
}

/// POST /api/jobs/{id}/pause
pub async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.pause(id).await?;
    Ok(Json(job))
}

/// POST /api/jobs/{id}/resume
pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.resume(id).await?;
    Ok(Json(job))
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.cancel(id).await?;
    Ok(Json(job))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        jobs: state.orchestrator.list().await.len(),
        subscribers: state.orchestrator.events().subscriber_count(),
        metrics: state.metrics.snapshot(),
    })
}

/// POST /api/config/reload
///
/// Re-reads the configuration sources and swaps the shared config.
/// Running transfers keep their old parameters; everything read per tick
/// (concurrency, retry policy, poll cadence) picks up the new values.
pub async fn reload_config(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let config = Config::load().map_err(|e| ApiError::Internal(e.to_string()))?;
    let response = ReloadResponse {
        reloaded: true,
        max_concurrent: config.downloads.max_concurrent,
        max_retries: config.downloads.max_retries,
    };
    state.orchestrator.reload_config(config).await;
    info!("configuration reload requested via API");
    Ok(Json(response))
}
