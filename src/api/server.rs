use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::services::{
    cancel_job, get_job, health, list_jobs, pause_job, reload_config, resume_job, submit_job,
};
use super::state::AppState;
use super::ws::events_ws;
use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::events::EventBroadcaster;
use crate::observability::Metrics;
use crate::orchestrator::Orchestrator;
use crate::store::JobStore;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/pause", post(pause_job))
        .route("/api/jobs/{id}/resume", post(resume_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/ws", get(events_ws))
        .route("/api/config/reload", post(reload_config))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(address: Option<SocketAddr>) -> Result<(), AnyError> {
    info!("Loading configuration");
    let config = Config::load()?;
    let bind_addr = address.unwrap_or(config.server.bind_addr);

    info!(path = %config.server.store_path.display(), "Opening job store");
    let store = Arc::new(JobStore::open(&config.server.store_path)?);

    let metrics = Arc::new(Metrics::new());
    let backends = Arc::new(BackendRegistry::with_defaults(&config.backends)?);
    let events = EventBroadcaster::new(config.events.buffer_capacity);
    let config = Arc::new(RwLock::new(config));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        store.clone(),
        backends,
        events,
        metrics.clone(),
    ));
    orchestrator.recover().await?;
    orchestrator.spawn_scheduler();

    let state = AppState::new(config, orchestrator, metrics);
    let app = router(state);

    let listener = TcpListener::bind(bind_addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush pending writes so the next start recovers a clean table.
    store.persist()?;
    info!("Job store persisted, shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
