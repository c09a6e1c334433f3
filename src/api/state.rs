use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::observability::Metrics;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Arc<RwLock<Config>>,
        orchestrator: Arc<Orchestrator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            metrics,
        }
    }
}
