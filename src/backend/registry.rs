//! Maps protocol families to the backend that services them.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::BackendsConfig;
use crate::jobs::JobKind;

use super::command::CommandBackend;
use super::direct::DirectBackend;
use super::traits::{BackendError, TransferBackend};

#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<JobKind, Arc<dyn TransferBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the production registry from configuration: a streaming HTTP
    /// backend for direct files and external engines for media and torrents.
    pub fn with_defaults(config: &BackendsConfig) -> Result<Self, BackendError> {
        let mut registry = Self::new();
        registry.register(Arc::new(DirectBackend::new(&config.direct)?));
        registry.register(Arc::new(CommandBackend::new(
            JobKind::StreamingMedia,
            config.media.clone(),
        )));
        registry.register(Arc::new(CommandBackend::new(
            JobKind::Torrent,
            config.torrent.clone(),
        )));
        Ok(registry)
    }

    /// Register a backend for its kind, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn TransferBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: JobKind) -> Result<Arc<dyn TransferBackend>, BackendError> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or(BackendError::Unsupported("no backend for this job kind"))
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.backends.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    #[test]
    fn test_register_and_get() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(MockBackend::new(JobKind::DirectFile)));
        assert!(registry.get(JobKind::DirectFile).is_ok());
        assert!(matches!(
            registry.get(JobKind::Torrent),
            Err(BackendError::Unsupported(_))
        ));
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(MockBackend::new(JobKind::Torrent)));
        registry.register(Arc::new(MockBackend::new(JobKind::Torrent)));
        assert_eq!(registry.kinds(), vec![JobKind::Torrent]);
    }
}
