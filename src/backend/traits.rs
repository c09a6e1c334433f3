//! The contract every transfer backend implements.

use async_trait::async_trait;
use thiserror::Error;

use crate::jobs::{Job, JobKind};

use super::types::{TransferHandle, TransferStatus};

#[derive(Debug, Error)]
pub enum BackendError {
    /// The attempt failed for a reason worth retrying (network drop,
    /// engine crash, timeout).
    #[error("transient transfer error: {0}")]
    Transient(String),

    /// The attempt can never succeed as submitted (404, unwritable
    /// destination, malformed URL).
    #[error("fatal transfer error: {0}")]
    Fatal(String),

    /// The engine does not implement this operation on this platform.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl BackendError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BackendError::Transient(_))
    }
}

/// A transfer backend adapts one protocol family to the orchestrator.
///
/// `start` kicks off an attempt and returns a handle; every other method
/// operates on that handle. Backends must tolerate control calls arriving
/// after the transfer has already finished.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// The protocol family this backend services.
    fn kind(&self) -> JobKind;

    /// Begin a transfer attempt for `job`. The returned handle stays valid
    /// until the attempt reaches a terminal [`super::TransferState`].
    async fn start(&self, job: &Job) -> Result<TransferHandle, BackendError>;

    /// Report current progress. Must not block longer than a single status
    /// read; the orchestrator bounds the call with a timeout regardless.
    async fn poll(&self, handle: &TransferHandle) -> Result<TransferStatus, BackendError>;

    async fn pause(&self, handle: &TransferHandle) -> Result<(), BackendError>;

    async fn resume(&self, handle: &TransferHandle) -> Result<(), BackendError>;

    /// Request cancellation. Cooperative: the backend stops when it next
    /// observes the request, and confirms by reporting
    /// [`super::TransferState::Cancelled`].
    async fn cancel(&self, handle: &TransferHandle) -> Result<(), BackendError>;
}
