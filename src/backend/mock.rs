//! Scripted backend for exercising the orchestrator without real
//! transfers. Each `start` consumes the next queued script; `poll` replays
//! it one status at a time, repeating the final entry once exhausted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use crate::jobs::{Job, JobKind};

use super::traits::{BackendError, TransferBackend};
use super::types::{TransferHandle, TransferState, TransferStatus};

#[derive(Default)]
pub struct MockBackend {
    kind: Option<JobKind>,
    scripts: Mutex<VecDeque<Vec<TransferStatus>>>,
    active: Mutex<HashMap<Uuid, VecDeque<TransferStatus>>>,
    fail_start_with: Mutex<Option<BackendError>>,
    start_delay: Mutex<Option<std::time::Duration>>,
    pub starts: AtomicUsize,
    pub polls: AtomicUsize,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl MockBackend {
    pub fn new(kind: JobKind) -> Self {
        MockBackend {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Queue the statuses the next started transfer will report, in order.
    pub fn push_script(&self, script: Vec<TransferStatus>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(script);
    }

    /// Make the next `start` call fail with `err`.
    pub fn fail_next_start(&self, err: BackendError) {
        *self
            .fail_start_with
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    /// Make every `start` call linger before returning its handle.
    pub fn set_start_delay(&self, delay: std::time::Duration) {
        *self
            .start_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }
}

#[async_trait]
impl TransferBackend for MockBackend {
    fn kind(&self) -> JobKind {
        self.kind.unwrap_or(JobKind::DirectFile)
    }

    async fn start(&self, _job: &Job) -> Result<TransferHandle, BackendError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .start_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self
            .fail_start_with
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(err);
        }

        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| vec![TransferStatus::running(0, None, 0)]);
        let (handle, _control) = TransferHandle::new(self.kind());
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id(), script.into());
        Ok(handle)
    }

    async fn poll(&self, handle: &TransferHandle) -> Result<TransferStatus, BackendError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let script = active
            .get_mut(&handle.id())
            .ok_or(BackendError::Transient("unknown transfer".into()))?;
        let status = if script.len() > 1 {
            script.pop_front().unwrap_or_else(TransferStatus::starting)
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(TransferStatus::starting)
        };
        Ok(status)
    }

    async fn pause(&self, handle: &TransferHandle) -> Result<(), BackendError> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(script) = active.get_mut(&handle.id()) {
            script.push_front(TransferStatus {
                state: TransferState::Paused,
                ..TransferStatus::starting()
            });
        }
        Ok(())
    }

    async fn resume(&self, handle: &TransferHandle) -> Result<(), BackendError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(script) = active.get_mut(&handle.id()) {
            if script.front().map(|s| &s.state) == Some(&TransferState::Paused) {
                script.pop_front();
            }
        }
        Ok(())
    }

    async fn cancel(&self, handle: &TransferHandle) -> Result<(), BackendError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(script) = active.get_mut(&handle.id()) {
            script.clear();
            script.push_back(TransferStatus {
                state: TransferState::Cancelled,
                ..TransferStatus::starting()
            });
        }
        Ok(())
    }
}
