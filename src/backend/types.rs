//! Shared types crossing the backend boundary: status reports and the
//! opaque per-transfer handle.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

use crate::jobs::JobKind;

/// Where a transfer attempt currently stands, as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed { message: String, fatal: bool },
}

/// A point-in-time progress report for one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    pub bytes_done: u64,
    /// Unknown until the backend learns the payload size, if it ever does.
    pub bytes_total: Option<u64>,
    pub rate_bps: u64,
    pub state: TransferState,
}

impl TransferStatus {
    pub fn starting() -> Self {
        TransferStatus {
            bytes_done: 0,
            bytes_total: None,
            rate_bps: 0,
            state: TransferState::Running,
        }
    }

    pub fn running(bytes_done: u64, bytes_total: Option<u64>, rate_bps: u64) -> Self {
        TransferStatus {
            bytes_done,
            bytes_total,
            rate_bps,
            state: TransferState::Running,
        }
    }

    pub fn completed(bytes_done: u64, bytes_total: Option<u64>) -> Self {
        TransferStatus {
            bytes_done,
            bytes_total,
            rate_bps: 0,
            state: TransferState::Completed,
        }
    }

    pub fn failed(message: impl Into<String>, fatal: bool) -> Self {
        TransferStatus {
            bytes_done: 0,
            bytes_total: None,
            rate_bps: 0,
            state: TransferState::Failed {
                message: message.into(),
                fatal,
            },
        }
    }
}

/// Control signal delivered to the task driving a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// Opaque handle to a live transfer attempt. Cheap to clone; all clones
/// observe the same shared status and feed the same control channel.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: Uuid,
    kind: JobKind,
    status: Arc<Mutex<TransferStatus>>,
    control: watch::Sender<ControlSignal>,
}

impl TransferHandle {
    /// Create a handle plus the receiver half the driving task listens on.
    pub fn new(kind: JobKind) -> (Self, watch::Receiver<ControlSignal>) {
        let (control, rx) = watch::channel(ControlSignal::Run);
        let handle = TransferHandle {
            id: Uuid::new_v4(),
            kind,
            status: Arc::new(Mutex::new(TransferStatus::starting())),
            control,
        };
        (handle, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn snapshot(&self) -> TransferStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mutate the shared status in place.
    pub fn update(&self, f: impl FnOnce(&mut TransferStatus)) {
        let mut guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Send a control signal to the driving task. A transfer that already
    /// finished has dropped its receiver; that is not an error.
    pub fn signal(&self, signal: ControlSignal) {
        let _ = self.control.send(signal);
    }
}
