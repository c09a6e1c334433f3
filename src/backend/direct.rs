//! Built-in backend for plain file downloads. HTTP(S) bodies (WebDAV
//! included) are streamed to disk in-process, honoring pause and cancel
//! at chunk boundaries; ftp/ftps/sftp URLs are handed to a configured
//! external engine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::config::DirectBackendConfig;
use crate::jobs::{Job, JobKind};

use super::command::CommandBackend;
use super::traits::{BackendError, TransferBackend};
use super::types::{ControlSignal, TransferHandle, TransferState, TransferStatus};

/// How often the transfer rate estimate is recomputed.
const RATE_WINDOW: Duration = Duration::from_millis(1000);

pub struct DirectBackend {
    client: reqwest::Client,
    engine: CommandBackend,
    engine_handles: Mutex<HashSet<Uuid>>,
}

impl DirectBackend {
    pub fn new(config: &DirectBackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| BackendError::Fatal(format!("http client init failed: {e}")))?;
        Ok(DirectBackend {
            client,
            engine: CommandBackend::new(JobKind::DirectFile, config.engine.clone()),
            engine_handles: Mutex::new(HashSet::new()),
        })
    }

    fn is_engine_handle(&self, handle: &TransferHandle) -> bool {
        self.engine_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&handle.id())
    }

    fn forget_engine_handle(&self, handle: &TransferHandle) {
        self.engine_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id());
    }
}

fn is_http(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[async_trait]
impl TransferBackend for DirectBackend {
    fn kind(&self) -> JobKind {
        JobKind::DirectFile
    }

    async fn start(&self, job: &Job) -> Result<TransferHandle, BackendError> {
        if !is_http(&job.source_url) {
            let handle = self.engine.start(job).await?;
            self.engine_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(handle.id());
            return Ok(handle);
        }
        if let Some(parent) = job.destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::Fatal(format!("destination not writable: {e}")))?;
        }
        let (handle, control) = TransferHandle::new(JobKind::DirectFile);
        tokio::spawn(run_transfer(
            self.client.clone(),
            job.source_url.clone(),
            job.destination.clone(),
            handle.clone(),
            control,
        ));
        Ok(handle)
    }

    async fn poll(&self, handle: &TransferHandle) -> Result<TransferStatus, BackendError> {
        let status = handle.snapshot();
        if !matches!(
            status.state,
            TransferState::Running | TransferState::Paused
        ) {
            self.forget_engine_handle(handle);
        }
        Ok(status)
    }

    async fn pause(&self, handle: &TransferHandle) -> Result<(), BackendError> {
        if self.is_engine_handle(handle) {
            return self.engine.pause(handle).await;
        }
        handle.signal(ControlSignal::Pause);
        Ok(())
    }

    async fn resume(&self, handle: &TransferHandle) -> Result<(), BackendError> {
        if self.is_engine_handle(handle) {
            return self.engine.resume(handle).await;
        }
        handle.signal(ControlSignal::Run);
        Ok(())
    }

    async fn cancel(&self, handle: &TransferHandle) -> Result<(), BackendError> {
        handle.signal(ControlSignal::Cancel);
        Ok(())
    }
}

#[derive(Debug, Error)]
enum TransferError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Client errors and disk errors cannot succeed on retry; everything
    /// network-shaped can.
    fn is_fatal(&self) -> bool {
        match self {
            TransferError::Http(e) => match e.status() {
                Some(status) => status.is_client_error(),
                None => !(e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode()),
            },
            TransferError::Io(_) => true,
            TransferError::Cancelled => false,
        }
    }
}

async fn run_transfer(
    client: reqwest::Client,
    url: String,
    dest: PathBuf,
    handle: TransferHandle,
    mut control: watch::Receiver<ControlSignal>,
) {
    match stream_to_file(&client, &url, &dest, &handle, &mut control).await {
        Ok(()) => {
            debug!(url = %url, dest = %dest.display(), "transfer finished");
            handle.update(|s| {
                if s.bytes_total.is_none() {
                    s.bytes_total = Some(s.bytes_done);
                }
                s.rate_bps = 0;
                s.state = TransferState::Completed;
            });
        }
        Err(TransferError::Cancelled) => {
            handle.update(|s| {
                s.rate_bps = 0;
                s.state = TransferState::Cancelled;
            });
        }
        Err(err) => {
            let fatal = err.is_fatal();
            handle.update(|s| {
                s.rate_bps = 0;
                s.state = TransferState::Failed {
                    message: err.to_string(),
                    fatal,
                };
            });
        }
    }
}

async fn stream_to_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    handle: &TransferHandle,
    control: &mut watch::Receiver<ControlSignal>,
) -> Result<(), TransferError> {
    wait_while_paused(handle, control).await?;

    let response = client.get(url).send().await?.error_for_status()?;
    if let Some(len) = response.content_length() {
        handle.update(|s| s.bytes_total = Some(len));
    }

    let mut file = fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut done: u64 = 0;
    let mut window_start = Instant::now();
    let mut window_bytes: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        done += chunk.len() as u64;
        window_bytes += chunk.len() as u64;

        let elapsed = window_start.elapsed();
        let rate = if elapsed >= RATE_WINDOW {
            let rate = (window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            window_start = Instant::now();
            window_bytes = 0;
            Some(rate)
        } else {
            None
        };
        handle.update(|s| {
            s.bytes_done = done;
            if let Some(rate) = rate {
                s.rate_bps = rate;
            }
        });

        wait_while_paused(handle, control).await?;
    }

    file.flush().await?;
    Ok(())
}

/// Block while the control channel says `Pause`; bail out on `Cancel`.
async fn wait_while_paused(
    handle: &TransferHandle,
    control: &mut watch::Receiver<ControlSignal>,
) -> Result<(), TransferError> {
    loop {
        let signal = *control.borrow();
        match signal {
            ControlSignal::Cancel => return Err(TransferError::Cancelled),
            ControlSignal::Run => {
                handle.update(|s| {
                    if s.state == TransferState::Paused {
                        s.state = TransferState::Running;
                    }
                });
                return Ok(());
            }
            ControlSignal::Pause => {
                handle.update(|s| {
                    s.state = TransferState::Paused;
                    s.rate_bps = 0;
                });
                if control.changed().await.is_err() {
                    return Err(TransferError::Cancelled);
                }
            }
        }
    }
}
