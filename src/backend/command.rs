//! Backend that delegates a transfer to an external engine process
//! (yt-dlp for streaming media, aria2c for torrents) and scrapes progress
//! from its stdout.
//!
//! Pause and resume are implemented with SIGSTOP/SIGCONT on unix and
//! reported as unsupported elsewhere.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::humanize::parse_size;
use crate::jobs::{Job, JobKind};

use super::traits::{BackendError, TransferBackend};
use super::types::{ControlSignal, TransferHandle, TransferState, TransferStatus};

pub struct CommandBackend {
    kind: JobKind,
    config: EngineConfig,
}

impl CommandBackend {
    pub fn new(kind: JobKind, config: EngineConfig) -> Self {
        CommandBackend { kind, config }
    }

    fn build_args(&self, job: &Job) -> Vec<String> {
        let dest = job.destination.to_string_lossy().into_owned();
        let dest_dir = job
            .destination
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        let dest_name = job
            .destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dest.clone());
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| {
                a.replace("{url}", &job.source_url)
                    .replace("{dest_dir}", &dest_dir)
                    .replace("{dest_name}", &dest_name)
                    .replace("{dest}", &dest)
            })
            .collect();
        if let Some(hint) = &job.format_hint {
            args.extend(
                self.config
                    .format_args
                    .iter()
                    .map(|a| a.replace("{format}", hint)),
            );
        }
        args
    }
}

#[async_trait]
impl TransferBackend for CommandBackend {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn start(&self, job: &Job) -> Result<TransferHandle, BackendError> {
        // Torrent engines treat the destination as a directory.
        let dir = if self.kind == JobKind::Torrent {
            Some(job.destination.as_path())
        } else {
            job.destination.parent()
        };
        if let Some(dir) = dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| BackendError::Fatal(format!("destination not writable: {e}")))?;
        }

        let args = self.build_args(job);
        debug!(engine = %self.config.command, ?args, "spawning transfer engine");
        let child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    BackendError::Fatal(format!("engine `{}` is not installed", self.config.command))
                }
                _ => BackendError::Transient(format!(
                    "failed to spawn `{}`: {e}",
                    self.config.command
                )),
            })?;

        let (handle, control) = TransferHandle::new(self.kind);
        tokio::spawn(supervise(
            child,
            handle.clone(),
            control,
            self.config.command.clone(),
        ));
        Ok(handle)
    }

    async fn poll(&self, handle: &TransferHandle) -> Result<TransferStatus, BackendError> {
        Ok(handle.snapshot())
    }

    async fn pause(&self, handle: &TransferHandle) -> Result<(), BackendError> {
        if !cfg!(unix) {
            return Err(BackendError::Unsupported(
                "pausing an external engine requires unix signals",
            ));
        }
        handle.signal(ControlSignal::Pause);
        Ok(())
    }

    async fn resume(&self, handle: &TransferHandle) -> Result<(), BackendError> {
        if !cfg!(unix) {
            return Err(BackendError::Unsupported(
                "resuming an external engine requires unix signals",
            ));
        }
        handle.signal(ControlSignal::Run);
        Ok(())
    }

    async fn cancel(&self, handle: &TransferHandle) -> Result<(), BackendError> {
        handle.signal(ControlSignal::Cancel);
        Ok(())
    }
}

/// Drive one engine process: scrape progress lines, relay control signals,
/// and post the terminal state when it exits.
async fn supervise(
    mut child: Child,
    handle: TransferHandle,
    mut control: watch::Receiver<ControlSignal>,
    engine: String,
) {
    let pid = child.id();
    let err_tail: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));

    if let Some(stderr) = child.stderr.take() {
        let tail = err_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    *tail.lock().unwrap_or_else(PoisonError::into_inner) = line;
                }
            }
        });
    }

    let mut cancelled = false;
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => apply_progress_line(&handle, &line),
                    _ => break,
                },
                changed = control.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let signal = *control.borrow();
                    match signal {
                        ControlSignal::Cancel => {
                            cancelled = true;
                            let _ = child.start_kill();
                        }
                        ControlSignal::Pause => {
                            if stop_process(pid) {
                                handle.update(|s| {
                                    s.state = TransferState::Paused;
                                    s.rate_bps = 0;
                                });
                            } else {
                                warn!(engine = %engine, "could not SIGSTOP engine process");
                            }
                        }
                        ControlSignal::Run => {
                            if continue_process(pid) {
                                handle.update(|s| {
                                    if s.state == TransferState::Paused {
                                        s.state = TransferState::Running;
                                    }
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    // stdout closed; pick up the exit status. A cancel racing this wait
    // still lands because kill_on_drop reaps stragglers.
    let status = child.wait().await;
    let tail = err_tail
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    handle.update(|s| {
        s.rate_bps = 0;
        s.state = match &status {
            _ if cancelled => TransferState::Cancelled,
            Ok(st) if st.success() => {
                if let Some(total) = s.bytes_total {
                    s.bytes_done = total;
                } else {
                    s.bytes_total = Some(s.bytes_done);
                }
                TransferState::Completed
            }
            Ok(st) => TransferState::Failed {
                message: if tail.is_empty() {
                    format!("{engine} exited with {st}")
                } else {
                    format!("{engine} exited with {st}: {tail}")
                },
                fatal: false,
            },
            Err(e) => TransferState::Failed {
                message: format!("failed to reap {engine}: {e}"),
                fatal: false,
            },
        };
    });
}

/// Fold one stdout line into the shared status. Understands the common
/// shapes emitted by yt-dlp (`36.5% of 12.34MiB at 1.23MiB/s`) and aria2c
/// (`[#a1b2c3 12MiB/34MiB(35%) DL:2.1MiB]`).
fn apply_progress_line(handle: &TransferHandle, line: &str) {
    let Some(progress) = parse_progress(line) else {
        return;
    };
    handle.update(|s| {
        if let Some(done) = progress.bytes_done {
            s.bytes_done = s.bytes_done.max(done);
        }
        if progress.bytes_total.is_some() {
            s.bytes_total = progress.bytes_total;
        }
        if let Some(rate) = progress.rate_bps {
            s.rate_bps = rate;
        }
    });
}

#[derive(Debug, Default, PartialEq, Eq)]
struct EngineProgress {
    bytes_done: Option<u64>,
    bytes_total: Option<u64>,
    rate_bps: Option<u64>,
}

fn parse_progress(line: &str) -> Option<EngineProgress> {
    let mut progress = EngineProgress::default();
    let mut percent: Option<f64> = None;
    let mut prev: Option<&str> = None;

    for raw in line.split_whitespace() {
        let token = raw.trim_matches(|c| matches!(c, '[' | ']' | ',' | '~'));

        if let Some(rate) = token.strip_suffix("/s").and_then(parse_size) {
            progress.rate_bps = Some(rate);
        } else if let Some(rate) = token.strip_prefix("DL:").and_then(parse_size) {
            progress.rate_bps = Some(rate);
        } else if let Some((done_s, rest)) = token.split_once('/') {
            let total_s = rest.split('(').next().unwrap_or(rest);
            if let (Some(done), Some(total)) = (parse_size(done_s), parse_size(total_s)) {
                progress.bytes_done = Some(done);
                progress.bytes_total = Some(total);
            }
        } else if let Some(pct) = token
            .strip_suffix('%')
            .and_then(|p| p.parse::<f64>().ok())
        {
            percent = Some(pct);
        } else if prev == Some("of") {
            if let Some(total) = parse_size(token) {
                progress.bytes_total = Some(total);
            }
        }
        prev = Some(token);
    }

    if progress.bytes_done.is_none() {
        if let (Some(pct), Some(total)) = (percent, progress.bytes_total) {
            progress.bytes_done = Some(((total as f64) * pct / 100.0) as u64);
        }
    }

    if progress == EngineProgress::default() {
        None
    } else {
        Some(progress)
    }
}

#[cfg(unix)]
fn stop_process(pid: Option<u32>) -> bool {
    send_signal(pid, libc::SIGSTOP)
}

#[cfg(unix)]
fn continue_process(pid: Option<u32>) -> bool {
    send_signal(pid, libc::SIGCONT)
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, signal: i32) -> bool {
    match pid {
        Some(pid) => unsafe { libc::kill(pid as i32, signal) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn stop_process(_pid: Option<u32>) -> bool {
    false
}

#[cfg(not(unix))]
fn continue_process(_pid: Option<u32>) -> bool {
    false
}
