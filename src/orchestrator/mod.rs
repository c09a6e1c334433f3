//! The download orchestrator: owns the job table, admits queued jobs up
//! to the concurrency limit, drives progress polling, applies the retry
//! policy and publishes every observable change.
//!
//! Write-through discipline: every state change is saved to the store
//! first, then committed to the in-memory table, then broadcast. A failed
//! save leaves memory untouched, so the durable state is always the
//! authoritative one.

mod progress;
mod retry;
mod scheduler;
mod table;

pub use retry::backoff_delay;
pub use table::JobTable;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, BackendRegistry, TransferState, TransferStatus};
use crate::config::Config;
use crate::events::{EventBroadcaster, EventStream, JobEvent};
use crate::humanize::format_size;
use crate::jobs::{Job, JobId, JobKind, JobSpec, JobState};
use crate::observability::Metrics;
use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("no such job: {0}")]
    NotFound(JobId),

    #[error("job {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("persistence failed: {0}")]
    StoreWrite(#[from] StoreError),
}

pub struct Orchestrator {
    config: Arc<RwLock<Config>>,
    table: JobTable,
    store: Arc<JobStore>,
    backends: Arc<BackendRegistry>,
    events: EventBroadcaster,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<RwLock<Config>>,
        store: Arc<JobStore>,
        backends: Arc<BackendRegistry>,
        events: EventBroadcaster,
        metrics: Arc<Metrics>,
    ) -> Self {
        Orchestrator {
            config,
            table: JobTable::new(),
            store,
            backends,
            events,
            metrics,
        }
    }

    /// Reload persisted jobs into the table. Jobs that were `Active` when
    /// the process died have no live transfer anymore and are demoted to
    /// `Queued` so the scheduler picks them up again.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let mut jobs = self.store.load_all()?;
        let count = jobs.len();
        let mut demoted = 0;
        for job in &mut jobs {
            if job.state == JobState::Active {
                job.state = JobState::Queued;
                job.reset_for_retry();
                job.updated_at = Utc::now();
                self.store.save(job)?;
                demoted += 1;
            }
            self.table.insert(job.clone()).await;
        }
        info!(jobs = count, demoted, "recovered persisted jobs");
        Ok(count)
    }

    /// Start the admission loop. Runs until the process exits.
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(scheduler::run(Arc::clone(self)))
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Validate and register a new job. The job starts `Queued`; the
    /// scheduler admits it when a concurrency slot frees up.
    pub async fn submit(&self, spec: JobSpec) -> Result<Job, OrchestratorError> {
        let url = spec.url.trim();
        if url.is_empty() {
            return Err(OrchestratorError::InvalidSpec("url is empty".into()));
        }
        let kind = match spec.kind {
            Some(kind) => kind,
            None => JobKind::infer(url).ok_or_else(|| {
                OrchestratorError::InvalidSpec(format!("no backend can service `{url}`"))
            })?,
        };
        self.backends
            .get(kind)
            .map_err(|_| OrchestratorError::InvalidSpec(format!("no backend for kind `{kind}`")))?;
        let destination = self.resolve_destination(&spec.destination).await?;

        let mut job = Job::new(Uuid::new_v4(), kind, url.to_string(), destination);
        job.format_hint = spec.format_hint;

        self.store.save(&job)?;
        self.table.insert(job.clone()).await;
        self.metrics.job_submitted();
        self.events.publish(JobEvent::from_job(&job));
        info!(job_id = %job.id, kind = %kind, url, "job submitted");
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Result<Job, OrchestratorError> {
        let entry = self
            .table
            .entry(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;
        let job = entry.lock().await.clone();
        Ok(job)
    }

    /// Every known job, ordered by submission time.
    pub async fn list(&self) -> Vec<Job> {
        self.table.snapshot().await
    }

    /// Pause an active job. The state flips first; only then is the
    /// backend told, so two racing pauses reach the backend at most once
    /// (the loser fails the transition check).
    pub async fn pause(&self, id: JobId) -> Result<Job, OrchestratorError> {
        let entry = self
            .table
            .entry(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;
        let job = self
            .apply(&entry, JobState::Paused, |j| j.rate_bps = 0)
            .await?;

        if let Some(handle) = job.handle.clone() {
            let backend = self
                .backends
                .get(job.kind)
                .map_err(|e| OrchestratorError::Unsupported(e.to_string()))?;
            match self.bounded(backend.pause(&handle)).await {
                Ok(()) => {}
                Err(BackendError::Unsupported(msg)) => {
                    // Roll the state back; the transfer never stopped.
                    let _ = self.apply(&entry, JobState::Active, |_| {}).await;
                    return Err(OrchestratorError::Unsupported(msg.into()));
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "backend pause failed; job stays paused");
                }
            }
        }
        info!(job_id = %id, "job paused");
        Ok(job)
    }

    /// Resume a paused job. When no live transfer exists (the job was
    /// recovered from a restart) a fresh one is started.
    pub async fn resume(self: &Arc<Self>, id: JobId) -> Result<Job, OrchestratorError> {
        let entry = self
            .table
            .entry(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;
        let job = self.apply(&entry, JobState::Active, |_| {}).await?;

        match job.handle.clone() {
            Some(handle) => {
                let backend = self
                    .backends
                    .get(job.kind)
                    .map_err(|e| OrchestratorError::Unsupported(e.to_string()))?;
                match self.bounded(backend.resume(&handle)).await {
                    Ok(()) => {}
                    Err(BackendError::Unsupported(msg)) => {
                        let _ = self.apply(&entry, JobState::Paused, |_| {}).await;
                        return Err(OrchestratorError::Unsupported(msg.into()));
                    }
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "backend resume failed");
                    }
                }
            }
            None => self.start_transfer(&entry, &job).await,
        }
        info!(job_id = %id, "job resumed");
        Ok(job)
    }

    /// Cancel a job. A queued job flips straight to `Cancelled`; a running
    /// one gets a cooperative cancel with a bounded wait for confirmation,
    /// after which the state is forced (with a logged inconsistency if the
    /// backend never confirmed). Cancelling twice is a no-op.
    pub async fn cancel(self: &Arc<Self>, id: JobId) -> Result<Job, OrchestratorError> {
        let entry = self
            .table
            .entry(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;

        let mut retried = false;
        let (kind, handle, already_requested) = loop {
            let (state, kind, handle, already_requested) = {
                let guard = entry.lock().await;
                (
                    guard.state,
                    guard.kind,
                    guard.handle.clone(),
                    guard.cancel_requested,
                )
            };

            match state {
                JobState::Queued => {
                    match self
                        .apply(&entry, JobState::Cancelled, |j| j.handle = None)
                        .await
                    {
                        Ok(job) => {
                            self.metrics.job_cancelled();
                            info!(job_id = %id, "queued job cancelled");
                            return Ok(job);
                        }
                        // The scheduler admitted the job between the read
                        // and the transition; re-read once and take the
                        // live-cancel path instead.
                        Err(OrchestratorError::InvalidTransition { .. }) if !retried => {
                            retried = true;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                JobState::Active | JobState::Paused => break (kind, handle, already_requested),
                from => {
                    return Err(OrchestratorError::InvalidTransition {
                        id,
                        from,
                        to: JobState::Cancelled,
                    });
                }
            }
        };

        if already_requested {
            return self.get(id).await;
        }
        entry.lock().await.cancel_requested = true;

        if let Some(handle) = handle {
            if let Ok(backend) = self.backends.get(kind) {
                if let Err(e) = self.bounded(backend.cancel(&handle)).await {
                    warn!(job_id = %id, error = %e, "backend cancel call failed");
                } else if !self.await_cancel_confirmation(&*backend, &handle).await {
                    warn!(job_id = %id, "backend did not confirm cancellation in time; forcing state");
                }
            }
        }

        // The progress loop may have beaten us to the transition.
        let current = entry.lock().await.state;
        if matches!(current, JobState::Active | JobState::Paused) {
            let job = self
                .apply(&entry, JobState::Cancelled, |j| {
                    j.handle = None;
                    j.rate_bps = 0;
                })
                .await?;
            self.metrics.job_cancelled();
            info!(job_id = %id, "job cancelled");
            return Ok(job);
        }
        self.get(id).await
    }

    /// Swap the full configuration. Takes effect on the next scheduler
    /// tick / poll cycle; running transfers are not disturbed.
    pub async fn reload_config(&self, config: Config) {
        *self.config.write().await = config;
        info!("configuration reloaded");
    }

    // ---- internal ----

    /// Validate a transition, persist it, commit it to memory, broadcast
    /// it. Exactly in that order.
    async fn apply(
        &self,
        entry: &Arc<Mutex<Job>>,
        to: JobState,
        mutate: impl FnOnce(&mut Job),
    ) -> Result<Job, OrchestratorError> {
        let mut guard = entry.lock().await;
        if !guard.state.can_transition(to) {
            return Err(OrchestratorError::InvalidTransition {
                id: guard.id,
                from: guard.state,
                to,
            });
        }
        let mut next = guard.clone();
        next.state = to;
        mutate(&mut next);
        next.updated_at = Utc::now();
        self.store.save(&next)?;
        *guard = next.clone();
        drop(guard);
        self.events.publish(JobEvent::from_job(&next));
        Ok(next)
    }

    /// Admit one queued job: flip it `Active` and hand it to its backend.
    pub(crate) async fn dispatch(self: &Arc<Self>, id: JobId) -> Result<(), OrchestratorError> {
        let entry = self
            .table
            .entry(id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;
        let job = self.apply(&entry, JobState::Active, |_| {}).await?;
        self.start_transfer(&entry, &job).await;
        Ok(())
    }

    /// Begin the actual transfer for a job already committed as `Active`
    /// and spawn its progress loop. Start failures route through the
    /// normal failure path.
    async fn start_transfer(self: &Arc<Self>, entry: &Arc<Mutex<Job>>, job: &Job) {
        let backend = match self.backends.get(job.kind) {
            Ok(backend) => backend,
            Err(e) => {
                self.fail_transfer(job.id, e.to_string(), true).await;
                return;
            }
        };
        match self.bounded(backend.start(job)).await {
            Ok(handle) => {
                {
                    let mut guard = entry.lock().await;
                    // A cancel may have landed while start was in flight;
                    // it saw no handle, so the transfer must be stopped here.
                    if guard.state != JobState::Active || guard.cancel_requested {
                        drop(guard);
                        if let Err(e) = backend.cancel(&handle).await {
                            warn!(job_id = %job.id, error = %e, "could not stop freshly started transfer");
                        }
                        return;
                    }
                    guard.handle = Some(handle.clone());
                }
                tokio::spawn(progress::run(Arc::clone(self), job.id, handle));
                info!(job_id = %job.id, kind = %job.kind, "transfer started");
            }
            Err(e) => {
                self.fail_transfer(job.id, e.to_string(), e.is_fatal()).await;
            }
        }
    }

    /// Record a non-terminal progress report. Skipped entirely when
    /// nothing changed, so an idle transfer does not churn the store or
    /// the event feed.
    pub(crate) async fn record_progress(&self, id: JobId, status: &TransferStatus) {
        let Some(entry) = self.table.entry(id).await else {
            return;
        };
        let mut guard = entry.lock().await;
        if !matches!(guard.state, JobState::Active | JobState::Paused) {
            return;
        }
        let mut next = guard.clone();
        next.apply_progress(status);
        if next.bytes_done == guard.bytes_done
            && next.bytes_total == guard.bytes_total
            && next.rate_bps == guard.rate_bps
        {
            return;
        }
        next.updated_at = Utc::now();
        if let Err(e) = self.store.save(&next) {
            warn!(job_id = %id, error = %e, "could not persist progress; keeping previous record");
            return;
        }
        *guard = next.clone();
        drop(guard);
        self.events.publish(JobEvent::from_job(&next));
    }

    /// Terminal success.
    pub(crate) async fn complete(&self, id: JobId, status: &TransferStatus) {
        let Some(entry) = self.table.entry(id).await else {
            return;
        };
        let result = self
            .apply(&entry, JobState::Completed, |j| {
                j.apply_progress(status);
                match j.bytes_total {
                    Some(total) => j.bytes_done = j.bytes_done.max(total),
                    None => j.bytes_total = Some(j.bytes_done),
                }
                j.rate_bps = 0;
                j.last_error = None;
                j.handle = None;
            })
            .await;
        match result {
            Ok(job) => {
                self.metrics.job_completed();
                info!(job_id = %id, size = %format_size(job.bytes_done), "download completed");
            }
            Err(e) => warn!(job_id = %id, error = %e, "could not record completion"),
        }
    }

    /// Terminal (for this attempt) failure. Transient failures within the
    /// retry budget are re-enqueued after a backoff delay.
    pub(crate) async fn fail_transfer(self: &Arc<Self>, id: JobId, message: String, fatal: bool) {
        let Some(entry) = self.table.entry(id).await else {
            return;
        };
        let failed = match self
            .apply(&entry, JobState::Failed, |j| {
                j.last_error = Some(message.clone());
                j.rate_bps = 0;
                j.handle = None;
            })
            .await
        {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %id, error = %e, "could not record failure");
                return;
            }
        };
        self.metrics.job_failed();
        warn!(job_id = %id, fatal, error = %message, "transfer failed");
        if fatal {
            return;
        }

        let (max_retries, base_ms, cap_ms) = {
            let config = self.config.read().await;
            (
                config.downloads.max_retries,
                config.downloads.retry_backoff_ms,
                config.downloads.retry_backoff_cap_ms,
            )
        };
        if failed.retry_count >= max_retries {
            info!(job_id = %id, retries = failed.retry_count, "retry budget exhausted");
            return;
        }

        let delay = retry::backoff_delay(base_ms, cap_ms, failed.retry_count);
        self.metrics.retry_scheduled();
        info!(
            job_id = %id,
            attempt = failed.retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        let orch = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(entry) = orch.table.entry(id).await else {
                return;
            };
            let result = orch
                .apply(&entry, JobState::Queued, |j| {
                    j.retry_count += 1;
                    j.reset_for_retry();
                })
                .await;
            match result {
                Ok(_) | Err(OrchestratorError::InvalidTransition { .. }) => {}
                Err(e) => warn!(job_id = %id, error = %e, "could not re-enqueue for retry"),
            }
        });
    }

    /// The backend reported a cancel on its own (or confirmed one the
    /// cancel path is still waiting on).
    pub(crate) async fn finish_cancelled(&self, id: JobId) {
        let Some(entry) = self.table.entry(id).await else {
            return;
        };
        let result = self
            .apply(&entry, JobState::Cancelled, |j| {
                j.rate_bps = 0;
                j.handle = None;
            })
            .await;
        match result {
            Ok(_) => self.metrics.job_cancelled(),
            // Someone else already moved it; that is the expected race.
            Err(OrchestratorError::InvalidTransition { .. }) => {}
            Err(e) => warn!(job_id = %id, error = %e, "could not record cancellation"),
        }
    }

    /// Bound any backend call by the configured timeout; exceeding it is a
    /// transient failure.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        let timeout_ms = self.config.read().await.downloads.poll_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms.max(1)), fut).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Transient(format!(
                "backend call exceeded {timeout_ms}ms"
            ))),
        }
    }

    async fn await_cancel_confirmation(
        &self,
        backend: &dyn crate::backend::TransferBackend,
        handle: &crate::backend::TransferHandle,
    ) -> bool {
        let timeout_ms = self.config.read().await.downloads.poll_timeout_ms;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms.max(1));
        while tokio::time::Instant::now() < deadline {
            match backend.poll(handle).await {
                Ok(status) if status.state == TransferState::Cancelled => return true,
                Ok(_) => tokio::time::sleep(Duration::from_millis(25)).await,
                Err(_) => return false,
            }
        }
        false
    }

    async fn resolve_destination(&self, destination: &str) -> Result<PathBuf, OrchestratorError> {
        let rel = Path::new(destination.trim());
        if rel.as_os_str().is_empty() {
            return Err(OrchestratorError::InvalidSpec("destination is empty".into()));
        }
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(OrchestratorError::InvalidSpec(
                "destination must be a relative path without `..`".into(),
            ));
        }
        let root = self.config.read().await.downloads.storage_root.clone();
        Ok(root.join(rel))
    }
}
