//! Download job model: identifiers, kinds, lifecycle states and the
//! persisted job record itself.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{TransferHandle, TransferStatus};

pub type JobId = Uuid;

/// Protocol family a job belongs to. Determines which transfer backend
/// services the job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DirectFile,
    StreamingMedia,
    Torrent,
}

/// Hosts whose URLs are serviced by the media engine rather than a plain
/// HTTP fetch.
const MEDIA_HOSTS: &[&str] = &[
    "youtube.com/",
    "youtu.be/",
    "vimeo.com/",
    "twitch.tv/",
    "soundcloud.com/",
    "dailymotion.com/",
];

impl JobKind {
    /// Infer the kind from the URL when the submitter did not specify one.
    /// Returns `None` for URLs no backend can service.
    pub fn infer(url: &str) -> Option<JobKind> {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("magnet:") || lower.ends_with(".torrent") {
            return Some(JobKind::Torrent);
        }
        if lower.starts_with("http://") || lower.starts_with("https://") {
            if MEDIA_HOSTS.iter().any(|host| lower.contains(host)) {
                return Some(JobKind::StreamingMedia);
            }
            return Some(JobKind::DirectFile);
        }
        // Other file-transfer schemes belong to the direct family too;
        // WebDAV resources arrive as plain http(s) URLs above.
        if ["ftp://", "ftps://", "sftp://"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
        {
            return Some(JobKind::DirectFile);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DirectFile => "direct_file",
            JobKind::StreamingMedia => "streaming_media",
            JobKind::Torrent => "torrent",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job. All transitions go through
/// [`JobState::can_transition`]; anything else is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn can_transition(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Active)
                | (Queued, Cancelled)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Cancelled)
                | (Paused, Active)
                | (Paused, Completed)
                | (Paused, Failed)
                | (Paused, Cancelled)
                | (Failed, Queued)
        )
    }

    /// Terminal states never leave via user action. `Failed` is excluded
    /// because the retry policy may re-enqueue it.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a submitter asks for. The orchestrator resolves this into a [`Job`].
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
#[builder(on(String, into))]
pub struct JobSpec {
    pub url: String,
    /// Explicit protocol family; inferred from the URL when absent.
    #[serde(default)]
    pub kind: Option<JobKind>,
    /// Destination path relative to the configured storage root.
    pub destination: String,
    /// Engine-specific format selector (e.g. a yt-dlp format string).
    #[serde(default)]
    pub format_hint: Option<String>,
}

/// A single download job. This is the unit of persistence and the unit of
/// locking inside the orchestrator's job table.
///
/// Unknown fields are ignored on deserialize so records written by newer
/// builds still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_url: String,
    pub kind: JobKind,
    /// Absolute destination path, already resolved under the storage root.
    pub destination: PathBuf,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub bytes_done: u64,
    #[serde(default)]
    pub bytes_total: Option<u64>,
    #[serde(default)]
    pub rate_bps: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub format_hint: Option<String>,
    /// Live backend handle. Only present while the transfer is running;
    /// never persisted.
    #[serde(skip)]
    pub handle: Option<TransferHandle>,
    /// Set when a cancel has been issued but the backend has not yet
    /// confirmed. Keeps a second cancel from reaching the backend.
    #[serde(skip)]
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(id: JobId, kind: JobKind, source_url: String, destination: PathBuf) -> Self {
        let now = Utc::now();
        Job {
            id,
            source_url,
            kind,
            destination,
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
            bytes_done: 0,
            bytes_total: None,
            rate_bps: 0,
            retry_count: 0,
            last_error: None,
            format_hint: None,
            handle: None,
            cancel_requested: false,
        }
    }

    /// Fold a backend status report into the job. `bytes_done` never moves
    /// backwards within a single transfer attempt.
    pub fn apply_progress(&mut self, status: &TransferStatus) {
        self.bytes_done = self.bytes_done.max(status.bytes_done);
        if status.bytes_total.is_some() {
            self.bytes_total = status.bytes_total;
        }
        self.rate_bps = status.rate_bps;
    }

    /// Reset per-attempt counters before the job re-enters the queue.
    pub fn reset_for_retry(&mut self) {
        self.bytes_done = 0;
        self.bytes_total = None;
        self.rate_bps = 0;
        self.handle = None;
        self.cancel_requested = false;
    }
}
