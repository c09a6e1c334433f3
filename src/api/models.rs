//! Wire types for the HTTP surface. Job records serialize directly; these
//! are the request/response envelopes around them.

use serde::{Deserialize, Serialize};

use crate::jobs::{JobId, JobKind};
use crate::observability::MetricsSnapshot;

/// Body of `POST /api/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub url: String,
    /// Optional explicit protocol family; inferred from the URL otherwise.
    #[serde(default)]
    pub kind: Option<JobKind>,
    /// Destination path relative to the storage root.
    pub destination: String,
    #[serde(default)]
    pub format_hint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: JobId,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub jobs: usize,
    pub subscribers: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub reloaded: bool,
    pub max_concurrent: usize,
    pub max_retries: u32,
}
