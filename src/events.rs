//! Job event fan-out.
//!
//! A single broadcast channel carries every state transition and progress
//! update. Each subscriber gets an independent bounded buffer; a slow
//! subscriber loses its oldest buffered events, never the newest, and the
//! publisher never blocks on anyone.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::jobs::{Job, JobId, JobState};

/// One observable moment in a job's life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: JobId,
    pub state: JobState,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub rate_bps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    pub fn from_job(job: &Job) -> Self {
        JobEvent {
            id: job.id,
            state: job.state,
            bytes_done: job.bytes_done,
            bytes_total: job.bytes_total,
            rate_bps: job.rate_bps,
            error: job.last_error.clone(),
        }
    }
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBroadcaster {
    pub fn new(buffer_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer_capacity.max(1));
        EventBroadcaster { tx }
    }

    /// Publish to all current subscribers. Nobody listening is fine.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A subscriber's view of the event feed.
pub struct EventStream {
    rx: broadcast::Receiver<JobEvent>,
    dropped: u64,
}

impl EventStream {
    /// Next event, or `None` once the broadcaster is gone. Overruns are
    /// absorbed: the stream skips to the oldest event still buffered and
    /// records how many were lost.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped += missed;
                    warn!(missed, "event subscriber lagged, dropping oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events lost to buffer overruns so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
