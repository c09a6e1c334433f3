//! The in-memory job table.
//!
//! One `RwLock` guards the map itself; each job sits behind its own
//! `Mutex` so lifecycle operations on different jobs never contend. Locks
//! are held only for in-memory reads and writes, never across a backend
//! call.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::jobs::{Job, JobId, JobState};

#[derive(Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) {
        self.jobs
            .write()
            .await
            .insert(job.id, Arc::new(Mutex::new(job)));
    }

    pub async fn entry(&self, id: JobId) -> Option<Arc<Mutex<Job>>> {
        self.jobs.read().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: JobId) -> bool {
        self.jobs.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Clone every job, ordered by submission time (ties broken by id so
    /// the order is total).
    pub async fn snapshot(&self) -> Vec<Job> {
        let entries: Vec<_> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            jobs.push(entry.lock().await.clone());
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Jobs currently holding a transfer slot. A paused job keeps its
    /// slot, so resuming it can never exceed the admission limit.
    pub async fn slots_in_use(&self) -> usize {
        let entries: Vec<_> = self.jobs.read().await.values().cloned().collect();
        let mut count = 0;
        for entry in entries {
            if matches!(
                entry.lock().await.state,
                JobState::Active | JobState::Paused
            ) {
                count += 1;
            }
        }
        count
    }

    pub async fn count_in_state(&self, state: JobState) -> usize {
        let entries: Vec<_> = self.jobs.read().await.values().cloned().collect();
        let mut count = 0;
        for entry in entries {
            if entry.lock().await.state == state {
                count += 1;
            }
        }
        count
    }

    /// The oldest job still waiting for admission, if any.
    pub async fn next_queued(&self) -> Option<JobId> {
        let entries: Vec<_> = self.jobs.read().await.values().cloned().collect();
        let mut oldest: Option<(chrono::DateTime<chrono::Utc>, JobId)> = None;
        for entry in entries {
            let job = entry.lock().await;
            if job.state != JobState::Queued {
                continue;
            }
            let candidate = (job.created_at, job.id);
            if oldest.is_none_or(|best| candidate < best) {
                oldest = Some(candidate);
            }
        }
        oldest.map(|(_, id)| id)
    }
}
