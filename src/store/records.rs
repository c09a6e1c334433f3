use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info, warn};

use crate::jobs::{Job, JobId};

use super::error::Result;
use super::keys::{decode_job_key, encode_job_key, encode_meta_key};

const SCHEMA_VERSION: &str = "1";

/// Fjall-backed persistent storage for job records.
///
/// Writes go through `save` before the in-memory table is updated; a write
/// failure therefore leaves the durable state authoritative.
#[derive(Clone)]
pub struct JobStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    metadata: PartitionHandle,
}

impl JobStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening job store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let store = Self {
            keyspace,
            jobs,
            metadata,
        };
        store.metadata.insert(
            encode_meta_key("schema_version"),
            SCHEMA_VERSION.as_bytes(),
        )?;
        Ok(store)
    }

    /// Store or update a job record
    pub fn save(&self, job: &Job) -> Result<()> {
        let key = encode_job_key(&job.id);
        let value = serde_json::to_vec(job)?;
        self.jobs.insert(key, value)?;
        debug!(job_id = %job.id, state = %job.state, "saved job record");
        Ok(())
    }

    /// Get a job record by ID
    pub fn load(&self, id: &JobId) -> Result<Option<Job>> {
        let key = encode_job_key(id);
        match self.jobs.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Load every job record. Undecodable entries are skipped with a
    /// warning rather than aborting startup.
    pub fn load_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in self.jobs.iter() {
            let (key, value) = entry?;
            let Some(id) = decode_job_key(&key) else {
                warn!("skipping job record with malformed key");
                continue;
            };
            match serde_json::from_slice::<Job>(&value) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = %id, error = %e, "skipping undecodable job record"),
            }
        }
        Ok(jobs)
    }

    /// Remove a job record
    pub fn delete(&self, id: &JobId) -> Result<()> {
        self.jobs.remove(encode_job_key(id))?;
        Ok(())
    }

    pub fn job_count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.jobs.iter() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobKind, JobState};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn sample_job() -> Job {
        Job::new(
            Uuid::new_v4(),
            JobKind::DirectFile,
            "https://example.org/file.iso".into(),
            "/tmp/file.iso".into(),
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs")).unwrap();

        let job = sample_job();
        store.save(&job).unwrap();

        let loaded = store.load(&job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.state, JobState::Queued);
        assert_eq!(loaded.source_url, job.source_url);
        assert!(loaded.handle.is_none());
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs")).unwrap();
        assert!(store.load(&Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs")).unwrap();

        let mut job = sample_job();
        store.save(&job).unwrap();

        job.state = JobState::Active;
        job.bytes_done = 4096;
        store.save(&job).unwrap();

        let loaded = store.load(&job.id).unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Active);
        assert_eq!(loaded.bytes_done, 4096);
        assert_eq!(store.job_count().unwrap(), 1);
    }

    #[test]
    fn test_load_all_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs");

        let first = sample_job();
        let second = sample_job();
        {
            let store = JobStore::open(&path).unwrap();
            store.save(&first).unwrap();
            store.save(&second).unwrap();
            store.persist().unwrap();
        }

        let store = JobStore::open(&path).unwrap();
        let mut jobs = store.load_all().unwrap();
        jobs.sort_by_key(|j| j.id);
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_load_all_skips_broken_records() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs")).unwrap();

        let job = sample_job();
        store.save(&job).unwrap();
        store
            .jobs
            .insert(encode_job_key(&Uuid::new_v4()), b"{not json")
            .unwrap();

        let jobs = store.load_all().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("jobs")).unwrap();

        let job = sample_job();
        store.save(&job).unwrap();
        store.delete(&job.id).unwrap();
        assert!(store.load(&job.id).unwrap().is_none());
    }
}
