use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use dlhive::backend::{BackendError, BackendRegistry, MockBackend, TransferStatus};
use dlhive::config::Config;
use dlhive::events::EventBroadcaster;
use dlhive::jobs::{Job, JobKind, JobSpec, JobState};
use dlhive::observability::Metrics;
use dlhive::orchestrator::{Orchestrator, OrchestratorError};
use dlhive::store::JobStore;

struct Harness {
    orch: Arc<Orchestrator>,
    backend: Arc<MockBackend>,
    store: Arc<JobStore>,
    scheduler: Option<JoinHandle<()>>,
    _temp: TempDir,
}

impl Harness {
    fn spec(url: &str, dest: &str) -> JobSpec {
        JobSpec::builder().url(url).destination(dest).build()
    }

    async fn submit(&self, dest: &str) -> Uuid {
        self.orch
            .submit(Self::spec("https://example.org/file", dest))
            .await
            .expect("submit failed")
            .id
    }

    async fn wait_for_state(&self, id: Uuid, state: JobState) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let job = self.orch.get(id).await.expect("job vanished");
            if job.state == state {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} stuck in {} while waiting for {state}",
                job.state
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.abort();
        }
    }
}

fn fast_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.server.store_path = temp.path().join("jobs");
    config.downloads.storage_root = temp.path().join("downloads");
    config.downloads.scheduler_tick_ms = 10;
    config.downloads.poll_interval_ms = 10;
    config.downloads.poll_timeout_ms = 500;
    config.downloads.retry_backoff_ms = 20;
    config.downloads.retry_backoff_cap_ms = 200;
    config
}

fn build_harness(mutate: impl FnOnce(&mut Config), run_scheduler: bool) -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let mut config = fast_config(&temp);
    mutate(&mut config);

    let store = Arc::new(JobStore::open(&config.server.store_path).expect("open store"));
    let backend = Arc::new(MockBackend::new(JobKind::DirectFile));
    let mut registry = BackendRegistry::new();
    registry.register(backend.clone());

    let orch = Arc::new(Orchestrator::new(
        Arc::new(RwLock::new(config)),
        store.clone(),
        Arc::new(registry),
        EventBroadcaster::new(64),
        Arc::new(Metrics::new()),
    ));
    let scheduler = run_scheduler.then(|| orch.spawn_scheduler());

    Harness {
        orch,
        backend,
        store,
        scheduler,
        _temp: temp,
    }
}

fn running(done: u64) -> TransferStatus {
    TransferStatus::running(done, Some(1000), 100)
}

fn completing_script() -> Vec<TransferStatus> {
    vec![
        running(250),
        running(700),
        TransferStatus::completed(1000, Some(1000)),
    ]
}

fn endless_script() -> Vec<TransferStatus> {
    vec![running(10)]
}

#[tokio::test]
async fn test_submitted_job_runs_to_completion() {
    let harness = build_harness(|_| {}, true);
    harness.backend.push_script(completing_script());

    let id = harness.submit("iso/disk.img").await;
    let job = harness.wait_for_state(id, JobState::Completed).await;

    assert_eq!(job.bytes_done, 1000);
    assert_eq!(job.bytes_total, Some(1000));
    assert_eq!(job.rate_bps, 0);
    assert!(job.last_error.is_none());

    // The terminal state is durable.
    let persisted = harness.store.load(&id).unwrap().unwrap();
    assert_eq!(persisted.state, JobState::Completed);
    assert_eq!(persisted.bytes_done, 1000);
}

#[tokio::test]
async fn test_submit_rejects_unserviceable_url() {
    let harness = build_harness(|_| {}, false);
    let result = harness
        .orch
        .submit(Harness::spec("gopher://example.org/x", "x"))
        .await;
    assert!(matches!(result, Err(OrchestratorError::InvalidSpec(_))));
}

#[tokio::test]
async fn test_submit_rejects_destination_traversal() {
    let harness = build_harness(|_| {}, false);
    let result = harness
        .orch
        .submit(Harness::spec("https://example.org/x", "../outside"))
        .await;
    assert!(matches!(result, Err(OrchestratorError::InvalidSpec(_))));
}

#[tokio::test]
async fn test_concurrency_cap_and_fifo_admission() {
    let harness = build_harness(|c| c.downloads.max_concurrent = 2, true);
    for _ in 0..4 {
        harness.backend.push_script(endless_script());
    }

    let first = harness.submit("a").await;
    let second = harness.submit("b").await;
    let third = harness.submit("c").await;
    let fourth = harness.submit("d").await;

    harness.wait_for_state(first, JobState::Active).await;
    harness.wait_for_state(second, JobState::Active).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let jobs = harness.orch.list().await;
    let active: Vec<_> = jobs
        .iter()
        .filter(|j| j.state == JobState::Active)
        .map(|j| j.id)
        .collect();
    assert_eq!(active, vec![first, second], "admission is not FIFO");
    assert_eq!(harness.orch.get(third).await.unwrap().state, JobState::Queued);
    assert_eq!(harness.orch.get(fourth).await.unwrap().state, JobState::Queued);

    // Freeing a slot admits the oldest queued job.
    harness.orch.cancel(first).await.unwrap();
    harness.wait_for_state(third, JobState::Active).await;
    assert_eq!(
        harness.orch.get(fourth).await.unwrap().state,
        JobState::Queued
    );
}

#[tokio::test]
async fn test_transient_failure_retries_until_budget_exhausted() {
    let harness = build_harness(|c| c.downloads.max_retries = 2, true);
    for _ in 0..3 {
        harness
            .backend
            .push_script(vec![TransferStatus::failed("connection reset", false)]);
    }

    let id = harness.submit("flaky.bin").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let job = harness.orch.get(id).await.unwrap();
        if job.state == JobState::Failed && job.retry_count == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "retries never settled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Budget exhausted: no fourth attempt shows up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.backend.starts.load(Ordering::SeqCst), 3);
    let job = harness.orch.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("connection reset"));
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let harness = build_harness(|_| {}, true);
    harness
        .backend
        .push_script(vec![TransferStatus::failed("404 not found", true)]);

    let id = harness.submit("missing.bin").await;
    let job = harness.wait_for_state(id, JobState::Failed).await;
    assert_eq!(job.retry_count, 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.backend.starts.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.orch.get(id).await.unwrap().state,
        JobState::Failed
    );
}

#[tokio::test]
async fn test_failed_start_routes_through_retry_policy() {
    let harness = build_harness(|c| c.downloads.max_retries = 1, true);
    harness
        .backend
        .fail_next_start(BackendError::Transient("engine crashed".into()));
    harness.backend.push_script(completing_script());

    let id = harness.submit("restartable.bin").await;
    let job = harness.wait_for_state(id, JobState::Completed).await;
    assert_eq!(job.retry_count, 1);
    assert_eq!(harness.backend.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_pause_reaches_backend_exactly_once() {
    let harness = build_harness(|_| {}, true);
    harness.backend.push_script(endless_script());

    let id = harness.submit("big.iso").await;
    harness.wait_for_state(id, JobState::Active).await;

    harness.orch.pause(id).await.unwrap();
    assert_eq!(harness.orch.get(id).await.unwrap().state, JobState::Paused);

    // A second pause is rejected before it can reach the backend.
    let second = harness.orch.pause(id).await;
    assert!(matches!(
        second,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    assert_eq!(harness.backend.pauses.load(Ordering::SeqCst), 1);

    harness.orch.resume(id).await.unwrap();
    harness.wait_for_state(id, JobState::Active).await;
    assert_eq!(harness.backend.resumes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_paused_job_keeps_its_concurrency_slot() {
    let harness = build_harness(|c| c.downloads.max_concurrent = 1, true);
    harness.backend.push_script(endless_script());
    harness.backend.push_script(endless_script());

    let first = harness.submit("a").await;
    let second = harness.submit("b").await;
    harness.wait_for_state(first, JobState::Active).await;

    harness.orch.pause(first).await.unwrap();

    // The paused job still occupies the only slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.orch.get(second).await.unwrap().state,
        JobState::Queued
    );

    harness.orch.resume(first).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let active = harness
        .orch
        .list()
        .await
        .iter()
        .filter(|j| j.state == JobState::Active)
        .count();
    assert_eq!(active, 1, "resume exceeded the admission limit");

    harness.orch.cancel(first).await.unwrap();
    harness.wait_for_state(second, JobState::Active).await;
}

#[tokio::test]
async fn test_pause_requires_active_state() {
    let harness = build_harness(|c| c.downloads.max_concurrent = 1, true);
    harness.backend.push_script(endless_script());
    harness.backend.push_script(endless_script());

    let first = harness.submit("a").await;
    let second = harness.submit("b").await;
    harness.wait_for_state(first, JobState::Active).await;

    // Second job is still queued; pausing it is a transition error.
    let result = harness.orch.pause(second).await;
    assert!(matches!(
        result,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_cancel_queued_job_never_touches_backend() {
    let harness = build_harness(|c| c.downloads.max_concurrent = 1, true);
    harness.backend.push_script(endless_script());
    harness.backend.push_script(endless_script());

    let first = harness.submit("a").await;
    let second = harness.submit("b").await;
    harness.wait_for_state(first, JobState::Active).await;

    let job = harness.orch.cancel(second).await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(harness.backend.starts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.backend.cancels.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_active_job_confirms_with_backend() {
    let harness = build_harness(|_| {}, true);
    harness.backend.push_script(endless_script());

    let id = harness.submit("big.iso").await;
    harness.wait_for_state(id, JobState::Active).await;

    let job = harness.orch.cancel(id).await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(harness.backend.cancels.load(Ordering::SeqCst), 1);

    // Cancelled is terminal.
    let again = harness.orch.cancel(id).await;
    assert!(matches!(
        again,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    let resumed = harness.orch.resume(id).await;
    assert!(matches!(
        resumed,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_cancel_during_backend_start_stops_the_transfer() {
    let harness = build_harness(|_| {}, true);
    harness.backend.set_start_delay(Duration::from_millis(150));
    harness.backend.push_script(endless_script());

    let id = harness.submit("slow-start.bin").await;
    // Active is committed before the backend's start call returns.
    harness.wait_for_state(id, JobState::Active).await;

    let job = harness.orch.cancel(id).await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);

    // Once start completes, the orphaned transfer must be told to stop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.backend.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.orch.get(id).await.unwrap().state,
        JobState::Cancelled
    );
}

#[tokio::test]
async fn test_cancel_races_with_admission() {
    let harness = build_harness(|c| c.downloads.max_concurrent = 8, true);
    let mut ids = Vec::new();
    for i in 0..16 {
        harness.backend.push_script(endless_script());
        ids.push(harness.submit(&format!("f{i}")).await);
    }

    // Whichever side of admission each job lands on, cancel succeeds.
    for id in ids {
        let job = harness.orch.cancel(id).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let harness = build_harness(|_| {}, false);
    let id = Uuid::new_v4();
    assert!(matches!(
        harness.orch.get(id).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        harness.orch.cancel(id).await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_recovery_demotes_interrupted_active_jobs() {
    let harness = build_harness(|_| {}, false);

    let mut interrupted = Job::new(
        Uuid::new_v4(),
        JobKind::DirectFile,
        "https://example.org/a".into(),
        "/tmp/a".into(),
    );
    interrupted.state = JobState::Active;
    interrupted.bytes_done = 12345;
    let mut finished = Job::new(
        Uuid::new_v4(),
        JobKind::DirectFile,
        "https://example.org/b".into(),
        "/tmp/b".into(),
    );
    finished.state = JobState::Completed;
    let mut paused = Job::new(
        Uuid::new_v4(),
        JobKind::DirectFile,
        "https://example.org/c".into(),
        "/tmp/c".into(),
    );
    paused.state = JobState::Paused;
    harness.store.save(&interrupted).unwrap();
    harness.store.save(&finished).unwrap();
    harness.store.save(&paused).unwrap();

    let recovered = harness.orch.recover().await.unwrap();
    assert_eq!(recovered, 3);

    let job = harness.orch.get(interrupted.id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.bytes_done, 0);
    assert_eq!(
        harness.orch.get(finished.id).await.unwrap().state,
        JobState::Completed
    );
    assert_eq!(
        harness.orch.get(paused.id).await.unwrap().state,
        JobState::Paused
    );

    // The demotion itself is durable.
    let persisted = harness.store.load(&interrupted.id).unwrap().unwrap();
    assert_eq!(persisted.state, JobState::Queued);
}

#[tokio::test]
async fn test_resume_of_recovered_paused_job_starts_fresh_transfer() {
    let harness = build_harness(|_| {}, false);

    let mut paused = Job::new(
        Uuid::new_v4(),
        JobKind::DirectFile,
        "https://example.org/c".into(),
        "/tmp/c".into(),
    );
    paused.state = JobState::Paused;
    harness.store.save(&paused).unwrap();
    harness.orch.recover().await.unwrap();

    harness.backend.push_script(completing_script());
    harness.orch.resume(paused.id).await.unwrap();
    harness.wait_for_state(paused.id, JobState::Completed).await;
    assert_eq!(harness.backend.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_event_feed_covers_the_whole_lifecycle() {
    let harness = build_harness(|_| {}, true);
    harness.backend.push_script(completing_script());

    let mut stream = harness.orch.subscribe();
    let id = harness.submit("observed.bin").await;
    harness.wait_for_state(id, JobState::Completed).await;

    let mut states = Vec::new();
    let mut progress = Vec::new();
    while let Ok(event) =
        tokio::time::timeout(Duration::from_millis(100), stream.next()).await
    {
        let Some(event) = event else { break };
        assert_eq!(event.id, id);
        states.push(event.state);
        if event.state == JobState::Active {
            progress.push(event.bytes_done);
        }
        if event.state == JobState::Completed {
            break;
        }
    }

    assert_eq!(states.first(), Some(&JobState::Queued));
    assert_eq!(states.last(), Some(&JobState::Completed));
    assert!(states.contains(&JobState::Active));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress regressed");
}

#[tokio::test]
async fn test_progress_never_moves_backwards() {
    let harness = build_harness(|_| {}, true);
    harness.backend.push_script(vec![
        running(800),
        // A stale report from the backend.
        running(300),
        TransferStatus::completed(1000, Some(1000)),
    ]);

    let mut stream = harness.orch.subscribe();
    let id = harness.submit("wobbly.bin").await;
    harness.wait_for_state(id, JobState::Completed).await;

    let mut last = 0;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(100), stream.next()).await
    {
        assert!(event.bytes_done >= last, "bytes_done went backwards");
        last = event.bytes_done;
        if event.state == JobState::Completed {
            break;
        }
    }
    assert_eq!(last, 1000);
}
