//! Admission loop: wakes on a fixed tick and fills free concurrency slots
//! with the oldest queued jobs.
//!
//! There is no separate queue structure; the job table is the queue. That
//! keeps restart recovery trivial and makes submission order the only
//! ordering rule.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::warn;

use super::Orchestrator;

pub(crate) async fn run(orch: Arc<Orchestrator>) {
    let tick_ms = orch.config.read().await.downloads.scheduler_tick_ms;
    let mut tick = time::interval(Duration::from_millis(tick_ms.max(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        let max_concurrent = orch.config.read().await.downloads.max_concurrent;
        while orch.table.slots_in_use().await < max_concurrent {
            let Some(id) = orch.table.next_queued().await else {
                break;
            };
            if let Err(e) = orch.dispatch(id).await {
                warn!(job_id = %id, error = %e, "dispatch failed");
                break;
            }
        }
    }
}
