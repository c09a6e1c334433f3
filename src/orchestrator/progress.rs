//! Per-job progress loop. One of these runs for every live transfer,
//! polling the backend on the configured interval until the job leaves
//! `Active`/`Paused` or the backend reports a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::backend::{TransferHandle, TransferState};
use crate::jobs::{JobId, JobState};

use super::Orchestrator;

pub(crate) async fn run(orch: Arc<Orchestrator>, id: JobId, handle: TransferHandle) {
    let interval_ms = orch.config.read().await.downloads.poll_interval_ms;
    let backend = match orch.backends.get(handle.kind()) {
        Ok(backend) => backend,
        Err(e) => {
            orch.fail_transfer(id, e.to_string(), true).await;
            return;
        }
    };

    let mut tick = time::interval(Duration::from_millis(interval_ms.max(10)));
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tick.tick().await;

        let Some(entry) = orch.table.entry(id).await else {
            return;
        };
        let state = entry.lock().await.state;
        if !matches!(state, JobState::Active | JobState::Paused) {
            return;
        }

        let status = match orch.bounded(backend.poll(&handle)).await {
            Ok(status) => status,
            Err(e) => {
                let fatal = e.is_fatal();
                orch.fail_transfer(id, e.to_string(), fatal).await;
                return;
            }
        };

        match status.state {
            TransferState::Running | TransferState::Paused => {
                orch.record_progress(id, &status).await;
            }
            TransferState::Completed => {
                orch.complete(id, &status).await;
                return;
            }
            TransferState::Cancelled => {
                orch.finish_cancelled(id).await;
                return;
            }
            TransferState::Failed { message, fatal } => {
                orch.fail_transfer(id, message, fatal).await;
                return;
            }
        }
    }
}
