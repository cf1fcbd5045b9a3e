//! Background consolidation worker.
//!
//! Wakes when an append signals the store's `Notify` or when the poll
//! interval elapses, drains the queue in batches, and exits on shutdown.

use crate::supervisor::Supervisor;
use mnemo_memory::consolidation::ConsolidationPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub fn spawn_consolidation_worker(
    pipeline: Arc<ConsolidationPipeline>,
    wake: Arc<Notify>,
    supervisor: Arc<Supervisor>,
) -> JoinHandle<()> {
    let mut shutdown = supervisor.subscribe();
    let poll = Duration::from_millis(pipeline.config().poll_interval_ms.max(1));
    let batch = pipeline.config().batch_size.max(1);

    info!(
        poll_ms = poll.as_millis() as u64,
        batch,
        "Starting consolidation worker"
    );

    tokio::spawn(async move {
        loop {
            drain(&pipeline, &supervisor, batch, &shutdown).await;

            tokio::select! {
                _ = wake.notified() => {
                    debug!("Consolidation worker woken by append");
                }
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {
                    info!("Consolidation worker: shutdown signal received");
                    break;
                }
            }
        }
    })
}

/// Run batches until the queue is empty, a batch errors, or shutdown begins.
async fn drain(
    pipeline: &ConsolidationPipeline,
    supervisor: &Supervisor,
    batch: usize,
    shutdown: &watch::Receiver<bool>,
) {
    loop {
        let stopping = *shutdown.borrow();
        if stopping {
            return;
        }
        match pipeline.run_once(batch).await {
            Ok(report) => {
                let touched = report.processed + report.failed;
                if touched == 0 {
                    return;
                }
                supervisor.record_batch(&report);
                if touched < batch as u64 {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Consolidation batch failed");
                supervisor.record_batch_error();
                return;
            }
        }
    }
}
