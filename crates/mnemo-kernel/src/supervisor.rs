//! Shutdown signalling and background-worker health counters.

use mnemo_types::consolidation::ConsolidationReport;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{info, warn};

/// Owns the shutdown signal and tallies what the consolidation worker did.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    batches: AtomicU64,
    entries_processed: AtomicU64,
    entries_failed: AtomicU64,
    dead_lettered: AtomicU64,
    batch_errors: AtomicU64,
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
            batches: AtomicU64::new(0),
            entries_processed: AtomicU64::new(0),
            entries_failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            batch_errors: AtomicU64::new(0),
        }
    }

    /// A receiver that observes the shutdown signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn shutdown(&self) {
        info!("Supervisor: initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Count a finished consolidation batch.
    pub fn record_batch(&self, report: &ConsolidationReport) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.entries_processed
            .fetch_add(report.processed, Ordering::Relaxed);
        self.entries_failed.fetch_add(report.failed, Ordering::Relaxed);
        self.dead_lettered
            .fetch_add(report.dead_lettered, Ordering::Relaxed);
    }

    /// Count a batch that could not run at all (storage unavailable and so on).
    pub fn record_batch_error(&self) {
        let total = self.batch_errors.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(total_batch_errors = total, "Consolidation batch error recorded");
    }

    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            is_shutting_down: self.is_shutting_down(),
            batches: self.batches.load(Ordering::Relaxed),
            entries_processed: self.entries_processed.load(Ordering::Relaxed),
            entries_failed: self.entries_failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            batch_errors: self.batch_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the supervisor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorHealth {
    pub is_shutting_down: bool,
    pub batches: u64,
    pub entries_processed: u64,
    pub entries_failed: u64,
    pub dead_lettered: u64,
    pub batch_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown() {
        let supervisor = Supervisor::new();
        assert!(!supervisor.is_shutting_down());
        supervisor.shutdown();
        assert!(supervisor.is_shutting_down());
    }

    #[test]
    fn test_subscribe() {
        let supervisor = Supervisor::new();
        let rx = supervisor.subscribe();
        assert!(!*rx.borrow());
        supervisor.shutdown();
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_batch_counters() {
        let supervisor = Supervisor::new();
        let report = ConsolidationReport {
            processed: 4,
            failed: 1,
            dead_lettered: 1,
            ..Default::default()
        };
        supervisor.record_batch(&report);
        supervisor.record_batch(&report);
        supervisor.record_batch_error();

        let health = supervisor.health();
        assert_eq!(health.batches, 2);
        assert_eq!(health.entries_processed, 8);
        assert_eq!(health.entries_failed, 2);
        assert_eq!(health.dead_lettered, 2);
        assert_eq!(health.batch_errors, 1);
        assert!(!health.is_shutting_down);
    }
}
