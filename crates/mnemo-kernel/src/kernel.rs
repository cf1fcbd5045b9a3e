//! MnemoKernel: boots the memory engine and runs consolidation behind it.

use crate::config::load_config;
use crate::error::{KernelError, KernelResult};
use crate::logging::init_tracing;
use crate::supervisor::{Supervisor, SupervisorHealth};
use crate::worker::spawn_consolidation_worker;
use mnemo_memory::Components;
use mnemo_types::config::MemoryConfig;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct MnemoKernel {
    config: MemoryConfig,
    components: Arc<Components>,
    supervisor: Arc<Supervisor>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MnemoKernel {
    /// Load the config file (default `~/.mnemo/config.toml`) and boot.
    pub fn boot_from_path(path: Option<&Path>) -> KernelResult<Self> {
        Self::boot(load_config(path))
    }

    /// Initialise tracing, open the ledger under `data_dir`, and boot.
    pub fn boot(config: MemoryConfig) -> KernelResult<Self> {
        init_tracing(&config.log_level, config.log_json);
        let components = Components::open(&config)?;
        Self::boot_with(config, components)
    }

    /// Boot around already assembled components.
    ///
    /// Verifies the ledger from its latest checkpoint, resets queue entries a
    /// previous run left in `processing`, re-persists dirty slots, then spawns
    /// the consolidation worker. Must run inside a Tokio runtime.
    pub fn boot_with(config: MemoryConfig, components: Components) -> KernelResult<Self> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| KernelError::BootFailed(format!("no Tokio runtime: {e}")))?;

        let verification = components.block_store.verify_from_checkpoint()?;
        if !verification.valid {
            let reason = verification.reason.unwrap_or_default();
            error!(
                first_corrupt_index = ?verification.first_corrupt_index,
                reason = %reason,
                "Ledger failed startup verification"
            );
            return Err(KernelError::BootFailed(format!(
                "ledger integrity check failed at block {:?}: {reason}",
                verification.first_corrupt_index
            )));
        }
        let recovered = components.consolidation.recover_stale()?;
        let reconciled = components.slot_router.reconcile()?;

        let components = Arc::new(components);
        let supervisor = Arc::new(Supervisor::new());
        let worker = spawn_consolidation_worker(
            components.consolidation.clone(),
            components.block_store.append_signal(),
            supervisor.clone(),
        );

        info!(
            blocks = components.block_store.len()?,
            verified = verification.checked,
            recovered,
            reconciled,
            "Mnemo kernel booted"
        );
        Ok(Self {
            config,
            components,
            supervisor,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn health(&self) -> SupervisorHealth {
        self.supervisor.health()
    }

    /// Signal the worker to stop and wait for it. Idempotent.
    pub async fn shutdown(&self) -> KernelResult<()> {
        self.supervisor.shutdown();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| KernelError::WorkerFailed(e.to_string()))?;
            info!("Mnemo kernel stopped");
        }
        Ok(())
    }
}

impl Drop for MnemoKernel {
    fn drop(&mut self) {
        if !self.supervisor.is_shutting_down() {
            self.supervisor.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_memory::classifier::RuleBasedClassifier;
    use mnemo_memory::clock::SystemClock;
    use mnemo_memory::db::open_in_memory;
    use mnemo_types::block::AppendRequest;
    use mnemo_types::consolidation::QueueStatus;
    use std::time::Duration;

    async fn wait_for_done(kernel: &MnemoKernel, n: u64) {
        for _ in 0..300 {
            let stats = kernel.components().consolidation.queue_stats().unwrap();
            if stats.done == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("consolidation queue did not drain");
    }

    fn in_memory() -> (MemoryConfig, Components) {
        let config = MemoryConfig::default();
        let components = Components::open_in_memory(&config).unwrap();
        (config, components)
    }

    #[tokio::test]
    async fn test_worker_consolidates_appends() {
        let (config, components) = in_memory();
        let kernel = MnemoKernel::boot_with(config, components).unwrap();
        let c = kernel.components();
        c.append(AppendRequest::new("auth login bug", vec![1.0, 0.0]).with_keywords(["auth"]))
            .unwrap();
        c.append(AppendRequest::new("auth token refactor", vec![0.9, 0.3]).with_keywords(["auth"]))
            .unwrap();
        c.append(AppendRequest::new("lunch plans", vec![0.0, 1.0])).unwrap();

        wait_for_done(&kernel, 3).await;
        assert!(kernel.health().entries_processed >= 3);

        kernel.shutdown().await.unwrap();
        assert!(kernel.health().is_shutting_down);
        kernel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_boot_recovers_stale_entries() {
        let (config, components) = in_memory();
        components
            .append(AppendRequest::new("interrupted", vec![1.0]))
            .unwrap();
        let claimed = components.consolidation.claim_next().unwrap().unwrap();
        assert_eq!(claimed.status, QueueStatus::Processing);

        let kernel = MnemoKernel::boot_with(config, components).unwrap();
        wait_for_done(&kernel, 1).await;
        kernel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_boot_refuses_tampered_ledger() {
        let config = MemoryConfig::default();
        let conn = open_in_memory().unwrap();
        let components = Components::assemble(
            conn.clone(),
            &config,
            Arc::new(RuleBasedClassifier::default()),
            Arc::new(SystemClock),
        )
        .unwrap();
        for i in 0..3 {
            components
                .append(AppendRequest::new(format!("entry {i}"), vec![1.0, i as f32]))
                .unwrap();
        }
        conn.lock()
            .unwrap()
            .execute_batch("UPDATE blocks SET content = 'forged' WHERE block_index = 1")
            .unwrap();

        match MnemoKernel::boot_with(config, components) {
            Err(KernelError::BootFailed(msg)) => assert!(msg.contains("Some(1)")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("tampered ledger booted"),
        }
    }

    #[test]
    fn test_boot_requires_runtime() {
        let (config, components) = in_memory();
        assert!(matches!(
            MnemoKernel::boot_with(config, components),
            Err(KernelError::BootFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_boot_from_file_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            data_dir: dir.path().join("ledger"),
            ..Default::default()
        };
        let kernel = MnemoKernel::boot(config).unwrap();
        kernel
            .components()
            .append(AppendRequest::new("on disk", vec![0.5, 0.5]))
            .unwrap();
        kernel.shutdown().await.unwrap();
        drop(kernel);

        let kernel = MnemoKernel::boot(MemoryConfig {
            data_dir: dir.path().join("ledger"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(kernel.components().block_store.len().unwrap(), 1);
        kernel.shutdown().await.unwrap();
    }
}
