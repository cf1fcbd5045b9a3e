//! Configuration types for the memory ledger.
//!
//! Every field has a default so a partial (or missing) `config.toml` is valid.
//! The thresholds and EMA weights are empirical; treat them as tuning knobs.

use crate::error::{MnemoError, MnemoResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory holding the ledger database.
    pub data_dir: PathBuf,
    /// Database file name inside `data_dir`.
    pub db_file: String,
    /// Default tracing level (overridden by `RUST_LOG`).
    pub log_level: String,
    /// Emit JSON log lines.
    pub log_json: bool,
    /// Slot routing.
    pub routing: RoutingConfig,
    /// Search engine.
    pub search: SearchConfig,
    /// Consolidation pipeline.
    pub consolidation: ConsolidationConfig,
    /// Hash-chain ledger.
    pub ledger: LedgerConfig,
    /// Retry policy for storage contention.
    pub retry: RetryConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_file: "ledger.db".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            routing: RoutingConfig::default(),
            search: SearchConfig::default(),
            consolidation: ConsolidationConfig::default(),
            ledger: LedgerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Full path of the ledger database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> MnemoResult<()> {
        let r = &self.routing;
        if r.slot_count == 0 || r.slot_count > 26 {
            return Err(MnemoError::Config(format!(
                "routing.slot_count must be within 1..=26, got {}",
                r.slot_count
            )));
        }
        if r.divergence_threshold > r.existing_branch_threshold {
            return Err(MnemoError::Config(format!(
                "routing.divergence_threshold ({}) exceeds existing_branch_threshold ({})",
                r.divergence_threshold, r.existing_branch_threshold
            )));
        }
        if !(0.0..=1.0).contains(&r.ema_keep) {
            return Err(MnemoError::Config("routing.ema_keep must be within 0..=1".into()));
        }
        if r.base_hop_budget > r.max_hop_budget {
            return Err(MnemoError::Config(
                "routing.base_hop_budget exceeds max_hop_budget".into(),
            ));
        }
        if self.search.cache_capacity == 0 {
            return Err(MnemoError::Config("search.cache_capacity must be > 0".into()));
        }
        if self.consolidation.max_attempts == 0 || self.retry.max_attempts == 0 {
            return Err(MnemoError::Config("max_attempts must be > 0".into()));
        }
        if self.ledger.checkpoint_interval == 0 {
            return Err(MnemoError::Config(
                "ledger.checkpoint_interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Slot routing thresholds and profile parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Number of slots.
    pub slot_count: u8,
    /// Similarity at or above which a write continues the current thread.
    pub existing_branch_threshold: f32,
    /// Similarity at or above which a write diverges inside the slot.
    pub divergence_threshold: f32,
    /// Weight kept from the old topic vector on each move.
    pub ema_keep: f32,
    /// Bonus given to the most recently used slot when comparing.
    pub hysteresis: f32,
    /// Hop budget of a cold slot.
    pub base_hop_budget: u32,
    /// Cap for the hot-slot hop budget.
    pub max_hop_budget: u32,
    /// A slot used within this many seconds is hot.
    pub hot_window_secs: u64,
    /// Exploration slack for cold slots.
    pub explore_eps: f32,
    /// Exploration slack for hot slots.
    pub hot_explore_eps: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            slot_count: 3,
            existing_branch_threshold: 0.7,
            divergence_threshold: 0.4,
            ema_keep: 0.8,
            hysteresis: 0.05,
            base_hop_budget: 2,
            max_hop_budget: 3,
            hot_window_secs: 30 * 60,
            explore_eps: 0.10,
            hot_explore_eps: 0.15,
        }
    }
}

/// Search engine parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Hop limit when neither the request nor the slot profile sets one.
    pub default_depth: u32,
    /// Result count used by adapters that do not pass one.
    pub default_k: usize,
    /// Relevance floor used by adapters that do not pass one.
    pub min_similarity: f32,
    /// Associations followed per found block.
    pub association_fanout: usize,
    /// Weight of embedding similarity when the query has text.
    pub semantic_weight: f32,
    /// Weight of keyword overlap when the query has text.
    pub keyword_weight: f32,
    /// Maximum cached results.
    pub cache_capacity: usize,
    /// Lifetime of a cached result in seconds (0 disables caching).
    pub cache_ttl_secs: u64,
    /// Default deadline in milliseconds.
    pub deadline_ms: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_depth: 2,
            default_k: 5,
            min_similarity: 0.3,
            association_fanout: 3,
            semantic_weight: 0.8,
            keyword_weight: 0.2,
            cache_capacity: 256,
            cache_ttl_secs: 300,
            deadline_ms: None,
        }
    }
}

impl SearchConfig {
    /// Cached-result lifetime.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Consolidation pipeline parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Similar blocks compared per new block.
    pub candidates: usize,
    /// Candidates below this cosine similarity are not compared.
    pub min_candidate_similarity: f32,
    /// Attempts before an entry is dead-lettered.
    pub max_attempts: u32,
    /// Weight kept from the old strength when an association is reinforced.
    pub strength_ema_keep: f32,
    /// Worker poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Entries drained per worker wake-up.
    pub batch_size: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            candidates: 8,
            min_candidate_similarity: 0.2,
            max_attempts: 3,
            strength_ema_keep: 0.7,
            poll_interval_ms: 500,
            batch_size: 32,
        }
    }
}

/// Ledger parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// A checkpoint anchor is written every this many blocks.
    pub checkpoint_interval: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100,
        }
    }
}

/// Retry policy for transient storage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds; doubles afterwards.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

/// Default data directory (`~/.mnemo`).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".mnemo")
}
