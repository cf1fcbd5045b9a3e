//! The typed aggregate that wires every subsystem to one database.

use crate::association::AssociationStore;
use crate::block_store::BlockStore;
use crate::classifier::RuleBasedClassifier;
use crate::clock::{Clock, SystemClock};
use crate::consolidation::ConsolidationPipeline;
use crate::db::{open_database, open_in_memory, SharedConnection};
use crate::retry::RetryPolicy;
use crate::search::SearchEngine;
use crate::slot_router::SlotRouter;
use mnemo_types::block::{AppendRequest, BlockRecord, ChainVerification};
use mnemo_types::classifier::PairClassifier;
use mnemo_types::config::MemoryConfig;
use mnemo_types::error::MnemoResult;
use mnemo_types::search::{SearchMetrics, SearchRequest, SearchResult};
use mnemo_types::slot::SlotId;
use mnemo_types::text::TextAnalyzer;
use std::ops::Range;
use std::sync::Arc;
use tracing::info;

/// Block store, slot router, search engine, and consolidation pipeline,
/// built once and shared by reference.
pub struct Components {
    pub block_store: Arc<BlockStore>,
    pub slot_router: Arc<SlotRouter>,
    pub search_engine: SearchEngine,
    pub consolidation: Arc<ConsolidationPipeline>,
}

impl Components {
    /// Open the database at `config.db_path()` with the rule-based classifier.
    pub fn open(config: &MemoryConfig) -> MnemoResult<Self> {
        config.validate()?;
        let conn = open_database(&config.db_path())?;
        Self::assemble(
            conn,
            config,
            Arc::new(RuleBasedClassifier::default()),
            Arc::new(SystemClock),
        )
    }

    /// Same as [`open`](Self::open) but backed by an in-memory database.
    pub fn open_in_memory(config: &MemoryConfig) -> MnemoResult<Self> {
        config.validate()?;
        Self::assemble(
            open_in_memory()?,
            config,
            Arc::new(RuleBasedClassifier::default()),
            Arc::new(SystemClock),
        )
    }

    /// Build from an already migrated connection.
    pub fn assemble(
        conn: SharedConnection,
        config: &MemoryConfig,
        classifier: Arc<dyn PairClassifier>,
        clock: Arc<dyn Clock>,
    ) -> MnemoResult<Self> {
        config.validate()?;
        let retry = RetryPolicy::from_config(&config.retry);
        let slot_router = Arc::new(SlotRouter::load(
            conn.clone(),
            config.routing.clone(),
            retry.clone(),
            clock.clone(),
        )?);
        let block_store = Arc::new(BlockStore::new(
            conn.clone(),
            slot_router.clone(),
            retry,
            clock.clone(),
            config.ledger.checkpoint_interval,
        ));
        let associations =
            AssociationStore::new(conn.clone(), config.consolidation.strength_ema_keep);
        let search_engine = SearchEngine::new(
            block_store.clone(),
            slot_router.clone(),
            associations.clone(),
            config.search.clone(),
        );
        let consolidation = Arc::new(ConsolidationPipeline::new(
            conn,
            block_store.clone(),
            associations,
            classifier.clone(),
            config.consolidation.clone(),
            clock,
        ));
        info!(
            slots = config.routing.slot_count,
            classifier = classifier.name(),
            "Memory components assembled"
        );
        Ok(Self {
            block_store,
            slot_router,
            search_engine,
            consolidation,
        })
    }

    /// Append a block and drop the cached searches it may have made stale.
    pub fn append(&self, request: AppendRequest) -> MnemoResult<BlockRecord> {
        let record = self.block_store.append(request)?;
        if let Some(slot) = record.block.slot_id {
            self.search_engine.invalidate(slot);
        }
        Ok(record)
    }

    /// Analyze `content`, then append it with the extracted features.
    pub async fn append_text(
        &self,
        analyzer: &dyn TextAnalyzer,
        content: &str,
        importance: f32,
        slot: Option<SlotId>,
        root: Option<String>,
    ) -> MnemoResult<BlockRecord> {
        let features = analyzer.analyze(content).await?;
        let mut request = AppendRequest::new(content, features.embedding)
            .with_keywords(features.keywords)
            .with_tags(features.tags)
            .with_importance(importance);
        request.slot = slot;
        request.root = root;
        self.append(request)
    }

    pub fn search(&self, request: &SearchRequest) -> MnemoResult<SearchResult> {
        self.search_engine.search(request)
    }

    pub fn get_metrics(&self) -> SearchMetrics {
        self.search_engine.metrics()
    }

    /// Recompute hashes over `range` (the whole ledger when `None`).
    pub fn verify_chain(&self, range: Option<Range<u64>>) -> MnemoResult<ChainVerification> {
        self.block_store.verify_chain(range)
    }

    /// Freeze `slot` at `block_index`; cached searches from the old head are dropped.
    pub fn pin(&self, slot: SlotId, block_index: u64) -> MnemoResult<()> {
        self.slot_router.pin(slot, block_index)?;
        self.search_engine.invalidate(slot);
        Ok(())
    }

    pub fn unpin(&self, slot: SlotId) -> MnemoResult<()> {
        self.slot_router.unpin(slot)?;
        self.search_engine.invalidate(slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mnemo_types::error::MnemoError;
    use mnemo_types::search::SearchType;
    use mnemo_types::text::TextFeatures;

    struct FixedAnalyzer;

    #[async_trait]
    impl TextAnalyzer for FixedAnalyzer {
        async fn analyze(&self, content: &str) -> MnemoResult<TextFeatures> {
            Ok(TextFeatures {
                keywords: content.split_whitespace().map(str::to_lowercase).collect(),
                tags: ["note".to_string()].into_iter().collect(),
                embedding: vec![1.0, 0.0, 0.0],
            })
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = MemoryConfig::default();
        config.routing.slot_count = 0;
        assert!(matches!(
            Components::open_in_memory(&config),
            Err(MnemoError::Config(_))
        ));
    }

    #[test]
    fn test_file_backed_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        {
            let c = Components::open(&config).unwrap();
            c.append(AppendRequest::new("persisted", vec![1.0, 0.0])).unwrap();
        }
        let c = Components::open(&config).unwrap();
        assert_eq!(c.block_store.len().unwrap(), 1);
        assert!(c.verify_chain(None).unwrap().valid);
        // The slot head survived the restart.
        assert!(c.slot_router.snapshot().iter().any(|s| s.head_block_id == Some(0)));
    }

    #[tokio::test]
    async fn test_append_text_uses_analyzer() {
        let c = Components::open_in_memory(&MemoryConfig::default()).unwrap();
        let record = c
            .append_text(&FixedAnalyzer, "Rust Ownership", 0.9, None, Some("r".into()))
            .await
            .unwrap();
        assert!(record.block.keywords.contains("ownership"));
        assert!(record.block.tags.contains("note"));
        assert_eq!(record.block.root, "r");
    }

    #[test]
    fn test_append_invalidates_cached_search() {
        let c = Components::open_in_memory(&MemoryConfig::default()).unwrap();
        c.append(AppendRequest::new("first", vec![1.0, 0.0])).unwrap();
        let request = SearchRequest::new("first", vec![1.0, 0.0]);
        let before = c.search(&request).unwrap();
        assert_eq!(before.items.len(), 1);
        assert!(c.search(&request).unwrap().meta.from_cache);

        c.append(AppendRequest::new("second", vec![1.0, 0.05])).unwrap();
        let after = c.search(&request).unwrap();
        assert!(!after.meta.from_cache);
        assert_eq!(after.items.len(), 2);
        assert_eq!(after.meta.search_type, SearchType::LtmFallback);
        assert_eq!(c.get_metrics().searches, 3);
    }

    #[test]
    fn test_pin_invalidates_cached_search() {
        let c = Components::open_in_memory(&MemoryConfig::default()).unwrap();
        let slot = SlotId(0);
        c.append(AppendRequest::new("older", vec![1.0, 0.0]).in_slot(slot))
            .unwrap();
        c.append(AppendRequest::new("newer", vec![1.0, 0.0]).in_slot(slot))
            .unwrap();
        let request = SearchRequest::new("", vec![1.0, 0.0])
            .from_slot(slot)
            .depth(0)
            .fallback(false);
        let heads = |r: &SearchResult| r.items.iter().map(|h| h.block.index).collect::<Vec<_>>();

        assert_eq!(heads(&c.search(&request).unwrap()), vec![1]);
        assert!(c.search(&request).unwrap().meta.from_cache);

        c.pin(slot, 0).unwrap();
        let pinned = c.search(&request).unwrap();
        assert!(!pinned.meta.from_cache);
        assert_eq!(heads(&pinned), vec![0]);
        assert!(c.search(&request).unwrap().meta.from_cache);

        c.unpin(slot).unwrap();
        assert!(!c.search(&request).unwrap().meta.from_cache);
    }
}
