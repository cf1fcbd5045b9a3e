//! Search requests, results, and metrics.

use crate::block::Block;
use crate::slot::SlotId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a search starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchEntry {
    /// Let the slot router pick the slot closest to the query.
    #[default]
    Cursor,
    /// Start from this slot's head.
    Slot(SlotId),
}

/// Parameters of a search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Query embedding.
    pub query_embedding: Vec<f32>,
    /// Raw query text (used for keyword overlap and the cache key).
    pub query_text: String,
    /// Entry point.
    pub entry: SearchEntry,
    /// Hop limit; the slot profile's budget when omitted.
    pub depth: Option<u32>,
    /// Number of results wanted.
    pub k: usize,
    /// Minimum relevance for a block to count (and be expanded).
    pub tolerance: f32,
    /// Run a global scan when local search is insufficient.
    pub fallback: bool,
    /// Give up and return partial results after this long.
    pub deadline: Option<Duration>,
}

impl SearchRequest {
    /// A cursor-entry search with default depth, `k = 5`, tolerance 0.3, and fallback on.
    pub fn new(query_text: impl Into<String>, query_embedding: Vec<f32>) -> Self {
        Self {
            query_embedding,
            query_text: query_text.into(),
            entry: SearchEntry::Cursor,
            depth: None,
            k: 5,
            tolerance: 0.3,
            fallback: true,
            deadline: None,
        }
    }

    /// Start from a named slot.
    pub fn from_slot(mut self, slot: SlotId) -> Self {
        self.entry = SearchEntry::Slot(slot);
        self
    }

    /// Set the hop limit.
    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Set the result count.
    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Set the relevance floor.
    pub fn tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Enable or disable the global fallback.
    pub fn fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    /// Set a deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// How a hit was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    /// The entry block itself.
    Entry,
    /// Reached over before/after pointers.
    Branch,
    /// Reached over an association edge.
    Association,
    /// Found by the global scan.
    Fallback,
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// The matching block.
    pub block: Block,
    /// Relevance to the query.
    pub score: f32,
    /// How the block was reached.
    pub source: HitSource,
    /// Hops from the entry block (0 for entry and fallback hits).
    pub hops: u32,
}

/// Which strategy produced the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    /// Branch walk and association expansion were enough.
    Local,
    /// The global scan ran.
    LtmFallback,
    /// Nothing to search from and fallback disabled.
    Empty,
}

/// Metadata about how a search ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMeta {
    /// Strategy that produced the items.
    pub search_type: SearchType,
    /// Maximum hop distance reached during the local walk.
    pub hops: u32,
    /// Served from the result cache.
    pub from_cache: bool,
    /// The deadline expired before the search finished.
    pub partial: bool,
    /// Slot the search entered through, if any.
    pub entry_slot: Option<SlotId>,
    /// Blocks scored during the search.
    pub visited: usize,
}

/// A structured search result; empty results are not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Hits ordered by score descending, newer first on ties.
    pub items: Vec<SearchHit>,
    /// How the search ran.
    pub meta: SearchMeta,
}

/// Aggregate search metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchMetrics {
    /// Searches served (including cache hits).
    pub searches: u64,
    /// Mean hop depth of non-cached searches.
    pub avg_hops: f64,
    /// Share of non-cached searches answered without the global scan.
    pub local_hit_rate: f64,
    /// Share of non-cached searches that ran the global scan.
    pub fallback_rate: f64,
    /// Share of searches served from cache.
    pub cache_hit_rate: f64,
    /// Entries currently cached.
    pub cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req = SearchRequest::new("auth bug", vec![1.0, 0.0]);
        assert_eq!(req.entry, SearchEntry::Cursor);
        assert_eq!(req.depth, None);
        assert_eq!(req.k, 5);
        assert!(req.fallback);
        let req = req.from_slot(SlotId(1)).depth(0).fallback(false);
        assert_eq!(req.entry, SearchEntry::Slot(SlotId(1)));
        assert_eq!(req.depth, Some(0));
        assert!(!req.fallback);
    }
}
