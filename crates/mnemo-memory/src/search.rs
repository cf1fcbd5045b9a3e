//! DFS-first, association-augmented search.
//!
//! Phases, in order:
//! 1. resolve the entry slot (from the query for `cursor`, or as named) and its profile
//! 2. consult the result cache
//! 3. bounded DFS over branch parent/child links from the slot head, pruning
//!    anything below `tolerance`
//! 4. one batched association expansion over everything found
//! 5. a global scan when fewer than `k` results were found and fallback is on
//!
//! Results are ordered by score, then by recency. Association edges appear
//! only after consolidation has run; freshly written blocks are reachable
//! through their branch links immediately.

use crate::association::AssociationStore;
use crate::block_store::BlockStore;
use crate::cache::{CacheKey, SearchCache};
use crate::slot_router::SlotRouter;
use crate::vector::cosine_similarity;
use mnemo_types::block::Block;
use mnemo_types::config::SearchConfig;
use mnemo_types::error::{MnemoError, MnemoResult};
use mnemo_types::search::{
    HitSource, SearchEntry, SearchHit, SearchMeta, SearchMetrics, SearchRequest, SearchResult,
    SearchType,
};
use mnemo_types::slot::SlotId;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Lowercased alphanumeric tokens of at least two characters.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[derive(Default)]
struct Counters {
    searches: AtomicU64,
    total_hops: AtomicU64,
    local_hits: AtomicU64,
    fallbacks: AtomicU64,
    cache_hits: AtomicU64,
}

pub struct SearchEngine {
    store: Arc<BlockStore>,
    router: Arc<SlotRouter>,
    associations: AssociationStore,
    cache: SearchCache,
    config: SearchConfig,
    counters: Counters,
}

/// Query-side inputs to scoring.
struct Relevance<'a> {
    embedding: &'a [f32],
    terms: BTreeSet<String>,
    semantic_weight: f32,
    keyword_weight: f32,
}

impl Relevance<'_> {
    /// Returns `(score, keyword_overlap)`.
    fn score(&self, embedding: &[f32], keywords: &BTreeSet<String>, content: &str) -> (f32, f32) {
        let cosine = cosine_similarity(self.embedding, embedding);
        if self.terms.is_empty() {
            return (cosine, 0.0);
        }
        let tokens = tokenize(content);
        let matched = self
            .terms
            .iter()
            .filter(|t| keywords.contains(*t) || tokens.contains(*t))
            .count();
        let overlap = matched as f32 / self.terms.len() as f32;
        (
            self.semantic_weight * cosine + self.keyword_weight * overlap,
            overlap,
        )
    }

    fn score_block(&self, block: &Block) -> f32 {
        self.score(&block.embedding, &block.keywords, &block.content).0
    }
}

struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    fn expired(&self) -> bool {
        self.limit.is_some_and(|limit| self.started.elapsed() >= limit)
    }
}

impl SearchEngine {
    pub fn new(
        store: Arc<BlockStore>,
        router: Arc<SlotRouter>,
        associations: AssociationStore,
        config: SearchConfig,
    ) -> Self {
        let cache = SearchCache::new(config.cache_capacity, config.cache_ttl());
        Self {
            store,
            router,
            associations,
            cache,
            config,
            counters: Counters::default(),
        }
    }

    /// Run a search. Always returns a structured result; an empty result is
    /// not an error.
    pub fn search(&self, request: &SearchRequest) -> MnemoResult<SearchResult> {
        if !request.tolerance.is_finite() {
            return Err(MnemoError::InvalidInput("tolerance must be finite".into()));
        }
        let deadline = Deadline {
            started: Instant::now(),
            limit: request
                .deadline
                .or(self.config.deadline_ms.map(Duration::from_millis)),
        };

        // 1. Entry
        let (entry_slot, cursor) = match request.entry {
            SearchEntry::Cursor => (self.router.select_slot(&request.query_embedding).slot_id, true),
            SearchEntry::Slot(id) => (id, false),
        };
        let slot = self.router.slot(entry_slot);
        let head = slot.as_ref().and_then(|s| s.head_block_id);
        let profile = slot
            .as_ref()
            .and_then(|s| self.router.profile(s.id).ok());
        let depth = request
            .depth
            .or(profile.map(|p| p.hop_budget))
            .unwrap_or(self.config.default_depth);
        let explore_eps = profile.map(|p| p.explore_eps).unwrap_or(0.0);
        let entry_slot = slot.map(|s| s.id);
        debug!(slot = ?entry_slot, head = ?head, depth, cursor, "Search entry resolved");

        // 2. Cache
        let key = CacheKey::new(
            &request.query_text,
            entry_slot,
            depth,
            cursor,
            &request.query_embedding,
            request.k,
            request.tolerance,
            request.fallback,
        );
        if let Some(mut cached) = self.cache.get(&key) {
            cached.meta.from_cache = true;
            self.counters.searches.fetch_add(1, Ordering::Relaxed);
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(items = cached.items.len(), "Search served from cache");
            return Ok(cached);
        }

        let relevance = Relevance {
            embedding: &request.query_embedding,
            terms: tokenize(&request.query_text),
            semantic_weight: self.config.semantic_weight,
            keyword_weight: self.config.keyword_weight,
        };

        let mut found: HashMap<u64, SearchHit> = HashMap::new();
        let mut visited: HashSet<u64> = HashSet::new();
        let mut partial = false;

        // 3. Bounded local walk
        if let Some(head) = head {
            partial = self.walk(head, depth, request.tolerance, &relevance, &deadline, &mut found, &mut visited)?;
            debug!(found = found.len(), visited = visited.len(), "Local walk done");
        }

        // 4. Association expansion
        if !found.is_empty() && !partial {
            if deadline.expired() {
                partial = true;
            } else {
                let floor = request.tolerance - explore_eps;
                let added = self.expand_associations(floor, &relevance, &mut found, &mut visited)?;
                debug!(added, floor, "Association expansion done");
            }
        }

        // 5. Fallback
        let mut fell_back = false;
        if found.len() < request.k && request.fallback && !partial {
            if deadline.expired() {
                partial = true;
            } else {
                let added = self.global_scan(request, &relevance, &mut found)?;
                fell_back = true;
                debug!(added, "Global fallback scan done");
            }
        }

        let mut items: Vec<SearchHit> = found.into_values().collect();
        items.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.block.index.cmp(&a.block.index))
        });
        items.truncate(request.k);

        let search_type = if fell_back {
            SearchType::LtmFallback
        } else if items.is_empty() {
            SearchType::Empty
        } else {
            SearchType::Local
        };
        let hops = items.iter().map(|h| h.hops).max().unwrap_or(0);
        let result = SearchResult {
            items,
            meta: SearchMeta {
                search_type,
                hops,
                from_cache: false,
                partial,
                entry_slot,
                visited: visited.len(),
            },
        };
        self.record(&result.meta);
        if !partial {
            // Any append can change what a global scan would return.
            self.cache.put(key, result.clone(), fell_back);
        }
        Ok(result)
    }

    /// DFS from `head`. Returns `true` if the deadline cut it short.
    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        head: u64,
        depth: u32,
        tolerance: f32,
        relevance: &Relevance<'_>,
        deadline: &Deadline,
        found: &mut HashMap<u64, SearchHit>,
        visited: &mut HashSet<u64>,
    ) -> MnemoResult<bool> {
        let mut stack: Vec<(u64, u32)> = vec![(head, 0)];
        while let Some((index, hops)) = stack.pop() {
            if deadline.expired() {
                return Ok(true);
            }
            if !visited.insert(index) {
                continue;
            }
            let Some(block) = self.store.get(index)? else {
                continue;
            };
            let score = relevance.score_block(&block);
            if score < tolerance {
                // Pruned: contributes nothing and is not expanded.
                continue;
            }
            if hops < depth {
                for next in self.store.branch_neighbors(index)? {
                    if !visited.contains(&next) {
                        stack.push((next, hops + 1));
                    }
                }
            }
            let source = if hops == 0 {
                HitSource::Entry
            } else {
                HitSource::Branch
            };
            found.insert(
                index,
                SearchHit {
                    block,
                    score,
                    source,
                    hops,
                },
            );
        }
        Ok(false)
    }

    /// Add unvisited association neighbours of everything found so far.
    fn expand_associations(
        &self,
        floor: f32,
        relevance: &Relevance<'_>,
        found: &mut HashMap<u64, SearchHit>,
        visited: &mut HashSet<u64>,
    ) -> MnemoResult<usize> {
        let sources: Vec<u64> = found.keys().copied().collect();
        let edges = self
            .associations
            .neighbors_batch(&sources, self.config.association_fanout)?;

        // neighbour -> hops of the closest source that reached it
        let mut candidates: HashMap<u64, u32> = HashMap::new();
        for (source, neighbors) in &edges {
            let source_hops = found.get(source).map(|h| h.hops).unwrap_or(0);
            for edge in neighbors {
                if visited.contains(&edge.neighbor_block) {
                    continue;
                }
                let hops = source_hops + 1;
                candidates
                    .entry(edge.neighbor_block)
                    .and_modify(|h| *h = (*h).min(hops))
                    .or_insert(hops);
            }
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        let indices: Vec<u64> = candidates.keys().copied().collect();
        let mut added = 0;
        for block in self.store.get_many(&indices)? {
            visited.insert(block.index);
            let score = relevance.score_block(&block);
            if score < floor {
                continue;
            }
            let hops = candidates.get(&block.index).copied().unwrap_or(1);
            found.insert(
                block.index,
                SearchHit {
                    block,
                    score,
                    source: HitSource::Association,
                    hops,
                },
            );
            added += 1;
        }
        Ok(added)
    }

    /// Score every block, ignoring locality. Keyword matches are admitted
    /// even below tolerance so matching content is always found.
    fn global_scan(
        &self,
        request: &SearchRequest,
        relevance: &Relevance<'_>,
        found: &mut HashMap<u64, SearchHit>,
    ) -> MnemoResult<usize> {
        let mut scored: Vec<(u64, f32)> = Vec::new();
        for row in self.store.scan()? {
            if found.contains_key(&row.index) {
                continue;
            }
            let keywords: BTreeSet<String> = row.keywords.into_iter().collect();
            let (score, overlap) = relevance.score(&row.embedding, &keywords, &row.content);
            if score >= request.tolerance || overlap > 0.0 {
                scored.push((row.index, score));
            }
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));
        scored.truncate(request.k);

        let scores: HashMap<u64, f32> = scored.iter().copied().collect();
        let indices: Vec<u64> = scored.iter().map(|(i, _)| *i).collect();
        let mut added = 0;
        for block in self.store.get_many(&indices)? {
            let score = scores.get(&block.index).copied().unwrap_or(0.0);
            found.insert(
                block.index,
                SearchHit {
                    block,
                    score,
                    source: HitSource::Fallback,
                    hops: 0,
                },
            );
            added += 1;
        }
        Ok(added)
    }

    /// Tally a computed (non-cached) search.
    fn record(&self, meta: &SearchMeta) {
        let c = &self.counters;
        c.searches.fetch_add(1, Ordering::Relaxed);
        c.total_hops.fetch_add(meta.hops as u64, Ordering::Relaxed);
        match meta.search_type {
            SearchType::Local => {
                c.local_hits.fetch_add(1, Ordering::Relaxed);
            }
            SearchType::LtmFallback => {
                c.fallbacks.fetch_add(1, Ordering::Relaxed);
            }
            SearchType::Empty => {}
        }
    }

    /// Drop cached results a write to `slot` may have made stale.
    pub fn invalidate(&self, slot: SlotId) {
        let dropped = self.cache.invalidate_slot(slot);
        if dropped > 0 {
            debug!(slot = %slot, dropped, "Invalidated cached searches");
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn metrics(&self) -> SearchMetrics {
        let c = &self.counters;
        let searches = c.searches.load(Ordering::Relaxed);
        let cache_hits = c.cache_hits.load(Ordering::Relaxed);
        let computed = searches.saturating_sub(cache_hits);
        let ratio = |n: u64, total: u64| {
            if total == 0 {
                0.0
            } else {
                n as f64 / total as f64
            }
        };
        SearchMetrics {
            searches,
            avg_hops: ratio(c.total_hops.load(Ordering::Relaxed), computed),
            local_hit_rate: ratio(c.local_hits.load(Ordering::Relaxed), computed),
            fallback_rate: ratio(c.fallbacks.load(Ordering::Relaxed), computed),
            cache_hit_rate: ratio(cache_hits, searches),
            cache_size: self.cache.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::db::open_in_memory;
    use crate::retry::RetryPolicy;
    use chrono::Utc;
    use mnemo_types::association::AssociationType;
    use mnemo_types::block::AppendRequest;
    use mnemo_types::config::RoutingConfig;

    struct Fixture {
        store: Arc<BlockStore>,
        associations: AssociationStore,
        engine: SearchEngine,
    }

    fn fixture() -> Fixture {
        let conn = open_in_memory().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let router = Arc::new(
            SlotRouter::load(
                conn.clone(),
                RoutingConfig::default(),
                RetryPolicy::default(),
                clock.clone(),
            )
            .unwrap(),
        );
        let store = Arc::new(BlockStore::new(
            conn.clone(),
            router.clone(),
            RetryPolicy::default(),
            clock,
            100,
        ));
        let associations = AssociationStore::new(conn, 0.7);
        let engine = SearchEngine::new(
            store.clone(),
            router,
            associations.clone(),
            SearchConfig::default(),
        );
        Fixture {
            store,
            associations,
            engine,
        }
    }

    fn append(f: &Fixture, content: &str, embedding: Vec<f32>) -> u64 {
        let keywords: Vec<String> = tokenize(content).into_iter().collect();
        f.store
            .append(AppendRequest::new(content, embedding).with_keywords(keywords))
            .unwrap()
            .block
            .index
    }

    #[test]
    fn test_tokenize() {
        let t = tokenize("Auth-login: a BUG!");
        assert_eq!(
            t.into_iter().collect::<Vec<_>>(),
            vec!["auth", "bug", "login"]
        );
    }

    #[test]
    fn test_empty_store_returns_empty() {
        let f = fixture();
        let r = f
            .engine
            .search(&SearchRequest::new("anything", vec![1.0, 0.0]))
            .unwrap();
        assert!(r.items.is_empty());
        assert_eq!(r.meta.search_type, SearchType::LtmFallback);

        let r = f
            .engine
            .search(&SearchRequest::new("anything", vec![1.0, 0.0]).fallback(false))
            .unwrap();
        assert_eq!(r.meta.search_type, SearchType::Empty);
    }

    #[test]
    fn test_local_walk_orders_by_score_then_recency() {
        let f = fixture();
        append(&f, "alpha one", vec![1.0, 0.0, 0.0]);
        append(&f, "alpha two", vec![1.0, 0.0, 0.0]);
        append(&f, "alpha three", vec![0.9, 0.2, 0.0]);

        let r = f
            .engine
            .search(
                &SearchRequest::new("", vec![1.0, 0.0, 0.0])
                    .from_slot(SlotId(0))
                    .depth(3)
                    .k(2),
            )
            .unwrap();
        assert_eq!(r.meta.search_type, SearchType::Local);
        let order: Vec<u64> = r.items.iter().map(|h| h.block.index).collect();
        // 0 and 1 tie on score; the newer wins.
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_prune_below_tolerance_stops_expansion() {
        let f = fixture();
        append(&f, "kept root", vec![1.0, 0.0]);
        let head = f
            .store
            .append(
                AppendRequest::new("off topic", vec![0.0, 1.0]).in_slot(SlotId(0)),
            )
            .unwrap()
            .block
            .index;
        assert_eq!(head, 1);
        let r = f
            .engine
            .search(
                &SearchRequest::new("", vec![1.0, 0.0])
                    .from_slot(SlotId(0))
                    .depth(2)
                    .tolerance(0.5)
                    .fallback(false),
            )
            .unwrap();
        // The head scores 0, so its parent is never reached.
        assert!(r.items.is_empty());
        assert_eq!(r.meta.visited, 1);
    }

    #[test]
    fn test_depth_zero_uses_entry_and_associations() {
        let f = fixture();
        let a = append(&f, "tokens expire", vec![1.0, 0.0, 0.0]);
        let b = append(&f, "session store", vec![0.0, 0.0, 1.0]);
        let c = append(&f, "tokens refresh", vec![0.95, 0.1, 0.0]);
        assert_eq!(f.store.get(c).unwrap().unwrap().before, Some(f.store.get(a).unwrap().unwrap().hash));
        f.associations
            .record(c, b, &AssociationType::Causal, 0.8, &HashMap::new(), Utc::now())
            .unwrap();

        let r = f
            .engine
            .search(
                &SearchRequest::new("", vec![0.6, 0.0, 0.8])
                    .from_slot(SlotId(0))
                    .depth(0)
                    .tolerance(0.3)
                    .fallback(false),
            )
            .unwrap();
        let got: Vec<(u64, HitSource)> = r.items.iter().map(|h| (h.block.index, h.source)).collect();
        assert!(got.contains(&(c, HitSource::Entry)));
        assert!(got.contains(&(b, HitSource::Association)));
        assert!(!got.iter().any(|(i, _)| *i == a));
    }

    #[test]
    fn test_cache_hit_and_invalidation() {
        let f = fixture();
        append(&f, "cache me", vec![1.0, 0.0]);
        let req = SearchRequest::new("cache", vec![1.0, 0.0]);
        let first = f.engine.search(&req).unwrap();
        assert!(!first.meta.from_cache);
        let second = f.engine.search(&req).unwrap();
        assert!(second.meta.from_cache);
        assert_eq!(first.items, second.items);

        f.engine.invalidate(SlotId(0));
        assert!(!f.engine.search(&req).unwrap().meta.from_cache);

        let m = f.engine.metrics();
        assert_eq!(m.searches, 3);
        assert!((m.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.cache_size, 1);
    }

    #[test]
    fn test_cache_hits_skip_hop_and_type_tallies() {
        let f = fixture();
        append(&f, "alpha one", vec![1.0, 0.0]);
        append(&f, "alpha two", vec![1.0, 0.0]);

        let branch = SearchRequest::new("", vec![1.0, 0.0])
            .from_slot(SlotId(0))
            .depth(1)
            .k(2)
            .fallback(false);
        let r = f.engine.search(&branch).unwrap();
        assert_eq!(r.meta.search_type, SearchType::Local);
        assert_eq!(r.meta.hops, 1);
        assert!(f.engine.search(&branch).unwrap().meta.from_cache);

        let wide = SearchRequest::new("", vec![1.0, 0.0])
            .from_slot(SlotId(0))
            .depth(0)
            .k(10);
        let r = f.engine.search(&wide).unwrap();
        assert_eq!(r.meta.search_type, SearchType::LtmFallback);
        assert_eq!(r.meta.hops, 0);

        let m = f.engine.metrics();
        assert_eq!(m.searches, 3);
        assert!((m.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((m.avg_hops - 0.5).abs() < 1e-9);
        assert!((m.local_hit_rate - 0.5).abs() < 1e-9);
        assert!((m.fallback_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_zero_deadline_is_partial_and_uncached() {
        let f = fixture();
        append(&f, "slow", vec![1.0]);
        let req = SearchRequest::new("slow", vec![1.0]).deadline(Duration::ZERO);
        let r = f.engine.search(&req).unwrap();
        assert!(r.meta.partial);
        assert!(!f.engine.search(&req).unwrap().meta.from_cache);
    }

    #[test]
    fn test_keyword_fallback_below_tolerance() {
        let f = fixture();
        append(&f, "zebra migration notes", vec![0.0, 1.0]);
        append(&f, "unrelated", vec![1.0, 0.0]);
        let r = f
            .engine
            .search(
                &SearchRequest::new("zebra", vec![1.0, 0.0])
                    .from_slot(SlotId(1))
                    .depth(0)
                    .tolerance(0.95),
            )
            .unwrap();
        assert_eq!(r.meta.search_type, SearchType::LtmFallback);
        assert!(r.items.iter().any(|h| h.block.content.contains("zebra")));
    }
}
