//! Search result cache.
//!
//! One LRU shared by every slot, bounded by capacity, with a TTL checked
//! lazily on `get()`. A zero TTL disables caching entirely.

use lru::LruCache;
use mnemo_types::search::SearchResult;
use mnemo_types::slot::SlotId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Identifies a search whose result may be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Lowercased, whitespace-collapsed query text.
    pub query: String,
    /// Slot the search started from (`None` when there was no entry head).
    pub slot: Option<SlotId>,
    pub depth: u32,
    /// Entry was resolved from the query rather than named.
    pub cursor: bool,
    /// Everything else that changes the answer: embedding, k, tolerance, fallback.
    pub fingerprint: u64,
}

impl CacheKey {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query_text: &str,
        slot: Option<SlotId>,
        depth: u32,
        cursor: bool,
        embedding: &[f32],
        k: usize,
        tolerance: f32,
        fallback: bool,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        for v in embedding {
            v.to_bits().hash(&mut hasher);
        }
        k.hash(&mut hasher);
        tolerance.to_bits().hash(&mut hasher);
        fallback.hash(&mut hasher);
        Self {
            query: normalize_query(query_text),
            slot,
            depth,
            cursor,
            fingerprint: hasher.finish(),
        }
    }
}

/// Lowercase and collapse whitespace.
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

struct CachedEntry {
    result: SearchResult,
    inserted_at: Instant,
    /// The result came (at least partly) from a global scan.
    global: bool,
}

pub struct SearchCache {
    entries: Mutex<LruCache<CacheKey, CachedEntry>>,
    ttl: Duration,
}

impl SearchCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<CacheKey, CachedEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached result, or `None` on a miss. Expired entries are evicted here.
    pub fn get(&self, key: &CacheKey) -> Option<SearchResult> {
        if self.ttl.is_zero() {
            return None;
        }
        let mut entries = self.entries();
        let expired = entries.get(key)?.inserted_at.elapsed() > self.ttl;
        if expired {
            entries.pop(key);
            None
        } else {
            entries.get(key).map(|e| e.result.clone())
        }
    }

    /// Store a result, evicting the least recently used entry when full.
    pub fn put(&self, key: CacheKey, result: SearchResult, global: bool) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries().put(
            key,
            CachedEntry {
                result,
                inserted_at: Instant::now(),
                global,
            },
        );
    }

    /// Drop everything a write to `slot` can make stale: results started from
    /// that slot, cursor-resolved results, and global-scan results.
    pub fn invalidate_slot(&self, slot: SlotId) -> usize {
        let mut entries = self.entries();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(k, v)| k.slot == Some(slot) || k.slot.is_none() || k.cursor || v.global)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Entries currently held (including possibly expired).
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_types::search::{SearchMeta, SearchType};

    fn result(search_type: SearchType) -> SearchResult {
        SearchResult {
            items: Vec::new(),
            meta: SearchMeta {
                search_type,
                hops: 1,
                from_cache: false,
                partial: false,
                entry_slot: None,
                visited: 0,
            },
        }
    }

    fn key(query: &str, slot: Option<SlotId>, cursor: bool) -> CacheKey {
        CacheKey::new(query, slot, 2, cursor, &[1.0, 0.0], 5, 0.3, true)
    }

    #[test]
    fn test_normalized_query_shares_key() {
        assert_eq!(
            key("Auth  Bug", Some(SlotId(0)), false),
            key("auth bug", Some(SlotId(0)), false)
        );
        assert_ne!(
            key("auth bug", Some(SlotId(0)), false),
            key("auth bug", Some(SlotId(1)), false)
        );
        let other_k = CacheKey::new("auth bug", Some(SlotId(0)), 2, false, &[1.0, 0.0], 3, 0.3, true);
        assert_ne!(key("auth bug", Some(SlotId(0)), false), other_k);
    }

    #[test]
    fn test_put_get_and_lru_bound() {
        let cache = SearchCache::new(2, Duration::from_secs(60));
        cache.put(key("a", Some(SlotId(0)), false), result(SearchType::Local), false);
        cache.put(key("b", Some(SlotId(0)), false), result(SearchType::Local), false);
        assert!(cache.get(&key("a", Some(SlotId(0)), false)).is_some());
        cache.put(key("c", Some(SlotId(0)), false), result(SearchType::Local), false);
        assert_eq!(cache.len(), 2);
        // "b" was least recently used.
        assert!(cache.get(&key("b", Some(SlotId(0)), false)).is_none());
        assert!(cache.get(&key("a", Some(SlotId(0)), false)).is_some());
    }

    #[test]
    fn test_expired_entry() {
        let cache = SearchCache::new(8, Duration::from_millis(1));
        cache.put(key("a", None, false), result(SearchType::Local), false);
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get(&key("a", None, false)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let cache = SearchCache::new(8, Duration::ZERO);
        cache.put(key("a", None, false), result(SearchType::Local), false);
        assert!(cache.get(&key("a", None, false)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_invalidate_slot() {
        let cache = SearchCache::new(8, Duration::from_secs(60));
        cache.put(key("a", Some(SlotId(0)), false), result(SearchType::Local), false);
        cache.put(key("b", Some(SlotId(1)), false), result(SearchType::Local), false);
        cache.put(key("c", Some(SlotId(1)), false), result(SearchType::LtmFallback), true);
        cache.put(key("d", Some(SlotId(2)), true), result(SearchType::Local), false);

        assert_eq!(cache.invalidate_slot(SlotId(0)), 3);
        assert!(cache.get(&key("b", Some(SlotId(1)), false)).is_some());
        assert_eq!(cache.len(), 1);
    }
}
