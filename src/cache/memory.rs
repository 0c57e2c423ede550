//! In-process document cache with hit/miss accounting.

use super::{CacheConfig, CacheMetrics, DocumentCache};
use crate::error::Result;
use crate::types::DocKey;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

struct Inner {
    entries: LruCache<DocKey, Value>,
    lookups: u64,
    hits: u64,
    invalidations: u64,
    evictions: u64,
}

impl Inner {
    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            lookups: self.lookups,
            hits: self.hits,
            cached: self.entries.len(),
            invalidations: self.invalidations,
            evictions: self.evictions,
        }
    }
}

/// Document cache keyed by collection and document id.
///
/// Entries and counters live behind one lock, so every metrics snapshot is
/// consistent with the entries at that instant. Invalidated entries are
/// removed, never marked stale.
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    /// Create an unbounded cache.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let entries = match config.capacity {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            inner: Mutex::new(Inner {
                entries,
                lookups: 0,
                hits: 0,
                invalidations: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up a document. Always counts as a lookup; counts as a hit only
    /// when a live entry exists.
    pub fn lookup(&self, key: &DocKey) -> Option<Value> {
        let mut inner = self.inner.lock();
        inner.lookups += 1;
        let value = inner.entries.get(key).cloned();
        if value.is_some() {
            inner.hits += 1;
        }
        trace!(%key, hit = value.is_some(), "cache lookup");
        value
    }

    /// Store a freshly fetched document, replacing any previous entry.
    pub fn fill(&self, key: DocKey, value: Value) {
        let mut inner = self.inner.lock();
        if let Some((old_key, _)) = inner.entries.push(key.clone(), value) {
            if old_key != key {
                inner.evictions += 1;
                trace!(key = %old_key, "cache eviction");
            }
        }
        trace!(%key, "cache fill");
    }

    /// Remove an entry. Returns whether one was present; absent keys are a
    /// no-op.
    pub fn invalidate(&self, key: &DocKey) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.entries.pop(key).is_some();
        if removed {
            inner.invalidations += 1;
            trace!(%key, "cache invalidate");
        }
        removed
    }

    /// Remove every entry of a collection. Returns the number removed.
    pub fn invalidate_collection(&self, collection: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<DocKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.collection == collection)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            inner.entries.pop(key);
        }
        inner.invalidations += keys.len() as u64;
        keys.len()
    }

    /// Drop all entries. Counters other than `cached` are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let count = inner.entries.len() as u64;
        inner.entries.clear();
        inner.invalidations += count;
    }

    /// Whether a live entry exists. Does not count as a lookup.
    pub fn contains(&self, key: &DocKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.inner.lock().snapshot()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentCache for MemoryCache {
    fn lookup(&self, key: &DocKey) -> Option<Value> {
        MemoryCache::lookup(self, key)
    }

    fn fill(&self, key: DocKey, value: Value) {
        MemoryCache::fill(self, key, value)
    }

    fn invalidate(&self, key: &DocKey) -> Result<bool> {
        Ok(MemoryCache::invalidate(self, key))
    }

    fn invalidate_collection(&self, collection: &str) -> Result<usize> {
        Ok(MemoryCache::invalidate_collection(self, collection))
    }

    fn metrics(&self) -> CacheMetrics {
        MemoryCache::metrics(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::num::NonZeroUsize;

    fn key(id: &str) -> DocKey {
        DocKey::new("test", id)
    }

    #[test]
    fn test_fill_then_lookup() {
        let cache = MemoryCache::new();
        cache.fill(key("first"), json!({"key": "value"}));

        assert_eq!(cache.lookup(&key("first")), Some(json!({"key": "value"})));
        let m = cache.metrics();
        assert_eq!((m.lookups, m.hits, m.cached), (1, 1, 1));
    }

    #[test]
    fn test_miss_counts_lookup_only() {
        let cache = MemoryCache::new();
        assert_eq!(cache.lookup(&key("nope")), None);
        let m = cache.metrics();
        assert_eq!((m.lookups, m.hits, m.cached), (1, 0, 0));
    }

    #[test]
    fn test_cache_scenario() {
        // first: miss + fill, hit; second: miss + fill.
        let cache = MemoryCache::new();

        assert!(cache.lookup(&key("first")).is_none());
        cache.fill(key("first"), json!({"key": "value"}));
        assert_eq!(cache.lookup(&key("first")).unwrap()["key"], "value");
        assert!(cache.lookup(&key("second")).is_none());
        cache.fill(key("second"), json!({"lock": "chain"}));

        let m = cache.metrics();
        assert_eq!(m.lookups, 3);
        assert_eq!(m.hits, 1);
        assert_eq!(m.cached, 2);
    }

    #[test]
    fn test_overwrite_keeps_count() {
        let cache = MemoryCache::new();
        cache.fill(key("a"), json!(1));
        cache.fill(key("a"), json!(2));
        assert_eq!(cache.metrics().cached, 1);
        assert_eq!(cache.metrics().evictions, 0);
        assert_eq!(cache.lookup(&key("a")), Some(json!(2)));
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = MemoryCache::new();
        cache.fill(key("a"), json!(1));
        cache.fill(key("b"), json!(2));

        assert!(cache.invalidate(&key("a")));
        assert_eq!(cache.metrics().cached, 1);
        assert!(cache.lookup(&key("a")).is_none());

        // Idempotent.
        assert!(!cache.invalidate(&key("a")));
        assert_eq!(cache.metrics().cached, 1);
        assert_eq!(cache.metrics().invalidations, 1);
    }

    #[test]
    fn test_collections_are_separate_keys() {
        let cache = MemoryCache::new();
        cache.fill(DocKey::new("one", "x"), json!(1));
        cache.fill(DocKey::new("two", "x"), json!(2));

        cache.invalidate(&DocKey::new("one", "x"));
        assert!(cache.contains(&DocKey::new("two", "x")));

        cache.fill(DocKey::new("two", "y"), json!(3));
        assert_eq!(cache.invalidate_collection("two"), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_instances_do_not_share_counters() {
        let a = MemoryCache::new();
        let b = MemoryCache::new();
        a.lookup(&key("x"));
        assert_eq!(a.metrics().lookups, 1);
        assert_eq!(b.metrics().lookups, 0);
    }

    #[test]
    fn test_bounded_cache_evicts_least_recent() {
        let cache = MemoryCache::with_config(CacheConfig::default().with_capacity(2));
        cache.fill(key("a"), json!(1));
        cache.fill(key("b"), json!(2));
        cache.lookup(&key("a"));
        cache.fill(key("c"), json!(3));

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        let m = cache.metrics();
        assert_eq!(m.cached, 2);
        assert_eq!(m.evictions, 1);
        assert_eq!(CacheConfig::default().with_capacity(0).capacity, None);
        assert_eq!(
            CacheConfig::default().with_capacity(5).capacity,
            NonZeroUsize::new(5)
        );
    }

    #[derive(Clone, Debug)]
    enum Op {
        Lookup(u8),
        Fill(u8),
        Invalidate(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Lookup),
            (0u8..6).prop_map(Op::Fill),
            (0u8..6).prop_map(Op::Invalidate),
        ]
    }

    proptest! {
        #[test]
        fn prop_metrics_track_live_entries(ops in proptest::collection::vec(op(), 0..64)) {
            let cache = MemoryCache::new();
            let mut live = HashSet::new();
            let mut lookups = 0u64;

            for op in ops {
                match op {
                    Op::Lookup(k) => {
                        lookups += 1;
                        let hit = cache.lookup(&key(&k.to_string())).is_some();
                        prop_assert_eq!(hit, live.contains(&k));
                    }
                    Op::Fill(k) => {
                        cache.fill(key(&k.to_string()), json!(k));
                        live.insert(k);
                    }
                    Op::Invalidate(k) => {
                        let before = cache.metrics().cached;
                        let removed = cache.invalidate(&key(&k.to_string()));
                        prop_assert_eq!(removed, live.remove(&k));
                        let expected = if removed { before - 1 } else { before };
                        prop_assert_eq!(cache.metrics().cached, expected);
                    }
                }

                let m = cache.metrics();
                prop_assert!(m.hits <= m.lookups);
                prop_assert_eq!(m.lookups, lookups);
                prop_assert_eq!(m.cached, live.len());
            }
        }
    }
}
