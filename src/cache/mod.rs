//! Document caches invalidated by the change feed.

mod memory;

pub use memory::MemoryCache;

use crate::error::Result;
use crate::types::DocKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroUsize;

/// Configuration for a [`MemoryCache`].
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    /// Maximum number of entries (None = unbounded).
    /// Past the bound the least recently used entry is evicted.
    pub capacity: Option<NonZeroUsize>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the cache; 0 means unbounded.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = NonZeroUsize::new(capacity);
        self
    }
}

/// Point-in-time cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Every lookup attempt.
    pub lookups: u64,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Live entries.
    pub cached: usize,
    /// Entries removed by invalidation.
    pub invalidations: u64,
    /// Entries removed by the capacity bound.
    pub evictions: u64,
}

impl CacheMetrics {
    pub fn misses(&self) -> u64 {
        self.lookups - self.hits
    }

    pub fn hit_ratio(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

/// A cache the change notifier can invalidate.
///
/// `invalidate` is fallible so caches backed by something other than local
/// memory can report failures; the notifier reports them per cache and keeps
/// dispatching to the rest.
pub trait DocumentCache: Send + Sync {
    fn lookup(&self, key: &DocKey) -> Option<Value>;

    fn fill(&self, key: DocKey, value: Value);

    fn invalidate(&self, key: &DocKey) -> Result<bool>;

    fn invalidate_collection(&self, collection: &str) -> Result<usize>;

    fn metrics(&self) -> CacheMetrics;
}
