//! Read-through document access over a store and a shared cache.

use crate::cache::DocumentCache;
use crate::error::Result;
use crate::transport::DocumentStore;
use crate::types::{DocKey, Revision};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Reads documents through a cache, fetching and filling on a miss.
///
/// Writes go straight to the store and leave the cache alone: the change
/// feed reports the write, and a [`ChangeNotifier`](crate::ChangeNotifier)
/// sharing the same cache invalidates the entry.
///
/// A fetch that races an invalidation may fill a value that is already
/// superseded; the next change for that document removes it again.
#[derive(Clone)]
pub struct CachedDocuments {
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn DocumentCache>,
}

impl CachedDocuments {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<dyn DocumentCache>) -> Self {
        Self { store, cache }
    }

    /// Open a document, from the cache when possible.
    pub fn open_doc(&self, collection: &str, document_id: &str) -> Result<Option<Value>> {
        let key = DocKey::new(collection, document_id);
        if let Some(value) = self.cache.lookup(&key) {
            return Ok(Some(value));
        }

        let fetched = self.store.fetch(collection, document_id)?;
        if let Some(value) = &fetched {
            debug!(%key, "cache fill after fetch");
            self.cache.fill(key, value.clone());
        }
        Ok(fetched)
    }

    /// Save a document and return its new revision.
    pub fn save_doc(&self, collection: &str, document_id: &str, value: &Value) -> Result<Revision> {
        self.store.store(collection, document_id, value)
    }

    pub fn cache(&self) -> &Arc<dyn DocumentCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}
