//! # feedsync
//!
//! Keeps a local document cache consistent with a remote document store by
//! following the store's change feed.
//!
//! ## Core Concepts
//!
//! - **Feed**: newline-delimited JSON change records, framed and decoded
//!   one line at a time
//! - **Cache**: per-document entries with hit/miss accounting; invalidation
//!   removes an entry outright
//! - **Notifier**: one subscription per collection; each change invalidates
//!   every registered cache before any listener is told
//! - **Transport**: the HTTP (or in-memory) side the core talks to through
//!   traits
//!
//! ## Example
//!
//! ```ignore
//! use feedsync::{CachedDocuments, ChangeNotifier, HttpConfig, HttpTransport, MemoryCache};
//!
//! let http = Arc::new(HttpTransport::new(HttpConfig::new("http://localhost:5984/"))?);
//! let cache = Arc::new(MemoryCache::new());
//!
//! let notifier = ChangeNotifier::new(http.clone(), "test");
//! notifier.add_cache(cache.clone());
//! notifier.start()?;
//!
//! let docs = CachedDocuments::new(http, cache);
//! let doc = docs.open_doc("test", "some-id")?;
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod feed;
pub mod listener;
pub mod notifier;
pub mod transport;
pub mod types;

// Re-exports
pub use cache::{CacheConfig, CacheMetrics, DocumentCache, MemoryCache};
pub use client::CachedDocuments;
pub use error::{DecodeError, FeedError, Result};
pub use feed::{decode_line, ChangeReceiver, DecodedLine, LineFramer, LineOutcome, TerminalPolicy};
pub use listener::{ChangeListener, ChannelListener, CloseReason, ListenerHandle, Notification};
pub use notifier::{ChangeNotifier, NotifierConfig, NotifierState, NotifierStats};
pub use transport::{
    CancelHandle, ChangeStream, ChannelStream, DocumentStore, FeedTransport, HttpChangeStream,
    HttpConfig, HttpTransport, MemoryStore, StreamChunk,
};
pub use types::*;
