//! Change notifier: keeps caches in step with a collection's change feed.
//!
//! A [`ChangeNotifier`] owns one feed subscription:
//! - `Idle → Subscribed` on `start()`
//! - `Subscribed → Closed` on the terminal record, transport end, a protocol
//!   violation or `stop()`
//!
//! Every event invalidates the document in all registered caches before any
//! listener sees it.
//!
//! # Example
//!
//! ```ignore
//! let transport = Arc::new(HttpTransport::new(HttpConfig::new("http://localhost:5984/"))?);
//! let cache = Arc::new(MemoryCache::new());
//!
//! let notifier = ChangeNotifier::new(transport, "test");
//! notifier.add_cache(cache.clone());
//! notifier.start()?;
//!
//! // Later reads through `cache` never see a document the feed reported
//! // as changed.
//! ```

mod manager;
mod types;

pub use manager::ChangeNotifier;
pub use types::{NotifierConfig, NotifierState, NotifierStats};
