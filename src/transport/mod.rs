//! Seams to the remote document store.
//!
//! The feed consumer and cache only ever see these traits:
//! - [`FeedTransport`] opens a collection's continuous change feed
//! - [`ChangeStream`] yields the feed's raw bytes in arbitrary chunks
//! - [`DocumentStore`] fetches and stores documents for cache callers
//!
//! Two implementations ship with the crate: [`HttpTransport`] talks to a
//! CouchDB-compatible server, [`MemoryStore`] keeps everything in process.

mod http;
mod memory;

pub use http::{HttpChangeStream, HttpConfig, HttpTransport};
pub use memory::{ChannelStream, MemoryStore};

use crate::error::Result;
use crate::types::{Revision, Sequence};
use serde_json::Value;
use std::sync::Arc;

/// Releases a change stream's connection from any thread.
pub type CancelHandle = Arc<dyn Fn() + Send + Sync>;

/// One read from a change stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamChunk {
    /// Raw feed bytes. May end mid-line.
    Data(Vec<u8>),
    /// Nothing arrived within the transport's poll interval.
    Idle,
    /// The stream is finished.
    End,
}

/// An open change feed.
pub trait ChangeStream: Send {
    fn next_chunk(&mut self) -> Result<StreamChunk>;

    /// Release the underlying connection. Later reads return `End`.
    fn cancel(&mut self);

    /// Handle that releases the connection without access to the stream,
    /// e.g. while another thread is blocked in `next_chunk`. Calling it more
    /// than once is harmless.
    fn cancel_handle(&self) -> CancelHandle;
}

/// Opens change feeds.
pub trait FeedTransport: Send + Sync {
    /// Open a continuous feed of `collection`. `since = None` starts at the
    /// server's current position.
    fn open_change_stream(
        &self,
        collection: &str,
        since: Option<Sequence>,
    ) -> Result<Box<dyn ChangeStream>>;
}

/// Fetches and stores documents.
pub trait DocumentStore: Send + Sync {
    /// Fetch a document; `None` if it does not exist.
    fn fetch(&self, collection: &str, document_id: &str) -> Result<Option<Value>>;

    /// Create or replace a document, returning its new revision.
    fn store(&self, collection: &str, document_id: &str, value: &Value) -> Result<Revision>;
}
