//! In-process document store with a live change feed.

use super::{CancelHandle, ChangeStream, DocumentStore, FeedTransport, StreamChunk};
use crate::error::Result;
use crate::types::{Revision, Sequence};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default wait before a feed read reports `Idle`.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct StoredDoc {
    revision: Revision,
    generation: u64,
    body: Value,
    deleted: bool,
    sequence: u64,
}

#[derive(Default)]
struct Collection {
    sequence: u64,
    docs: HashMap<String, StoredDoc>,
    /// Latest change per document, keyed by sequence.
    changes: BTreeMap<u64, String>,
    feeds: BTreeMap<u64, Sender<Vec<u8>>>,
    next_feed: u64,
}

impl Collection {
    fn change_line(&self, document_id: &str) -> Option<Vec<u8>> {
        let doc = self.docs.get(document_id)?;
        let mut record = json!({
            "seq": doc.sequence,
            "id": document_id,
            "changes": [{"rev": doc.revision.as_str()}],
        });
        if doc.deleted {
            record["deleted"] = Value::Bool(true);
        }
        let mut line = serde_json::to_vec(&record).ok()?;
        line.push(b'\n');
        Some(line)
    }

    /// Send to every open feed, dropping feeds whose reader went away.
    fn broadcast(&mut self, bytes: &[u8]) {
        self.feeds.retain(|_, feed| feed.send(bytes.to_vec()).is_ok());
    }

    fn write(&mut self, document_id: &str, body: Value, deleted: bool) -> Revision {
        self.sequence += 1;
        let sequence = self.sequence;
        let generation = self
            .docs
            .get(document_id)
            .map(|doc| doc.generation + 1)
            .unwrap_or(1);
        let revision = Revision::new(format!("{}-{:016x}", generation, sequence));

        if let Some(old) = self.docs.get(document_id) {
            self.changes.remove(&old.sequence);
        }
        self.changes.insert(sequence, document_id.to_string());
        self.docs.insert(
            document_id.to_string(),
            StoredDoc {
                revision: revision.clone(),
                generation,
                body,
                deleted,
                sequence,
            },
        );

        if let Some(line) = self.change_line(document_id) {
            self.broadcast(&line);
        }
        revision
    }
}

/// Document store that lives in memory and publishes a change feed per
/// collection, in the same wire format as a CouchDB continuous feed.
///
/// Every `store` or `delete` appends one line to the feeds open on that
/// collection. Test hooks let callers end, interrupt or corrupt a feed.
pub struct MemoryStore {
    collections: Arc<Mutex<HashMap<String, Collection>>>,
    poll_interval: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// How long a feed read waits before returning `Idle`.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            collections: Arc::new(Mutex::new(HashMap::new())),
            poll_interval,
        }
    }

    /// Tombstone a document. Returns the tombstone revision, or `None` if
    /// the document does not exist.
    pub fn delete(&self, collection: &str, document_id: &str) -> Option<Revision> {
        let mut collections = self.collections.lock();
        let coll = collections.get_mut(collection)?;
        let live = matches!(coll.docs.get(document_id), Some(doc) if !doc.deleted);
        if !live {
            return None;
        }
        Some(coll.write(document_id, Value::Null, true))
    }

    /// Current sequence of a collection.
    pub fn sequence(&self, collection: &str) -> Sequence {
        let collections = self.collections.lock();
        Sequence(collections.get(collection).map(|c| c.sequence).unwrap_or(0))
    }

    /// Number of feeds currently open on a collection. Sends a heartbeat so
    /// feeds whose reader went away are pruned first.
    pub fn open_feeds(&self, collection: &str) -> usize {
        let mut collections = self.collections.lock();
        match collections.get_mut(collection) {
            Some(coll) => {
                coll.broadcast(b"\n");
                coll.feeds.len()
            }
            None => 0,
        }
    }

    /// Send raw bytes to every feed of a collection.
    pub fn inject(&self, collection: &str, bytes: &[u8]) {
        let mut collections = self.collections.lock();
        collections
            .entry(collection.to_string())
            .or_default()
            .broadcast(bytes);
    }

    /// End every feed of a collection with a `last_seq` record.
    pub fn finish_feeds(&self, collection: &str) {
        let mut collections = self.collections.lock();
        if let Some(coll) = collections.get_mut(collection) {
            let line = format!("{{\"last_seq\":{}}}\n", coll.sequence);
            coll.broadcast(line.as_bytes());
            coll.feeds.clear();
        }
    }

    /// Drop every feed of a collection without a terminal record.
    pub fn interrupt_feeds(&self, collection: &str) {
        let mut collections = self.collections.lock();
        if let Some(coll) = collections.get_mut(collection) {
            coll.feeds.clear();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn fetch(&self, collection: &str, document_id: &str) -> Result<Option<Value>> {
        let collections = self.collections.lock();
        let Some(doc) = collections
            .get(collection)
            .and_then(|coll| coll.docs.get(document_id))
        else {
            return Ok(None);
        };
        if doc.deleted {
            return Ok(None);
        }

        let mut body = doc.body.clone();
        if let Value::Object(fields) = &mut body {
            fields.insert("_id".to_string(), Value::String(document_id.to_string()));
            fields.insert(
                "_rev".to_string(),
                Value::String(doc.revision.as_str().to_string()),
            );
        }
        Ok(Some(body))
    }

    fn store(&self, collection: &str, document_id: &str, value: &Value) -> Result<Revision> {
        let mut body = value.clone();
        if let Value::Object(fields) = &mut body {
            fields.remove("_id");
            fields.remove("_rev");
        }

        let mut collections = self.collections.lock();
        let coll = collections.entry(collection.to_string()).or_default();
        let revision = coll.write(document_id, body, false);
        debug!(collection, document_id, %revision, "stored document");
        Ok(revision)
    }
}

impl FeedTransport for MemoryStore {
    fn open_change_stream(
        &self,
        collection: &str,
        since: Option<Sequence>,
    ) -> Result<Box<dyn ChangeStream>> {
        let (sender, receiver) = unbounded();

        let mut collections = self.collections.lock();
        let coll = collections.entry(collection.to_string()).or_default();

        if let Some(since) = since {
            let backlog: Vec<String> = coll
                .changes
                .range((Excluded(since.0), Unbounded))
                .map(|(_, id)| id.clone())
                .collect();
            for id in backlog {
                if let Some(line) = coll.change_line(&id) {
                    let _ = sender.send(line);
                }
            }
        }
        let feed_id = coll.next_feed;
        coll.next_feed += 1;
        coll.feeds.insert(feed_id, sender);

        // Dropping the sender disconnects the reader at once.
        let collections = Arc::downgrade(&self.collections);
        let name = collection.to_string();
        let release: CancelHandle = Arc::new(move || {
            if let Some(collections) = collections.upgrade() {
                if let Some(coll) = collections.lock().get_mut(&name) {
                    coll.feeds.remove(&feed_id);
                }
            }
        });

        Ok(Box::new(ChannelStream {
            receiver: Some(receiver),
            poll_interval: self.poll_interval,
            release,
        }))
    }
}

/// Change stream fed through a channel.
pub struct ChannelStream {
    receiver: Option<Receiver<Vec<u8>>>,
    poll_interval: Duration,
    release: CancelHandle,
}

impl ChangeStream for ChannelStream {
    fn next_chunk(&mut self) -> Result<StreamChunk> {
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(StreamChunk::End);
        };
        match receiver.recv_timeout(self.poll_interval) {
            Ok(bytes) => Ok(StreamChunk::Data(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(StreamChunk::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(StreamChunk::End),
        }
    }

    fn cancel(&mut self) {
        (self.release)();
        self.receiver = None;
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.release.clone()
    }
}
