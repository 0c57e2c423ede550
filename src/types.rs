//! Core types shared by the feed consumer and the cache.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in a collection's change feed.
///
/// Only the relative order of two sequences is meaningful.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    /// Parse the string form of a sequence.
    ///
    /// Accepts plain decimal digits (`"3934"`) and the clustered form
    /// `"<digits>-<opaque>"`, whose numeric prefix is the ordering key.
    pub fn parse(s: &str) -> Option<Self> {
        let digits = match s.split_once('-') {
            Some((prefix, _)) => prefix,
            None => s,
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(Sequence)
    }

    /// Decode from the JSON value of a `seq` or `last_seq` field.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_u64().map(Sequence),
            serde_json::Value::String(s) => Self::parse(s),
            _ => None,
        }
    }
}

/// Identifier of one version of a document.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(pub String);

impl Revision {
    pub fn new(rev: impl Into<String>) -> Self {
        Revision(rev.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric generation prefix (`"12-7bfd..."` → 12), if present.
    pub fn generation(&self) -> Option<u64> {
        self.0.split_once('-').and_then(|(n, _)| n.parse().ok())
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rev({})", self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache key: a document within a collection.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: String,
    pub document_id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document_id: document_id.into(),
        }
    }
}

impl fmt::Debug for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocKey({}/{})", self.collection, self.document_id)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.document_id)
    }
}

/// One change notification decoded from the feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub sequence: Sequence,
    pub document_id: String,
    /// Current leaf revisions after the change. Never empty.
    pub revisions: Vec<Revision>,
    /// True if the change is a tombstone.
    pub deleted: bool,
}

impl ChangeEvent {
    /// More than one leaf revision means an unresolved conflict.
    pub fn is_conflicted(&self) -> bool {
        self.revisions.len() > 1
    }

    /// The cache key this event affects in `collection`.
    pub fn key(&self, collection: &str) -> DocKey {
        DocKey::new(collection, self.document_id.clone())
    }
}

/// A decoded feed record.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeRecord {
    Event(ChangeEvent),
    /// End of feed; carries the server's last sequence.
    Terminal { last_sequence: Sequence },
}
