//! Configuration and state types for the change notifier.

use crate::listener::CloseReason;
use crate::types::Sequence;
use serde::{Deserialize, Serialize};

/// Configuration for a [`ChangeNotifier`](super::ChangeNotifier).
#[derive(Clone, Debug, Default)]
pub struct NotifierConfig {
    /// Default starting sequence for `start()` (None = from now).
    pub since: Option<Sequence>,

    /// Close the subscription on the first malformed record instead of
    /// reporting it and reading on.
    /// Default: false
    pub abort_on_malformed: bool,

    /// Name of the reader thread.
    /// Default: "feedsync-<collection>"
    pub thread_name: Option<String>,
}

impl NotifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_since(mut self, since: Sequence) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_abort_on_malformed(mut self, abort: bool) -> Self {
        self.abort_on_malformed = abort;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }
}

/// Lifecycle of a notifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NotifierState {
    Idle,
    Subscribed,
    Closed { reason: CloseReason },
}

impl NotifierState {
    pub fn is_active(&self) -> bool {
        matches!(self, NotifierState::Subscribed)
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            NotifierState::Closed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Counters for one notifier, across restarts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierStats {
    /// Events dispatched to observers.
    pub events: u64,
    /// Malformed records seen.
    pub malformed: u64,
    /// Individual cache or listener failures.
    pub observer_failures: u64,
    /// Subscriptions opened.
    pub subscriptions: u64,
}
