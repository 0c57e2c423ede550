//! Observer interface for decoded change events.

use crate::error::{FeedError, Result};
use crate::types::{ChangeEvent, Sequence};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Receives change events in feed order.
///
/// `changed` is called synchronously on the feed's reader thread; the next
/// line is not read until every registered observer has returned.
pub trait ChangeListener: Send + Sync {
    fn changed(&self, event: &ChangeEvent) -> Result<()>;

    /// A malformed record or a failing observer was seen. The feed continues
    /// unless the notifier's policy says otherwise.
    fn feed_error(&self, _error: &FeedError) {}

    /// The subscription is closed; no further callbacks follow.
    fn closed(&self, _reason: &CloseReason) {}
}

/// Why a subscription ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    /// The server sent its `last_seq` record.
    Terminal { last_sequence: Sequence },
    /// `stop()` was called.
    Stopped,
    /// The stream ended or failed before a terminal record.
    TransportInterrupted { message: String },
    /// A record arrived after the terminal record.
    ProtocolViolation { message: String },
    /// A malformed record was seen while configured to abort on it.
    MalformedRecord { message: String },
}

impl CloseReason {
    /// Whether the close was caused by a fault rather than a normal end.
    pub fn is_error(&self) -> bool {
        !matches!(self, CloseReason::Terminal { .. } | CloseReason::Stopped)
    }
}

/// Notification forwarded by a [`ChannelListener`].
#[derive(Clone, Debug)]
pub enum Notification {
    Changed(ChangeEvent),
    Error(String),
    Closed(CloseReason),
}

/// Listener that forwards everything into a channel.
///
/// With a bounded capacity, a full channel makes `changed` fail, which the
/// dispatcher reports as a per-observer failure. One slot past the capacity
/// is kept for `Closed`, so the close reason always reaches the handle.
pub struct ChannelListener {
    sender: Sender<Notification>,
    /// Bound on changes and errors (None = unbounded).
    capacity: Option<usize>,
}

/// Receiving side of a [`ChannelListener`].
pub struct ListenerHandle {
    pub receiver: Receiver<Notification>,
}

impl ChannelListener {
    pub fn new() -> (Self, ListenerHandle) {
        let (sender, receiver) = unbounded();
        let listener = Self {
            sender,
            capacity: None,
        };
        (listener, ListenerHandle { receiver })
    }

    pub fn with_capacity(capacity: usize) -> (Self, ListenerHandle) {
        let (sender, receiver) = bounded(capacity.saturating_add(1));
        let listener = Self {
            sender,
            capacity: Some(capacity),
        };
        (listener, ListenerHandle { receiver })
    }

    /// Whether a change or error fits without touching the close slot.
    fn has_room(&self) -> bool {
        self.capacity.map_or(true, |capacity| self.sender.len() < capacity)
    }
}

impl ChangeListener for ChannelListener {
    fn changed(&self, event: &ChangeEvent) -> Result<()> {
        if !self.has_room() {
            return Err(FeedError::InvalidOperation(
                "listener buffer full".to_string(),
            ));
        }
        match self.sender.try_send(Notification::Changed(event.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(FeedError::InvalidOperation(
                "listener buffer full".to_string(),
            )),
            Err(TrySendError::Disconnected(_)) => Err(FeedError::InvalidOperation(
                "listener handle dropped".to_string(),
            )),
        }
    }

    fn feed_error(&self, error: &FeedError) {
        if !self.has_room() {
            warn!(%error, "listener buffer full, feed error dropped");
            return;
        }
        if let Err(TrySendError::Full(_)) =
            self.sender.try_send(Notification::Error(error.to_string()))
        {
            warn!(%error, "listener buffer full, feed error dropped");
        }
    }

    fn closed(&self, reason: &CloseReason) {
        // Only a previous close left unread can occupy the reserved slot.
        if let Err(TrySendError::Full(_)) =
            self.sender.try_send(Notification::Closed(reason.clone()))
        {
            warn!(?reason, "listener buffer full, close notification dropped");
        }
    }
}

impl ListenerHandle {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> std::result::Result<Notification, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Notification, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Notification, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
