//! Line-at-a-time consumer that dispatches decoded events to subscribers.

use super::decoder::{decode_line, DecodedLine};
use crate::error::{DecodeError, FeedError, Result};
use crate::listener::ChangeListener;
use crate::types::{ChangeRecord, Sequence};
use std::sync::Arc;
use tracing::{debug, warn};

/// What to do when a `last_seq` record arrives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TerminalPolicy {
    /// Close the receiver; any later record is a protocol violation.
    #[default]
    Close,
    /// Remember the sequence and keep accepting records. For replaying
    /// captured feed logs that span several feed sessions.
    Record,
}

/// Result of feeding one line to the receiver.
#[derive(Debug)]
pub enum LineOutcome {
    /// Blank heartbeat line.
    Skipped,
    /// An event was delivered to every subscriber. `failures` lists the
    /// subscribers that returned an error, in registration order.
    Dispatched {
        sequence: Sequence,
        failures: Vec<FeedError>,
    },
    /// The terminal record was seen.
    Terminal { last_sequence: Sequence },
    /// The line could not be decoded. Nothing was dispatched.
    Malformed(DecodeError),
}

/// Consumes feed lines in order and forwards events to subscribers.
pub struct ChangeReceiver {
    subscribers: Vec<Arc<dyn ChangeListener>>,
    policy: TerminalPolicy,
    events: u64,
    last_sequence: Option<Sequence>,
    closed: bool,
}

impl ChangeReceiver {
    pub fn new() -> Self {
        Self::with_policy(TerminalPolicy::Close)
    }

    pub fn with_policy(policy: TerminalPolicy) -> Self {
        Self {
            subscribers: Vec::new(),
            policy,
            events: 0,
            last_sequence: None,
            closed: false,
        }
    }

    /// Register a subscriber. Subscribers are called in registration order.
    pub fn subscribe(&mut self, subscriber: Arc<dyn ChangeListener>) {
        self.subscribers.push(subscriber);
    }

    /// Number of events dispatched so far.
    pub fn event_count(&self) -> u64 {
        self.events
    }

    /// Sequence of the last event or terminal record seen.
    pub fn last_sequence(&self) -> Option<Sequence> {
        self.last_sequence
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Process the next line of the feed.
    ///
    /// Every subscriber has returned from `changed` before this returns.
    /// Returns `Err(ProtocolViolation)` for a record after the receiver closed;
    /// heartbeats after closure are ignored.
    pub fn line_received(&mut self, line: &str) -> Result<LineOutcome> {
        let decoded = decode_line(line);

        if self.closed && !matches!(decoded, DecodedLine::Blank) {
            return Err(FeedError::ProtocolViolation(format!(
                "record after last_seq {}",
                self.last_sequence.unwrap_or_default()
            )));
        }

        match decoded {
            DecodedLine::Blank => Ok(LineOutcome::Skipped),
            DecodedLine::Malformed(e) => {
                warn!(error = %e, "malformed change record");
                Ok(LineOutcome::Malformed(e))
            }
            DecodedLine::Record(ChangeRecord::Terminal { last_sequence }) => {
                debug!(%last_sequence, "feed terminal record");
                self.last_sequence = Some(last_sequence);
                if self.policy == TerminalPolicy::Close {
                    self.closed = true;
                }
                Ok(LineOutcome::Terminal { last_sequence })
            }
            DecodedLine::Record(ChangeRecord::Event(event)) => {
                self.events += 1;
                self.last_sequence = Some(event.sequence);

                let mut failures = Vec::new();
                for (index, subscriber) in self.subscribers.iter().enumerate() {
                    if let Err(e) = subscriber.changed(&event) {
                        warn!(observer = index, error = %e, "subscriber failed");
                        failures.push(FeedError::ObserverFailed {
                            observer: format!("subscriber #{}", index),
                            message: e.to_string(),
                        });
                    }
                }

                debug!(sequence = %event.sequence, id = %event.document_id, "dispatched change");
                Ok(LineOutcome::Dispatched {
                    sequence: event.sequence,
                    failures,
                })
            }
        }
    }
}

impl Default for ChangeReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeEvent;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeListener {
        changes: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeListener for FakeListener {
        fn changed(&self, event: &ChangeEvent) -> Result<()> {
            self.changes.lock().push(event.clone());
            Ok(())
        }
    }

    struct FailingListener;

    impl ChangeListener for FailingListener {
        fn changed(&self, _event: &ChangeEvent) -> Result<()> {
            Err(FeedError::InvalidOperation("boom".into()))
        }
    }

    fn line(seq: u64, id: &str) -> String {
        format!(r#"{{"seq":{},"id":"{}","changes":[{{"rev":"1-a"}}]}}"#, seq, id)
    }

    #[test]
    fn test_events_then_terminal() {
        let listener = Arc::new(FakeListener::default());
        let mut receiver = ChangeReceiver::new();
        receiver.subscribe(listener.clone());

        for seq in 1..=5 {
            receiver.line_received(&line(seq, "doc")).unwrap();
        }
        let outcome = receiver.line_received(r#"{"last_seq":5}"#).unwrap();
        assert!(matches!(
            outcome,
            LineOutcome::Terminal {
                last_sequence: Sequence(5)
            }
        ));
        assert!(receiver.is_closed());

        let err = receiver.line_received(&line(6, "late")).unwrap_err();
        assert!(matches!(err, FeedError::ProtocolViolation(_)));

        let changes = listener.changes.lock();
        let seqs: Vec<u64> = changes.iter().map(|c| c.sequence.0).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(receiver.event_count(), 5);
    }

    #[test]
    fn test_heartbeat_after_terminal_is_ignored() {
        let mut receiver = ChangeReceiver::new();
        receiver.line_received(r#"{"last_seq":1}"#).unwrap();
        assert!(matches!(
            receiver.line_received("").unwrap(),
            LineOutcome::Skipped
        ));
    }

    #[test]
    fn test_record_policy_keeps_dispatching() {
        let listener = Arc::new(FakeListener::default());
        let mut receiver = ChangeReceiver::with_policy(TerminalPolicy::Record);
        receiver.subscribe(listener.clone());

        receiver.line_received(r#"{"last_seq":3}"#).unwrap();
        receiver.line_received(&line(4, "after")).unwrap();

        assert!(!receiver.is_closed());
        assert_eq!(listener.changes.lock().len(), 1);
        assert_eq!(receiver.last_sequence(), Some(Sequence(4)));
    }

    #[test]
    fn test_malformed_is_reported_not_dispatched() {
        let listener = Arc::new(FakeListener::default());
        let mut receiver = ChangeReceiver::new();
        receiver.subscribe(listener.clone());

        let outcome = receiver.line_received("{\"seq\":").unwrap();
        assert!(matches!(outcome, LineOutcome::Malformed(_)));
        receiver.line_received(&line(2, "ok")).unwrap();

        assert_eq!(listener.changes.lock().len(), 1);
        assert_eq!(receiver.event_count(), 1);
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let first = Arc::new(FakeListener::default());
        let last = Arc::new(FakeListener::default());
        let mut receiver = ChangeReceiver::new();
        receiver.subscribe(first.clone());
        receiver.subscribe(Arc::new(FailingListener));
        receiver.subscribe(last.clone());

        match receiver.line_received(&line(1, "doc")).unwrap() {
            LineOutcome::Dispatched { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(
                    &failures[0],
                    FeedError::ObserverFailed { observer, .. } if observer == "subscriber #1"
                ));
            }
            other => panic!("Expected Dispatched, got {:?}", other),
        }
        assert_eq!(first.changes.lock().len(), 1);
        assert_eq!(last.changes.lock().len(), 1);
    }
}
