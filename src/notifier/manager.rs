//! Change notifier: one feed subscription wired to caches and listeners.

use super::types::{NotifierConfig, NotifierState, NotifierStats};
use crate::cache::DocumentCache;
use crate::error::{FeedError, Result};
use crate::feed::{ChangeReceiver, LineFramer, LineOutcome};
use crate::listener::{ChangeListener, CloseReason};
use crate::transport::{CancelHandle, ChangeStream, FeedTransport, StreamChunk};
use crate::types::{ChangeEvent, Sequence};
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// State shared between the notifier handle and its reader thread.
struct Shared {
    collection: String,
    caches: RwLock<Vec<Arc<dyn DocumentCache>>>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    /// Held for each dispatch, report and close. Reentrant so an observer
    /// may call `stop()` from inside its callback.
    dispatch: ReentrantMutex<()>,
    /// Bumped when a subscription opens or closes. A reader only calls
    /// observers while its generation is current.
    generation: AtomicU64,
    state: Mutex<NotifierState>,
    state_changed: Condvar,
    /// Releases the open subscription's transport resource.
    cancel: Mutex<Option<CancelHandle>>,
    last_seen: Mutex<Option<Sequence>>,
    events: AtomicU64,
    malformed: AtomicU64,
    observer_failures: AtomicU64,
    subscriptions: AtomicU64,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn caches(&self) -> Vec<Arc<dyn DocumentCache>> {
        self.caches.read().clone()
    }

    fn listeners(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.listeners.read().clone()
    }

    /// Invalidate the event's document in every cache, then hand the event
    /// to every listener. Registration order throughout.
    fn dispatch(&self, generation: u64, event: &ChangeEvent) {
        let _guard = self.dispatch.lock();
        if !self.is_current(generation) {
            return;
        }
        *self.last_seen.lock() = Some(event.sequence);

        let key = event.key(&self.collection);
        let mut failures = Vec::new();

        for (index, cache) in self.caches().iter().enumerate() {
            if !self.is_current(generation) {
                return;
            }
            if let Err(e) = cache.invalidate(&key) {
                failures.push(FeedError::ObserverFailed {
                    observer: format!("cache #{}", index),
                    message: e.to_string(),
                });
            }
        }

        for (index, listener) in self.listeners().iter().enumerate() {
            if !self.is_current(generation) {
                return;
            }
            if let Err(e) = listener.changed(event) {
                failures.push(FeedError::ObserverFailed {
                    observer: format!("listener #{}", index),
                    message: e.to_string(),
                });
            }
        }

        self.events.fetch_add(1, Ordering::SeqCst);
        debug!(
            collection = %self.collection,
            sequence = %event.sequence,
            id = %event.document_id,
            deleted = event.deleted,
            "change dispatched"
        );

        for failure in &failures {
            warn!(collection = %self.collection, error = %failure, "observer failed");
            self.observer_failures.fetch_add(1, Ordering::SeqCst);
            self.report(generation, failure);
        }
    }

    /// Pass a non-fatal error to every listener.
    fn report(&self, generation: u64, error: &FeedError) {
        let _guard = self.dispatch.lock();
        for listener in self.listeners() {
            if !self.is_current(generation) {
                return;
            }
            listener.feed_error(error);
        }
    }

    /// Close the subscription `generation` if it is still the active one.
    fn close(&self, generation: u64, reason: CloseReason) -> bool {
        let _guard = self.dispatch.lock();
        {
            let mut state = self.state.lock();
            if !self.is_current(generation) || !state.is_active() {
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            *state = NotifierState::Closed {
                reason: reason.clone(),
            };
        }

        // The reader may be blocked in the transport; release it from here.
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }

        if reason.is_error() {
            warn!(collection = %self.collection, ?reason, "change feed closed");
        } else {
            info!(collection = %self.collection, ?reason, "change feed closed");
        }

        for listener in self.listeners() {
            listener.closed(&reason);
        }
        self.state_changed.notify_all();
        true
    }
}

/// Receiver subscriber that forwards into the notifier's dispatch.
struct Dispatcher {
    shared: Arc<Shared>,
    generation: u64,
}

impl ChangeListener for Dispatcher {
    fn changed(&self, event: &ChangeEvent) -> Result<()> {
        self.shared.dispatch(self.generation, event);
        Ok(())
    }
}

/// Body of the reader thread: one subscription, read to its end.
struct Reader {
    shared: Arc<Shared>,
    generation: u64,
    stream: Box<dyn ChangeStream>,
    abort_on_malformed: bool,
}

impl Reader {
    fn run(mut self) {
        let reason = self.read_until_closed();
        self.stream.cancel();
        if let Some(reason) = reason {
            self.shared.close(self.generation, reason);
        }
        debug!(collection = %self.shared.collection, "feed reader exited");
    }

    /// Returns the close reason, or `None` if the subscription was stopped
    /// from outside.
    fn read_until_closed(&mut self) -> Option<CloseReason> {
        let mut framer = LineFramer::new();
        let mut receiver = ChangeReceiver::new();
        receiver.subscribe(Arc::new(Dispatcher {
            shared: self.shared.clone(),
            generation: self.generation,
        }));

        loop {
            if !self.shared.is_current(self.generation) {
                return None;
            }

            let bytes = match self.stream.next_chunk() {
                Ok(StreamChunk::Data(bytes)) => bytes,
                Ok(StreamChunk::Idle) => continue,
                Ok(StreamChunk::End) => {
                    let dropped = framer.finish();
                    return Some(CloseReason::TransportInterrupted {
                        message: format!(
                            "stream ended before last_seq ({} bytes of partial line dropped)",
                            dropped
                        ),
                    });
                }
                Err(e) => {
                    return Some(CloseReason::TransportInterrupted {
                        message: e.to_string(),
                    })
                }
            };

            for line in framer.push(&bytes) {
                if !self.shared.is_current(self.generation) {
                    return None;
                }
                match receiver.line_received(&line) {
                    Ok(LineOutcome::Malformed(e)) => {
                        self.shared.malformed.fetch_add(1, Ordering::SeqCst);
                        let error = FeedError::MalformedRecord(e);
                        self.shared.report(self.generation, &error);
                        if self.abort_on_malformed {
                            return Some(CloseReason::MalformedRecord {
                                message: error.to_string(),
                            });
                        }
                    }
                    Ok(LineOutcome::Terminal { last_sequence }) => {
                        if self.shared.is_current(self.generation) {
                            *self.shared.last_seen.lock() = Some(last_sequence);
                        }
                    }
                    Ok(LineOutcome::Dispatched { .. }) | Ok(LineOutcome::Skipped) => {}
                    Err(e) => {
                        self.shared.report(self.generation, &e);
                        return Some(CloseReason::ProtocolViolation {
                            message: e.to_string(),
                        });
                    }
                }
            }

            // Lines after last_seq in the same read were checked above.
            if receiver.is_closed() {
                return Some(CloseReason::Terminal {
                    last_sequence: receiver.last_sequence().unwrap_or_default(),
                });
            }
        }
    }
}

/// Watches one collection's change feed and keeps caches consistent with it.
///
/// Each event first invalidates the affected document in every registered
/// cache, then reaches every registered listener, so a listener that looks
/// the document up again always misses. Events are handled one at a time on
/// a dedicated reader thread.
///
/// The notifier never reconnects by itself: after a close, inspect
/// [`close_reason`](Self::close_reason) and call
/// [`start_from`](Self::start_from) with the last seen sequence to resume.
pub struct ChangeNotifier {
    transport: Arc<dyn FeedTransport>,
    config: NotifierConfig,
    shared: Arc<Shared>,
}

impl ChangeNotifier {
    pub fn new(transport: Arc<dyn FeedTransport>, collection: impl Into<String>) -> Self {
        Self::with_config(transport, collection, NotifierConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn FeedTransport>,
        collection: impl Into<String>,
        config: NotifierConfig,
    ) -> Self {
        Self {
            transport,
            config,
            shared: Arc::new(Shared {
                collection: collection.into(),
                caches: RwLock::new(Vec::new()),
                listeners: RwLock::new(Vec::new()),
                dispatch: ReentrantMutex::new(()),
                generation: AtomicU64::new(0),
                state: Mutex::new(NotifierState::Idle),
                state_changed: Condvar::new(),
                cancel: Mutex::new(None),
                last_seen: Mutex::new(None),
                events: AtomicU64::new(0),
                malformed: AtomicU64::new(0),
                observer_failures: AtomicU64::new(0),
                subscriptions: AtomicU64::new(0),
            }),
        }
    }

    pub fn collection(&self) -> &str {
        &self.shared.collection
    }

    /// Register a cache to invalidate. Takes effect from the next event.
    pub fn add_cache(&self, cache: Arc<dyn DocumentCache>) {
        self.shared.caches.write().push(cache);
    }

    /// Register a listener. Takes effect from the next event.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Subscribe from the configured starting sequence.
    pub fn start(&self) -> Result<()> {
        self.start_from(self.config.since)
    }

    /// Subscribe from `since` (None = from now).
    ///
    /// Returns once the feed is open; events are then delivered on the
    /// reader thread. Fails if already subscribed. Calling this on a closed
    /// notifier opens a fresh subscription.
    pub fn start_from(&self, since: Option<Sequence>) -> Result<()> {
        let _guard = self.shared.dispatch.lock();
        if self.shared.state.lock().is_active() {
            return Err(FeedError::AlreadyStarted(self.shared.collection.clone()));
        }

        let stream = self
            .transport
            .open_change_stream(&self.shared.collection, since)?;

        let cancel = stream.cancel_handle();
        *self.shared.cancel.lock() = Some(cancel.clone());
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = std::mem::replace(&mut *self.shared.state.lock(), NotifierState::Subscribed);
        *self.shared.last_seen.lock() = since;

        let reader = Reader {
            shared: self.shared.clone(),
            generation,
            stream,
            abort_on_malformed: self.config.abort_on_malformed,
        };
        let name = self
            .config
            .thread_name
            .clone()
            .unwrap_or_else(|| format!("feedsync-{}", self.shared.collection));

        if let Err(e) = thread::Builder::new().name(name).spawn(move || reader.run()) {
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            *self.shared.state.lock() = previous;
            self.shared.cancel.lock().take();
            cancel();
            return Err(e.into());
        }

        self.shared.subscriptions.fetch_add(1, Ordering::SeqCst);
        info!(collection = %self.shared.collection, ?since, "change feed subscribed");
        Ok(())
    }

    /// End the subscription. Idempotent; a no-op unless subscribed.
    ///
    /// Waits for an in-flight dispatch on another thread to finish; once this
    /// returns, no cache or listener is called again for this subscription
    /// and the transport has been told to release the feed.
    pub fn stop(&self) {
        let _guard = self.shared.dispatch.lock();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        self.shared.close(generation, CloseReason::Stopped);
    }

    pub fn state(&self) -> NotifierState {
        self.shared.state.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().is_active()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.state.lock().close_reason().cloned()
    }

    /// Sequence of the last event or terminal record dispatched.
    pub fn last_seen_sequence(&self) -> Option<Sequence> {
        *self.shared.last_seen.lock()
    }

    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            events: self.shared.events.load(Ordering::SeqCst),
            malformed: self.shared.malformed.load(Ordering::SeqCst),
            observer_failures: self.shared.observer_failures.load(Ordering::SeqCst),
            subscriptions: self.shared.subscriptions.load(Ordering::SeqCst),
        }
    }

    /// Block until the notifier is closed or `timeout` elapses.
    pub fn wait_closed(&self, timeout: Duration) -> Option<CloseReason> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(reason) = state.close_reason() {
                return Some(reason.clone());
            }
            if self
                .shared
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.close_reason().cloned();
            }
        }
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::listener::{ChannelListener, Notification};
    use crate::transport::{DocumentStore, MemoryStore};
    use crate::types::DocKey;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn expect_changed(notification: Notification) -> ChangeEvent {
        match notification {
            Notification::Changed(event) => event,
            other => panic!("Expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let notifier = ChangeNotifier::new(store.clone(), "test");
        assert_eq!(notifier.state(), NotifierState::Idle);

        notifier.start().unwrap();
        assert!(notifier.is_active());
        assert!(matches!(
            notifier.start(),
            Err(FeedError::AlreadyStarted(_))
        ));

        notifier.stop();
        assert_eq!(notifier.close_reason(), Some(CloseReason::Stopped));
        notifier.stop();
        assert_eq!(notifier.close_reason(), Some(CloseReason::Stopped));
    }

    #[test]
    fn test_stop_releases_feed_without_reader() {
        // A long poll interval keeps the reader parked in the transport.
        let store = Arc::new(MemoryStore::with_poll_interval(Duration::from_secs(2)));
        let notifier = ChangeNotifier::new(store.clone(), "test");
        notifier.start().unwrap();
        assert_eq!(store.open_feeds("test"), 1);

        notifier.stop();
        assert_eq!(store.open_feeds("test"), 0);
        assert_eq!(notifier.close_reason(), Some(CloseReason::Stopped));
    }

    #[test]
    fn test_restart_after_stop_opens_new_feed() {
        let store = Arc::new(MemoryStore::with_poll_interval(Duration::from_secs(2)));
        let notifier = ChangeNotifier::new(store.clone(), "test");
        notifier.start().unwrap();
        notifier.stop();
        notifier.start().unwrap();
        assert_eq!(store.open_feeds("test"), 1);

        notifier.stop();
        assert_eq!(store.open_feeds("test"), 0);
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let notifier = ChangeNotifier::new(store, "test");
        notifier.stop();
        assert_eq!(notifier.state(), NotifierState::Idle);
    }

    #[test]
    fn test_invalidates_then_notifies() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let (listener, handle) = ChannelListener::new();

        let notifier = ChangeNotifier::new(store.clone(), "test");
        notifier.add_cache(cache.clone());
        notifier.add_listener(Arc::new(listener));
        notifier.start().unwrap();

        cache.fill(DocKey::new("test", "x"), json!({"v": 0}));
        store.store("test", "x", &json!({"v": 1})).unwrap();

        let event = expect_changed(handle.recv_timeout(TIMEOUT).unwrap());
        assert_eq!(event.document_id, "x");
        assert!(cache.lookup(&DocKey::new("test", "x")).is_none());
        assert_eq!(cache.metrics().cached, 0);
        assert_eq!(notifier.last_seen_sequence(), Some(Sequence(1)));
        assert_eq!(notifier.stats().events, 1);
    }

    #[test]
    fn test_terminal_closes() {
        let store = Arc::new(MemoryStore::new());
        let (listener, handle) = ChannelListener::new();
        let notifier = ChangeNotifier::new(store.clone(), "test");
        notifier.add_listener(Arc::new(listener));
        notifier.start().unwrap();

        store.store("test", "a", &json!({})).unwrap();
        store.finish_feeds("test");

        assert_eq!(
            notifier.wait_closed(TIMEOUT),
            Some(CloseReason::Terminal {
                last_sequence: Sequence(1)
            })
        );
        expect_changed(handle.recv_timeout(TIMEOUT).unwrap());
        assert!(matches!(
            handle.recv_timeout(TIMEOUT).unwrap(),
            Notification::Closed(CloseReason::Terminal { .. })
        ));
    }

    #[test]
    fn test_interruption_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let notifier = ChangeNotifier::new(store.clone(), "test");
        notifier.start().unwrap();
        store.inject("test", b"{\"seq\":1,\"id\":");
        store.interrupt_feeds("test");

        let reason = notifier.wait_closed(TIMEOUT).unwrap();
        assert!(reason.is_error());
        assert!(matches!(reason, CloseReason::TransportInterrupted { .. }));
    }

    #[test]
    fn test_restart_from_last_seen() {
        let store = Arc::new(MemoryStore::new());
        let (listener, handle) = ChannelListener::new();
        let notifier = ChangeNotifier::new(store.clone(), "test");
        notifier.add_listener(Arc::new(listener));

        notifier.start().unwrap();
        store.store("test", "a", &json!({})).unwrap();
        expect_changed(handle.recv_timeout(TIMEOUT).unwrap());
        store.interrupt_feeds("test");
        notifier.wait_closed(TIMEOUT).unwrap();

        // Written while disconnected.
        store.store("test", "b", &json!({})).unwrap();

        let resume = notifier.last_seen_sequence();
        notifier.start_from(resume).unwrap();
        assert!(notifier.is_active());

        // Skip the Closed notification from the first subscription.
        let event = loop {
            if let Notification::Changed(event) = handle.recv_timeout(TIMEOUT).unwrap() {
                break event;
            }
        };
        assert_eq!(event.document_id, "b");
        assert_eq!(notifier.stats().subscriptions, 2);
    }
}
