//! Listener registry for [`SyncEvent`]s.
//!
//! Callbacks run synchronously on the publishing task, in registration order.
//! Each listener has its own lock: unsubscribing waits out a call already in
//! progress, after which the callback never runs again. A listener may
//! unsubscribe itself from inside its own callback.

use std::{
    cell::RefCell,
    fmt,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{EventKind, SyncEvent};

/// Broadcast event stream type used by async consumers.
pub type EventStream = broadcast::Receiver<SyncEvent>;

/// Default capacity of the [`EventBus::stream`] channel.
pub const DEFAULT_STREAM_BUFFER: usize = 256;

type Callback = Box<dyn FnMut(&SyncEvent) + Send>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DISPATCHING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

struct ListenerEntry {
    id: u64,
    kind: Option<EventKind>,
    removed: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

impl ListenerEntry {
    fn accepts(&self, kind: EventKind) -> bool {
        self.kind.is_none_or(|wanted| wanted == kind)
    }
}

struct BusInner {
    listeners: Mutex<Vec<Arc<ListenerEntry>>>,
    stream_tx: broadcast::Sender<SyncEvent>,
}

impl BusInner {
    fn remove(&self, id: u64) {
        let entry = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            let position = listeners.iter().position(|entry| entry.id == id);
            position.map(|index| listeners.remove(index))
        };
        let Some(entry) = entry else {
            return;
        };

        entry.removed.store(true, Ordering::Release);
        if is_dispatching(id) {
            // the publisher drops the callback once it returns
            return;
        }
        let mut callback = entry.callback.lock().unwrap_or_else(PoisonError::into_inner);
        *callback = None;
        trace!(listener_id = id, "listener removed");
    }
}

/// Event fan-out shared by the reconciler and its observers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose async stream buffers up to `stream_buffer` events.
    pub fn new(stream_buffer: usize) -> Self {
        let (stream_tx, _) = broadcast::channel(stream_buffer.max(1));
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                stream_tx,
            }),
        }
    }

    /// Register `callback` for events of one kind.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        self.register(Some(kind), Box::new(callback))
    }

    /// Register `callback` for every event.
    pub fn on_any<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        self.register(None, Box::new(callback))
    }

    /// Subscribe to published events as an async stream.
    ///
    /// Slow receivers lag; `broadcast` reports skipped events.
    pub fn stream(&self) -> EventStream {
        self.inner.stream_tx.subscribe()
    }

    /// Number of registered callbacks.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to matching listeners, then to stream subscribers.
    pub fn publish(&self, event: SyncEvent) {
        let kind = event.kind();
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        trace!(?kind, listener_count = listeners.len(), "publishing sync event");

        for entry in listeners.iter().filter(|entry| entry.accepts(kind)) {
            if entry.removed.load(Ordering::Acquire) || is_dispatching(entry.id) {
                continue;
            }
            let mut callback = entry.callback.lock().unwrap_or_else(PoisonError::into_inner);
            if entry.removed.load(Ordering::Acquire) {
                *callback = None;
                continue;
            }
            if let Some(callback) = callback.as_mut() {
                let _dispatch = DispatchGuard::enter(entry.id);
                callback(&event);
            }
            if entry.removed.load(Ordering::Acquire) {
                *callback = None;
            }
        }

        let _ = self.inner.stream_tx.send(event);
    }

    fn register(&self, kind: Option<EventKind>, callback: Callback) -> Subscription {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ListenerEntry {
            id,
            kind,
            removed: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        });
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        trace!(listener_id = id, ?kind, "listener registered");

        Subscription {
            id,
            bus: Some(Arc::downgrade(&self.inner)),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

/// Registration handle returned by [`EventBus::on`] and [`EventBus::on_any`].
///
/// Dropping the handle unregisters the listener.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    id: u64,
    bus: Option<Weak<BusInner>>,
}

impl Subscription {
    /// Unregister now. When called from another thread while the callback is
    /// running, returns after that call finishes.
    pub fn cancel(mut self) {
        self.release();
    }

    /// Keep the listener registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.bus = None;
    }

    fn release(&mut self) {
        if let Some(inner) = self.bus.take().and_then(|weak| weak.upgrade()) {
            inner.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.bus.is_some())
            .finish()
    }
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter(id: u64) -> Self {
        DISPATCHING.with(|ids| ids.borrow_mut().push(id));
        Self
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|ids| {
            ids.borrow_mut().pop();
        });
    }
}

fn is_dispatching(id: u64) -> bool {
    DISPATCHING.with(|ids| ids.borrow().contains(&id))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Mutex, mpsc},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{
        record::StateRecord,
        types::{Change, Scope},
    };

    fn joined(participant: &str) -> SyncEvent {
        SyncEvent::Changed {
            scope: Scope::Current,
            change: Change::MembershipJoined {
                participant: participant.into(),
            },
            snapshot: Some(Arc::new(StateRecord::new("lobby-1"))),
        }
    }

    fn refreshed() -> SyncEvent {
        SyncEvent::CollectionRefreshed(Arc::new(Vec::new()))
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn FnMut(&SyncEvent) + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |label: &str| -> Box<dyn FnMut(&SyncEvent) + Send> {
            let sink = sink.clone();
            let label = label.to_owned();
            Box::new(move |event: &SyncEvent| {
                sink.lock()
                    .expect("log lock")
                    .push(format!("{label}:{:?}", event.kind()));
            })
        };
        (log, make)
    }

    #[test]
    fn delivers_by_kind_in_registration_order() {
        let bus = EventBus::default();
        let (log, make) = recorder();

        let _first = bus.on_any(make("any"));
        let _second = bus.on(EventKind::MembershipJoined, make("joined"));
        let _third = bus.on(EventKind::CollectionRefreshed, make("refreshed"));

        bus.publish(joined("carol"));
        bus.publish(refreshed());

        assert_eq!(
            *log.lock().expect("log lock"),
            vec![
                "any:MembershipJoined",
                "joined:MembershipJoined",
                "any:CollectionRefreshed",
                "refreshed:CollectionRefreshed",
            ]
        );
    }

    #[test]
    fn dropping_subscription_unregisters_listener() {
        let bus = EventBus::default();
        let (log, make) = recorder();

        let subscription = bus.on_any(make("any"));
        assert_eq!(bus.listener_count(), 1);
        drop(subscription);
        assert_eq!(bus.listener_count(), 0);

        bus.publish(joined("carol"));
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[test]
    fn detached_listener_stays_registered() {
        let bus = EventBus::default();
        let (log, make) = recorder();

        bus.on(EventKind::MembershipJoined, make("joined")).detach();
        bus.publish(joined("carol"));

        assert_eq!(bus.listener_count(), 1);
        assert_eq!(log.lock().expect("log lock").len(), 1);
    }

    #[test]
    fn listener_can_unsubscribe_itself() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let subscription = {
            let calls = calls.clone();
            let slot = slot.clone();
            bus.on_any(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(subscription) = slot.lock().expect("slot lock").take() {
                    subscription.cancel();
                }
            })
        };
        *slot.lock().expect("slot lock") = Some(subscription);

        bus.publish(joined("carol"));
        bus.publish(joined("dave"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn cancel_waits_for_in_flight_callback() {
        let bus = EventBus::default();
        let (started_tx, started_rx) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let subscription = {
            let finished = finished.clone();
            bus.on_any(move |_| {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
            })
        };

        let publisher = {
            let bus = bus.clone();
            thread::spawn(move || bus.publish(joined("carol")))
        };
        started_rx.recv().expect("callback should start");
        subscription.cancel();

        assert!(finished.load(Ordering::SeqCst));
        publisher.join().expect("publisher thread should finish");
    }

    #[tokio::test]
    async fn stream_receives_published_events() {
        let bus = EventBus::default();
        let mut stream = bus.stream();

        bus.publish(joined("carol"));

        let event = stream.recv().await.expect("stream should receive event");
        assert_eq!(event, joined("carol"));
    }
}
