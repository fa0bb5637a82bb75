//! Typed publish/subscribe
//!
//! Listeners are grouped by event kind and invoked synchronously, in
//! registration order, on the thread that emits the event. The listener list
//! is copied out before dispatch, so a listener may add or remove listeners
//! (itself included) while an event is being delivered.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// An event that can be dispatched through an [`EventBus`]
pub trait Event: Send + Sync {
    /// Tag used to group listeners
    type Kind: Copy + Eq + Hash + Send + Sync;

    /// The tag of this event
    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Mapping from event kind to an ordered list of listeners
pub struct EventBus<E: Event> {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<E::Kind, Vec<(ListenerId, Listener<E>)>>>,
}

impl<E: Event> EventBus<E> {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Register a listener for one kind of event
    pub fn on<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        for list in listeners.values_mut() {
            if let Some(pos) = list.iter().position(|(lid, _)| *lid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove every listener for a kind
    pub fn clear(&self, kind: E::Kind) {
        self.listeners.lock().remove(&kind);
    }

    /// Number of listeners registered for a kind
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to every listener of its kind
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .listeners
            .lock()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(event);
        }
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count: usize = self.listeners.lock().values().map(Vec::len).sum();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    #[derive(Debug)]
    enum TestEvent {
        Ping(u32),
        Pong,
    }

    impl Event for TestEvent {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            match self {
                TestEvent::Ping(_) => Kind::Ping,
                TestEvent::Pong => Kind::Pong,
            }
        }
    }

    #[test]
    fn test_registration_order() {
        let bus = EventBus::<TestEvent>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.on(Kind::Ping, move |_| seen.lock().push(tag));
        }

        bus.emit(&TestEvent::Ping(1));
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_only_matching_kind() {
        let bus = EventBus::<TestEvent>::new();
        let pings = Arc::new(Mutex::new(Vec::new()));
        let pings_clone = Arc::clone(&pings);
        bus.on(Kind::Ping, move |event| {
            if let TestEvent::Ping(n) = event {
                pings_clone.lock().push(*n);
            }
        });

        bus.emit(&TestEvent::Pong);
        bus.emit(&TestEvent::Ping(7));
        assert_eq!(*pings.lock(), vec![7]);
    }

    #[test]
    fn test_off_and_clear() {
        let bus = EventBus::<TestEvent>::new();
        let a = bus.on(Kind::Ping, |_| {});
        bus.on(Kind::Ping, |_| {});
        bus.on(Kind::Pong, |_| {});

        assert!(bus.off(a));
        assert!(!bus.off(a));
        assert_eq!(bus.listener_count(Kind::Ping), 1);

        bus.clear(Kind::Ping);
        assert_eq!(bus.listener_count(Kind::Ping), 0);
        assert_eq!(bus.listener_count(Kind::Pong), 1);
    }

    #[test]
    fn test_listener_can_subscribe_during_emit() {
        let bus = Arc::new(EventBus::<TestEvent>::new());
        let bus_clone = Arc::clone(&bus);
        bus.on(Kind::Ping, move |_| {
            bus_clone.on(Kind::Pong, |_| {});
        });

        bus.emit(&TestEvent::Ping(0));
        assert_eq!(bus.listener_count(Kind::Pong), 1);
    }
}
