//! Fan-out of lifecycle, message and error notifications to registered
//! listeners.
//!
//! Dispatch is synchronous on the connection actor task and isolates
//! listener panics: one misbehaving listener never prevents delivery to the
//! rest nor destabilizes the state machine.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::error::Kind;
use crate::frame::Frame;

/// Listener categories, mirroring the variants of [`Event`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
    Message,
    Heartbeat,
}

/// A notification delivered to registered listeners.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection attempt is starting
    Connecting,
    /// The connection is open; `latency` is the time the open took
    Connected { latency: Duration },
    /// The connection was lost or closed
    Disconnected { code: Option<u16>, reason: String },
    /// A reconnection attempt is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// A connection-level or delivery error surfaced
    Error { kind: Kind, message: String },
    /// An application message arrived
    Message { frame: Frame },
    /// A heartbeat round trip completed
    Heartbeat { latency: Duration },
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connecting => EventKind::Connecting,
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Error { .. } => EventKind::Error,
            Self::Message { .. } => EventKind::Message,
            Self::Heartbeat { .. } => EventKind::Heartbeat,
        }
    }
}

/// Handle returned by [`EventDispatcher::on`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

#[derive(Default)]
pub(crate) struct EventDispatcher {
    listeners: DashMap<EventKind, Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener by its registration handle. Returns whether a
    /// listener was actually removed.
    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut removed = false;
        for mut entry in self.listeners.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|(lid, _)| *lid != id);
            removed |= entry.value().len() != before;
        }
        removed
    }

    pub(crate) fn dispatch(&self, event: &Event) {
        // Clone the listener list out of the map guard so a listener that
        // calls on/off re-entrantly cannot deadlock the registry.
        let listeners: Vec<Listener> = self
            .listeners
            .get(&event.kind())
            .map(|entry| entry.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(kind = ?event.kind(), "event listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn dispatch_reaches_all_listeners_of_kind() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            let _id = dispatcher.on(EventKind::Connecting, move |_| {
                seen.lock().expect("lock").push(tag);
            });
        }
        let seen_other = Arc::clone(&seen);
        let _other = dispatcher.on(EventKind::Connected, move |_| {
            seen_other.lock().expect("lock").push("other");
        });

        dispatcher.dispatch(&Event::Connecting);
        assert_eq!(*seen.lock().expect("lock"), vec!["a", "b"]);
    }

    #[test]
    fn off_removes_only_the_target_listener() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(0_u32));

        let seen_a = Arc::clone(&seen);
        let a = dispatcher.on(EventKind::Heartbeat, move |_| {
            *seen_a.lock().expect("lock") += 1;
        });
        let seen_b = Arc::clone(&seen);
        let _b = dispatcher.on(EventKind::Heartbeat, move |_| {
            *seen_b.lock().expect("lock") += 10;
        });

        assert!(dispatcher.off(a));
        assert!(!dispatcher.off(a), "second removal finds nothing");

        dispatcher.dispatch(&Event::Heartbeat {
            latency: Duration::from_millis(1),
        });
        assert_eq!(*seen.lock().expect("lock"), 10);
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(false));

        let _bad = dispatcher.on(EventKind::Error, |_| panic!("listener bug"));
        let seen_ok = Arc::clone(&seen);
        let _ok = dispatcher.on(EventKind::Error, move |_| {
            *seen_ok.lock().expect("lock") = true;
        });

        dispatcher.dispatch(&Event::Error {
            kind: Kind::Transport,
            message: "boom".to_owned(),
        });
        assert!(*seen.lock().expect("lock"), "second listener must still run");
    }

    #[test]
    fn listener_can_deregister_itself_during_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let dispatcher_inner = Arc::clone(&dispatcher);
        let slot_inner = Arc::clone(&slot);
        let id = dispatcher.on(EventKind::Connecting, move |_| {
            if let Some(id) = slot_inner.lock().expect("lock").take() {
                dispatcher_inner.off(id);
            }
        });
        *slot.lock().expect("lock") = Some(id);

        dispatcher.dispatch(&Event::Connecting);
        dispatcher.dispatch(&Event::Connecting);
        assert!(!dispatcher.off(id), "listener already removed itself");
    }
}
