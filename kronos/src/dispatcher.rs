//! Event dispatcher.
//!
//! Fans lobby notifications out to listeners registered per session or
//! globally. Events are delivered synchronously, in production order, to
//! session listeners first and then global ones. Delivery works on a copy
//! of the listener set, so a callback may register or unregister listeners;
//! the change applies from the next event on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::lifecycle::LifecycleState;
use crate::types::{AttributeMap, Identity, Member, SessionDescriptor, SessionId};

/// Why a session reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// The local player left.
    Left,
    /// The local host destroyed the session.
    TornDown,
    /// The backend removed the local player.
    Removed,
    /// The backend destroyed the session.
    BackendClosed,
    RetriesExhausted,
    MigrationExhausted,
    /// A teardown call failed.
    BackendError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyEvent {
    LifecycleChanged {
        session_id: SessionId,
        from: LifecycleState,
        to: LifecycleState,
        reason: Option<TerminalReason>,
    },
    MembershipChanged {
        session_id: SessionId,
        members: Vec<Member>,
        joined: Vec<Identity>,
        left: Vec<Identity>,
    },
    AttributesChanged {
        session_id: SessionId,
        changed: AttributeMap,
    },
    HostMigrated {
        session_id: SessionId,
        from: Option<Identity>,
        to: Identity,
    },
    InviteReceived {
        descriptor: SessionDescriptor,
        from: Identity,
    },
}

impl LobbyEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::LifecycleChanged { session_id, .. }
            | Self::MembershipChanged { session_id, .. }
            | Self::AttributesChanged { session_id, .. }
            | Self::HostMigrated { session_id, .. } => session_id,
            Self::InviteReceived { descriptor, .. } => &descriptor.id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LifecycleChanged { to, .. } if to.is_terminal())
    }
}

/// Native listener.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LobbyEvent);
}

impl<F> EventListener for F
where
    F: Fn(&LobbyEvent) + Send + Sync,
{
    fn on_event(&self, event: &LobbyEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerScope {
    Global,
    Session(SessionId),
}

#[derive(Clone)]
enum ListenerSink {
    Callback(Arc<dyn EventListener>),
    Channel(mpsc::UnboundedSender<LobbyEvent>),
}

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    sink: ListenerSink,
}

impl Listener {
    /// False when a channel listener's receiver is gone.
    fn deliver(&self, event: &LobbyEvent) -> bool {
        match &self.sink {
            ListenerSink::Callback(listener) => {
                listener.on_event(event);
                true
            }
            ListenerSink::Channel(tx) => tx.send(event.clone()).is_ok(),
        }
    }
}

pub struct EventDispatcher {
    global: RwLock<Vec<Listener>>,
    sessions: DashMap<SessionId, Vec<Listener>>,
    next_id: AtomicU64,
    dispatched: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            global: RwLock::new(Vec::new()),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Register a callback.
    pub fn register(&self, scope: ListenerScope, listener: impl EventListener + 'static) -> ListenerId {
        self.insert(scope, ListenerSink::Callback(Arc::new(listener)))
    }

    /// Register a channel listener. Dropping the receiver unregisters it.
    pub fn subscribe(&self, scope: ListenerScope) -> (ListenerId, mpsc::UnboundedReceiver<LobbyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.insert(scope, ListenerSink::Channel(tx)), rx)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        {
            let mut global = self.global.write();
            let before = global.len();
            global.retain(|l| l.id != id);
            if global.len() != before {
                return true;
            }
        }
        let mut found = false;
        for mut entry in self.sessions.iter_mut() {
            let before = entry.len();
            entry.retain(|l| l.id != id);
            found |= entry.len() != before;
        }
        self.sessions.retain(|_, listeners| !listeners.is_empty());
        found
    }

    /// Deliver `event` to every matching listener. Returns how many got it.
    pub fn dispatch(&self, event: &LobbyEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for listener in self.targets(event.session_id()) {
            if listener.deliver(event) {
                delivered += 1;
            } else {
                dead.push(listener.id);
            }
        }

        for id in dead {
            self.unregister(id);
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Session listeners then global ones, copied out so no guard is held
    /// while callbacks run.
    fn targets(&self, id: &SessionId) -> Vec<Listener> {
        let mut targets = self
            .sessions
            .get(id)
            .map(|listeners| listeners.value().clone())
            .unwrap_or_default();
        targets.extend(self.global.read().iter().cloned());
        targets
    }

    /// Drop per-session listeners once the session is gone.
    pub(crate) fn retire_session(&self, id: &SessionId) {
        self.sessions.remove(id);
    }

    pub fn listener_count(&self) -> usize {
        self.global.read().len() + self.sessions.iter().map(|l| l.len()).sum::<usize>()
    }

    /// Events dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    fn insert(&self, scope: ListenerScope, sink: ListenerSink) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Listener { id, sink };
        match scope {
            ListenerScope::Global => self.global.write().push(listener),
            ListenerScope::Session(session_id) => {
                self.sessions.entry(session_id).or_default().push(listener)
            }
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn lifecycle(id: &str, to: LifecycleState) -> LobbyEvent {
        LobbyEvent::LifecycleChanged {
            session_id: SessionId::new(id),
            from: LifecycleState::Creating,
            to,
            reason: None,
        }
    }

    #[test]
    fn test_scoped_delivery() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        dispatcher.register(ListenerScope::Session(SessionId::new("a")), move |e: &LobbyEvent| {
            log.lock().push(format!("a:{}", e.session_id()));
        });
        let log = Arc::clone(&seen);
        dispatcher.register(ListenerScope::Global, move |e: &LobbyEvent| {
            log.lock().push(format!("global:{}", e.session_id()));
        });

        assert_eq!(dispatcher.dispatch(&lifecycle("a", LifecycleState::Advertised)), 2);
        assert_eq!(dispatcher.dispatch(&lifecycle("b", LifecycleState::Advertised)), 1);
        assert_eq!(*seen.lock(), vec!["a:a", "global:a", "global:b"]);
        assert_eq!(dispatcher.dispatched(), 2);
    }

    #[test]
    fn test_channel_preserves_order() {
        let dispatcher = EventDispatcher::new();
        let (_, mut rx) = dispatcher.subscribe(ListenerScope::Global);

        let states = [LifecycleState::Advertised, LifecycleState::Filling, LifecycleState::Locked];
        for state in states {
            dispatcher.dispatch(&lifecycle("a", state));
        }
        for state in states {
            match rx.try_recv() {
                Ok(LobbyEvent::LifecycleChanged { to, .. }) => assert_eq!(to, state),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_unregister_and_dead_channels() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.register(ListenerScope::Session(SessionId::new("a")), |_: &LobbyEvent| {});
        let (_, rx) = dispatcher.subscribe(ListenerScope::Global);
        assert_eq!(dispatcher.listener_count(), 2);

        assert!(dispatcher.unregister(id));
        assert!(!dispatcher.unregister(id));

        drop(rx);
        assert_eq!(dispatcher.dispatch(&lifecycle("a", LifecycleState::Closed)), 0);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn test_callbacks_may_change_listeners() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = Arc::clone(&dispatcher);
        let log = Arc::clone(&seen);
        let once = Arc::new(Mutex::new(None::<ListenerId>));
        let slot = Arc::clone(&once);
        let id = dispatcher.register(ListenerScope::Session(SessionId::new("a")), move |e: &LobbyEvent| {
            log.lock().push(format!("once:{}", e.session_id()));
            if let Some(me) = slot.lock().take() {
                inner.unregister(me);
                let log = Arc::clone(&log);
                inner.register(ListenerScope::Global, move |e: &LobbyEvent| {
                    log.lock().push(format!("late:{}", e.session_id()));
                });
            }
        });
        *once.lock() = Some(id);

        assert_eq!(dispatcher.dispatch(&lifecycle("a", LifecycleState::Advertised)), 1);
        assert_eq!(dispatcher.dispatch(&lifecycle("a", LifecycleState::Filling)), 1);
        assert_eq!(*seen.lock(), vec!["once:a", "late:a"]);
        assert_eq!(dispatcher.listener_count(), 1);
    }

    #[test]
    fn test_terminal_and_json() {
        let event = lifecycle("a", LifecycleState::Failed);
        assert!(event.is_terminal());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lifecycle_changed");
        assert_eq!(json["to"], "failed");
    }
}
