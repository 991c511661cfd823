//! Instrumentation hooks fired at each protocol step.
//!
//! | kind       | fired when                                              |
//! |------------|---------------------------------------------------------|
//! | `Send`     | a local call is about to be transmitted                 |
//! | `Receive`  | a remote call arrived, before the Provider runs         |
//! | `Complete` | the Return of a local call arrived                      |
//! | `Return`   | the Provider finished and its Return is being sent      |
//!
//! Listeners run synchronously on the task performing the step. They are
//! kept in a hash map, so listeners of the same kind fire in no particular
//! order. A panicking listener is logged and skipped.

use crate::invoke::{InvokeFunction, InvokeReturn};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Send,
    Receive,
    Complete,
    Return,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Send,
        EventKind::Receive,
        EventKind::Complete,
        EventKind::Return,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Send => "send",
            EventKind::Receive => "receive",
            EventKind::Complete => "complete",
            EventKind::Return => "return",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local call leaving for the remote side.
#[derive(Debug, Clone)]
pub struct SendEvent {
    pub function: InvokeFunction,
    pub time: DateTime<Utc>,
}

/// A remote call arriving for the local Provider.
#[derive(Debug, Clone)]
pub struct ReceiveEvent {
    pub function: InvokeFunction,
    pub time: DateTime<Utc>,
}

/// A local call settled by its Return.
#[derive(Debug, Clone)]
pub struct CompleteEvent {
    pub function: InvokeFunction,
    pub ret: InvokeReturn,
    pub requested_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// A remote call answered by the local Provider.
#[derive(Debug, Clone)]
pub struct ReturnEvent {
    pub function: InvokeFunction,
    pub ret: InvokeReturn,
    pub requested_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Event {
    Send(SendEvent),
    Receive(ReceiveEvent),
    Complete(CompleteEvent),
    Return(ReturnEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Send(_) => EventKind::Send,
            Event::Receive(_) => EventKind::Receive,
            Event::Complete(_) => EventKind::Complete,
            Event::Return(_) => EventKind::Return,
        }
    }

    /// The Call this event is about.
    pub fn function(&self) -> &InvokeFunction {
        match self {
            Event::Send(e) => &e.function,
            Event::Receive(e) => &e.function,
            Event::Complete(e) => &e.function,
            Event::Return(e) => &e.function,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, HashMap<ListenerId, Listener>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .insert(id, Arc::new(listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered for `kind`.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&kind)
            .map(|set| set.remove(&id).is_some())
            .unwrap_or(false)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Deliver `event` to every listener of its kind.
    pub fn dispatch(&self, event: &Event) {
        // Snapshot first: listeners may register or unregister while firing.
        let listeners: Vec<Listener> = match self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
        {
            Some(set) if !set.is_empty() => set.values().cloned().collect(),
            _ => return,
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(
                    "{} listener panicked for uid {}; ignoring",
                    event.kind(),
                    event.function().uid
                );
            }
        }
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.listener_count(kind) > 0
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("EventBus");
        for kind in EventKind::ALL {
            debug.field(kind.as_str(), &self.listener_count(kind));
        }
        debug.finish()
    }
}
