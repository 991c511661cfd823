//! The call-correlation engine.
//!
//! A [`Communicator`] sits between one transport and the application:
//!
//! ```text
//!   application ── submit_call ──► Communicator ── Channel::send_data ──► transport
//!   application ◄── Provider ◄──── Communicator ◄── dispatch_incoming ─── transport
//! ```
//!
//! Outgoing calls are parked in a pending table keyed by uid until the
//! matching Return arrives or the connection is destructed. Incoming calls
//! start in the order the transport delivers them and then finish on their
//! own tokio task, so a slow Provider function never holds up other messages
//! on the same connection.
//!
//! # Thread Safety
//!
//! `Communicator` is a cheap handle over shared state. The pending table and
//! the Provider slot sit behind short-lived `std::sync` locks that are never
//! held across an `.await`.

use crate::driver::Driver;
use crate::error::{RemoteError, Result, TetherError};
use crate::events::{
    CompleteEvent, Event, EventBus, EventKind, ListenerId, ReceiveEvent, ReturnEvent, SendEvent,
};
use crate::invoke::{Invoke, InvokeFunction, InvokeReturn};
use crate::provider::ProviderSlot;
use crate::uid::next_uid;
use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Outbound half of a transport.
pub trait Channel: Send + Sync + 'static {
    /// Queue one envelope for transmission.
    ///
    /// Must not block. A link that breaks later reports it through
    /// [`Communicator::destructor`]; an error here means the envelope was
    /// never queued.
    fn send_data(&self, invoke: Invoke) -> Result<()>;
}

/// Decides whether calls are currently permitted.
pub trait Readiness: Send + Sync + 'static {
    /// `None` when ready, otherwise the error to fail the operation with.
    fn inspect_ready(&self, method: &str) -> Option<TetherError>;
}

/// A Readiness that always permits calls. Useful when a transport has no
/// lifecycle of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

impl Readiness for AlwaysReady {
    fn inspect_ready(&self, _method: &str) -> Option<TetherError> {
        None
    }
}

struct PendingCall {
    function: InvokeFunction,
    submitted_at: DateTime<Utc>,
    reply: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct PendingTable {
    calls: HashMap<u64, PendingCall>,
    /// Set once by the destructor; later calls fail with this error.
    closed: Option<TetherError>,
}

#[derive(Debug, Clone)]
enum Closure {
    Open,
    Closed(Option<TetherError>),
}

pub(crate) struct Inner {
    readiness: Arc<dyn Readiness>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    provider: RwLock<ProviderSlot>,
    pending: Mutex<PendingTable>,
    events: EventBus,
    driver: OnceLock<Driver>,
    closure: watch::Sender<Closure>,
}

/// Handle to one connection's correlation engine.
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<Inner>,
}

/// Non-owning reference held by drivers.
#[derive(Clone)]
pub(crate) struct WeakCommunicator(Weak<Inner>);

impl WeakCommunicator {
    pub(crate) fn upgrade(&self) -> Option<Communicator> {
        self.0.upgrade().map(|inner| Communicator { inner })
    }

    pub(crate) fn ptr_eq(&self, other: &WeakCommunicator) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Communicator {
    pub fn new(readiness: Arc<dyn Readiness>, provider: impl Into<ProviderSlot>) -> Self {
        let (closure, _) = watch::channel(Closure::Open);
        Self {
            inner: Arc::new(Inner {
                readiness,
                channel: Mutex::new(None),
                provider: RwLock::new(provider.into()),
                pending: Mutex::new(PendingTable::default()),
                events: EventBus::new(),
                driver: OnceLock::new(),
                closure,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCommunicator {
        WeakCommunicator(Arc::downgrade(&self.inner))
    }

    /// Bind the transport that carries outgoing envelopes.
    pub fn attach(&self, channel: Arc<dyn Channel>) {
        *self
            .inner
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(channel);
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.inner
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ------------------------------------------------------------------
    // Provider
    // ------------------------------------------------------------------

    pub fn provider(&self) -> ProviderSlot {
        self.inner
            .provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the local Provider. Calls already running keep the old one.
    pub fn set_provider(&self, provider: impl Into<ProviderSlot>) {
        *self
            .inner
            .provider
            .write()
            .unwrap_or_else(PoisonError::into_inner) = provider.into();
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    /// The root proxy for calling the remote Provider. Built once.
    pub fn driver(&self) -> Driver {
        self.inner
            .driver
            .get_or_init(|| Driver::root(self.downgrade()))
            .clone()
    }

    /// The root proxy viewed through a typed interface generated by
    /// [`driver!`](crate::driver!).
    pub fn driver_as<T: From<Driver>>(&self) -> T {
        T::from(self.driver())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.events.off(kind, id)
    }

    fn emit(&self, kind: EventKind, event: impl FnOnce() -> Event) {
        if self.inner.events.has_listeners(kind) {
            self.inner.events.dispatch(&event());
        }
    }

    // ------------------------------------------------------------------
    // Outgoing calls
    // ------------------------------------------------------------------

    /// Call `listener` on the remote Provider and wait for its Return.
    ///
    /// Fails at once, without registering anything, when the connection is
    /// not ready. Otherwise settles when the Return arrives or when the
    /// connection is destructed.
    pub async fn submit_call(&self, listener: &str, args: Vec<Value>) -> Result<Value> {
        let method = format!("Communicator.call({})", listener);
        if let Some(err) = self.inner.readiness.inspect_ready(&method) {
            return Err(err);
        }
        let channel = self.channel().ok_or_else(|| TetherError::NotOpen {
            method: method.clone(),
            state: "DETACHED".to_string(),
        })?;

        let uid = next_uid();
        let function = InvokeFunction::new(uid, listener, args);
        let submitted_at = Utc::now();

        let (reply, settled) = oneshot::channel();
        {
            let mut table = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = &table.closed {
                return Err(err.clone());
            }
            table.calls.insert(
                uid,
                PendingCall {
                    function: function.clone(),
                    submitted_at,
                    reply,
                },
            );
        }

        self.emit(EventKind::Send, || {
            Event::Send(SendEvent {
                function: function.clone(),
                time: submitted_at,
            })
        });

        debug!("call #{} -> {}", uid, listener);
        if let Err(e) = channel.send_data(Invoke::Function(function)) {
            self.take_pending(uid);
            return Err(e);
        }

        match settled.await {
            Ok(result) => result,
            Err(_) => Err(TetherError::connection_closed()),
        }
    }

    fn take_pending(&self, uid: u64) -> Option<PendingCall> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .remove(&uid)
    }

    /// Number of calls still waiting for their Return.
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .len()
    }

    // ------------------------------------------------------------------
    // Incoming messages
    // ------------------------------------------------------------------

    /// Entry point for every envelope the transport receives.
    ///
    /// Returns settle their call immediately. A Call is started here, in
    /// delivery order: the Receive event fires, the target is resolved and
    /// the handler begins before this returns. Only the wait for its result
    /// moves to a spawned task, so this must run inside a tokio runtime.
    pub fn dispatch_incoming(&self, invoke: Invoke) {
        match invoke {
            Invoke::Function(function) => self.handle_function(function),
            Invoke::Return(ret) => self.handle_return(ret),
        }
    }

    fn handle_function(&self, function: InvokeFunction) {
        let requested_at = Utc::now();
        self.emit(EventKind::Receive, || {
            Event::Receive(ReceiveEvent {
                function: function.clone(),
                time: requested_at,
            })
        });

        let running = match self.provider().get() {
            Ok(provider) => provider.start(&function.listener, function.arguments()),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        };

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = running.await;
            this.finish_function(function, requested_at, outcome);
        });
    }

    fn finish_function(
        &self,
        function: InvokeFunction,
        requested_at: DateTime<Utc>,
        outcome: std::result::Result<Value, RemoteError>,
    ) {
        let uid = function.uid;
        let ret = match outcome {
            Ok(value) => InvokeReturn::success(uid, value),
            Err(e) => {
                debug!("call #{} to {} failed: {}", uid, function.listener, e);
                InvokeReturn::failure(uid, e.to_value())
            }
        };

        self.emit(EventKind::Return, || {
            Event::Return(ReturnEvent {
                function: function.clone(),
                ret: ret.clone(),
                requested_at,
                completed_at: Utc::now(),
            })
        });

        self.send_return(ret);
    }

    fn send_return(&self, ret: InvokeReturn) {
        let uid = ret.uid;
        match self.channel() {
            Some(channel) => {
                if let Err(e) = channel.send_data(Invoke::Return(ret)) {
                    warn!("failed to send Return #{}: {}", uid, e);
                }
            }
            None => warn!("no transport attached; dropping Return #{}", uid),
        }
    }

    fn handle_return(&self, ret: InvokeReturn) {
        let Some(call) = self.take_pending(ret.uid) else {
            debug!("dropping Return #{} with no pending call", ret.uid);
            return;
        };

        self.emit(EventKind::Complete, || {
            Event::Complete(CompleteEvent {
                function: call.function.clone(),
                ret: ret.clone(),
                requested_at: call.submitted_at,
                completed_at: Utc::now(),
            })
        });

        let result = if ret.success {
            Ok(ret.value)
        } else {
            Err(TetherError::Remote(RemoteError::from_value(ret.value)))
        };
        // The caller may have stopped waiting; nothing to do then.
        let _ = call.reply.send(result);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tear down after the transport reports the link permanently closed.
    ///
    /// Rejects every pending call with `error` (or a generic disconnection
    /// error) and releases `join` waiters. Only the first invocation has any
    /// effect; it returns `true`.
    pub fn destructor(&self, error: Option<TetherError>) -> bool {
        let reason = error.clone().unwrap_or_else(TetherError::connection_closed);
        let drained: Vec<PendingCall> = {
            let mut table = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(reason.clone());
            table.calls.drain().map(|(_, call)| call).collect()
        };

        if !drained.is_empty() {
            info!("rejecting {} pending call(s): {}", drained.len(), reason);
        }
        for call in drained {
            let _ = call.reply.send(Err(reason.clone()));
        }

        *self
            .inner
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.closure.send_replace(Closure::Closed(error));
        true
    }

    pub fn is_destructed(&self) -> bool {
        matches!(*self.inner.closure.borrow(), Closure::Closed(_))
    }

    // ------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------

    /// Wait until the connection is destructed.
    ///
    /// Resolves `Ok` after a clean closure and with the closure error after
    /// an abnormal one.
    pub async fn join(&self) -> Result<()> {
        let mut closure = self.inner.closure.subscribe();
        let state = closure
            .wait_for(|c| matches!(c, Closure::Closed(_)))
            .await
            .map_err(|_| TetherError::connection_closed())?
            .clone();

        match state {
            Closure::Closed(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    /// Wait at most `timeout`. `Ok(true)` if the connection closed,
    /// `Ok(false)` if the time ran out first.
    pub async fn join_for(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.join()).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    /// Like [`join_for`](Self::join_for) with an absolute deadline.
    pub async fn join_until(&self, deadline: tokio::time::Instant) -> Result<bool> {
        match tokio::time::timeout_at(deadline, self.join()).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        }
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("pending", &self.pending_count())
            .field("destructed", &self.is_destructed())
            .field("events", &self.inner.events)
            .finish()
    }
}
