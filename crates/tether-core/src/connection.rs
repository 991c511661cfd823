//! State-machine skeleton shared by both ends of a connection.
//!
//! A [`ConnectionBase`] owns the connection's [`StateCell`], its
//! [`Communicator`] and the Header. Concrete transports drive it through the
//! transport-facing steps (`begin_*`, `complete_*`, [`destructor`]) and hand
//! the application API on to their users.
//!
//! [`destructor`]: ConnectionBase::destructor

use crate::communicator::Communicator;
use crate::driver::Driver;
use crate::error::{Result, TetherError};
use crate::events::{Event, EventKind, ListenerId};
use crate::provider::ProviderSlot;
use crate::state::{Lifecycle, StateCell};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct ConnectionBase<S: Lifecycle, H> {
    header: Arc<H>,
    state: Arc<StateCell<S>>,
    communicator: Communicator,
}

impl<S: Lifecycle, H> Clone for ConnectionBase<S, H> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            state: self.state.clone(),
            communicator: self.communicator.clone(),
        }
    }
}

impl<S: Lifecycle, H> ConnectionBase<S, H> {
    pub fn new(header: H, provider: impl Into<ProviderSlot>) -> Self {
        let state = Arc::new(StateCell::new(S::INITIAL));
        let communicator = Communicator::new(state.clone(), provider);
        Self {
            header: Arc::new(header),
            state,
            communicator,
        }
    }

    pub fn header(&self) -> &H {
        &self.header
    }

    pub fn state(&self) -> S {
        self.state.get()
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    pub fn driver(&self) -> Driver {
        self.communicator.driver()
    }

    pub fn driver_as<T: From<Driver>>(&self) -> T {
        self.communicator.driver_as()
    }

    pub fn provider(&self) -> ProviderSlot {
        self.communicator.provider()
    }

    pub fn set_provider(&self, provider: impl Into<ProviderSlot>) {
        self.communicator.set_provider(provider);
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.communicator.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.communicator.off(kind, id)
    }

    /// `None` in OPEN; otherwise the error an operation named `method` fails with.
    pub fn inspect_ready(&self, method: &str) -> Option<TetherError> {
        self.state.get().readiness_error(method)
    }

    pub(crate) fn transition(&self, method: &str, event: S::Event) -> Result<S> {
        self.state.transition(method, event)
    }

    // ------------------------------------------------------------------
    // Transport-facing steps
    // ------------------------------------------------------------------

    /// OPEN -> CLOSING. Fails with the readiness error anywhere else.
    pub fn begin_close(&self) -> Result<()> {
        if let Some(err) = self.inspect_ready("close") {
            return Err(err);
        }
        self.transition("close", S::CLOSE)?;
        Ok(())
    }

    /// The transport reports the link permanently closed.
    ///
    /// Moves to CLOSED and destructs the Communicator with `error` (`None`
    /// for a clean closure). Returns `false` when there was nothing to tear
    /// down: the connection never got past its opening phase or is already
    /// CLOSED.
    pub fn destructor(&self, error: Option<TetherError>) -> bool {
        if let Err(e) = self.transition("destructor", S::TRANSPORT_CLOSED) {
            debug!("ignoring transport closure: {}", e);
            return false;
        }
        match &error {
            Some(err) => info!("connection closed: {}", err),
            None => info!("connection closed"),
        }
        self.communicator.destructor(error)
    }

    // ------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------

    fn check_joinable(&self, method: &str) -> Result<()> {
        let state = self.state.get();
        if state.is_joinable() {
            Ok(())
        } else {
            Err(TetherError::NotOpen {
                method: method.to_string(),
                state: state.to_string(),
            })
        }
    }

    /// Wait until the connection reaches CLOSED.
    ///
    /// Fails with `NotOpen` if the connection has never been opened. Returns
    /// at once when already CLOSED.
    pub async fn join(&self) -> Result<()> {
        self.check_joinable("join")?;
        self.communicator.join().await
    }

    /// `Ok(true)` once CLOSED, `Ok(false)` if `timeout` elapsed first.
    pub async fn join_for(&self, timeout: Duration) -> Result<bool> {
        self.check_joinable("join")?;
        self.communicator.join_for(timeout).await
    }

    pub async fn join_until(&self, deadline: tokio::time::Instant) -> Result<bool> {
        self.check_joinable("join")?;
        self.communicator.join_until(deadline).await
    }
}

impl<S: Lifecycle, H> std::fmt::Debug for ConnectionBase<S, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBase")
            .field("state", &self.state.get())
            .field("communicator", &self.communicator)
            .finish()
    }
}

/// Stop signal for a transport's reader task.
///
/// The reader keeps a clone, so the signal never reports the sender as
/// dropped; a link only ends when triggered or when the transport itself
/// fails.
#[derive(Clone)]
pub(crate) struct Shutdown(Arc<watch::Sender<bool>>);

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub(crate) fn trigger(&self) {
        self.0.send_replace(true);
    }

    /// Resolves once triggered, immediately if already so.
    pub(crate) async fn wait(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}
