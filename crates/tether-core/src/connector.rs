//! Client-side connection skeleton.

use crate::communicator::Channel;
use crate::connection::ConnectionBase;
use crate::error::{Result, TetherError};
use crate::state::{ConnectorEvent, ConnectorState};
use std::sync::Arc;
use tracing::warn;

/// The initiating end of a connection. `H` is the Header sent during the
/// handshake.
pub type ConnectorBase<H> = ConnectionBase<ConnectorState, H>;

impl<H> ConnectionBase<ConnectorState, H> {
    /// NONE -> CONNECTING. Any other state fails with `InvalidState`.
    pub fn begin_connect(&self) -> Result<()> {
        self.transition("connect", ConnectorEvent::Connect)?;
        Ok(())
    }

    /// The handshake succeeded: bind `channel` and move to OPEN.
    pub fn complete_connect(&self, channel: Arc<dyn Channel>) -> Result<()> {
        self.communicator().attach(channel);
        self.transition("connect", ConnectorEvent::HandshakeSucceeded)?;
        Ok(())
    }

    /// The handshake failed: revert to NONE and hand `error` back so a
    /// transport can `return Err(base.fail_connect(e))`.
    pub fn fail_connect(&self, error: TetherError) -> TetherError {
        warn!("connect failed: {}", error);
        if let Err(e) = self.transition("connect", ConnectorEvent::HandshakeFailed) {
            warn!("{}", e);
        }
        error
    }
}
