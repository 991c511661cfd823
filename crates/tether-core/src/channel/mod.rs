//! In-process transport.
//!
//! Two linked [`ChannelPort`]s stand in for a message port pair between
//! workers. Envelopes travel as Rust values; nothing is serialized.
//!
//! # Architecture
//!
//! - **Connector**: sends the Header, waits for the accept/reject reply
//! - **Acceptor**: waits for the Header, lets the application decide
//! - **Reader task**: one per open side, feeds incoming envelopes to the
//!   Communicator and reports closure through the connection's destructor

mod acceptor;
mod connector;

pub use acceptor::ChannelAcceptor;
pub use connector::ChannelConnector;

use crate::communicator::Channel;
use crate::connection::{ConnectionBase, Shutdown};
use crate::error::{Result, TetherError};
use crate::invoke::Invoke;
use crate::state::Lifecycle;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) enum Message<H> {
    Header(H),
    Accepted,
    Rejected { status: u16, reason: String },
    Invoke(Invoke),
    Close,
}

impl<H> Message<H> {
    fn kind(&self) -> &'static str {
        match self {
            Message::Header(_) => "header",
            Message::Accepted => "accepted",
            Message::Rejected { .. } => "rejected",
            Message::Invoke(_) => "invoke",
            Message::Close => "close",
        }
    }
}

/// One end of an in-process link.
pub struct ChannelPort<H> {
    tx: mpsc::UnboundedSender<Message<H>>,
    rx: mpsc::UnboundedReceiver<Message<H>>,
}

impl<H> std::fmt::Debug for ChannelPort<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPort")
            .field("peer_closed", &self.tx.is_closed())
            .finish()
    }
}

/// Create two linked ports: whatever one sends, the other receives.
pub fn endpoints<H>() -> (ChannelPort<H>, ChannelPort<H>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        ChannelPort { tx: b_tx, rx: a_rx },
        ChannelPort { tx: a_tx, rx: b_rx },
    )
}

fn port_dropped(during: &str) -> TetherError {
    TetherError::Disconnected {
        reason: format!("the peer port was dropped {}", during),
    }
}

struct PortChannel<H>(mpsc::UnboundedSender<Message<H>>);

impl<H: Send + 'static> Channel for PortChannel<H> {
    fn send_data(&self, invoke: Invoke) -> Result<()> {
        self.0
            .send(Message::Invoke(invoke))
            .map_err(|_| port_dropped("while sending"))
    }
}

/// The live half of an open side.
struct Link<H> {
    peer: mpsc::UnboundedSender<Message<H>>,
    shutdown: Shutdown,
}

impl<H> Link<H> {
    /// Tell the peer we are leaving and stop our reader.
    fn close(self) {
        let _ = self.peer.send(Message::Close);
        self.shutdown.trigger();
    }
}

/// Bind `port` to `base`: `complete` attaches the outbound channel and moves
/// the connection to OPEN, then the reader starts.
fn open<S, H, F>(base: &ConnectionBase<S, H>, port: ChannelPort<H>, complete: F) -> Result<Link<H>>
where
    S: Lifecycle,
    H: Send + Sync + 'static,
    F: FnOnce(Arc<dyn Channel>) -> Result<()>,
{
    let ChannelPort { tx, rx } = port;
    complete(Arc::new(PortChannel(tx.clone())))?;

    let shutdown = Shutdown::new();
    tokio::spawn(read_loop(base.clone(), rx, shutdown.clone()));
    Ok(Link { peer: tx, shutdown })
}

async fn read_loop<S, H>(
    base: ConnectionBase<S, H>,
    mut rx: mpsc::UnboundedReceiver<Message<H>>,
    shutdown: Shutdown,
) where
    S: Lifecycle,
    H: Send + Sync + 'static,
{
    let error = loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(Message::Invoke(invoke)) => base.communicator().dispatch_incoming(invoke),
                Some(Message::Close) => {
                    debug!("peer closed the channel");
                    break None;
                }
                Some(other) => warn!("ignoring {} message on an open channel", other.kind()),
                None => break Some(port_dropped("while open")),
            },
            _ = shutdown.wait() => break None,
        }
    };
    base.destructor(error);
}
