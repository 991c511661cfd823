//! Socket pump shared by both TCP ends.
//!
//! Once the handshake is done the stream is split: a writer task drains the
//! envelopes the Communicator queues, a reader task decodes frames and feeds
//! them back in. The reader owns the connection's fate; when it stops, the
//! connection is destructed, the Communicator drops its queue and the writer
//! shuts the socket down after flushing what was already queued.

use super::protocol::{read_frame, write_frame};
use crate::communicator::Channel;
use crate::connection::{ConnectionBase, Shutdown};
use crate::error::{Result, TetherError};
use crate::invoke::Invoke;
use crate::state::Lifecycle;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct FrameChannel(mpsc::UnboundedSender<Invoke>);

impl Channel for FrameChannel {
    fn send_data(&self, invoke: Invoke) -> Result<()> {
        self.0.send(invoke).map_err(|_| TetherError::Disconnected {
            reason: "the socket writer has stopped".to_string(),
        })
    }
}

/// Start pumping `stream` for `base`. `complete` attaches the outbound
/// channel and moves the connection to OPEN. The returned signal closes the
/// link from this side; `server`, when given, closes it along with every
/// other connection of the same server.
pub(crate) fn open<S, H, F>(
    base: &ConnectionBase<S, H>,
    stream: TcpStream,
    server: Option<Shutdown>,
    complete: F,
) -> Result<Shutdown>
where
    S: Lifecycle,
    H: Send + Sync + 'static,
    F: FnOnce(Arc<dyn Channel>) -> Result<()>,
{
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    complete(Arc::new(FrameChannel(tx)))?;

    tokio::spawn(write_loop(writer, rx));

    let shutdown = Shutdown::new();
    tokio::spawn(read_loop(base.clone(), reader, shutdown.clone(), server));
    Ok(shutdown)
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::UnboundedReceiver<Invoke>) {
    while let Some(invoke) = queue.recv().await {
        let payload = match serde_json::to_vec(&invoke) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("dropping envelope #{}: {}", invoke.uid(), e);
                continue;
            }
        };
        if let Err(e) = write_frame(&mut writer, &payload).await {
            debug!("socket write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<S, H>(
    base: ConnectionBase<S, H>,
    mut reader: OwnedReadHalf,
    shutdown: Shutdown,
    server: Option<Shutdown>,
) where
    S: Lifecycle,
    H: Send + Sync + 'static,
{
    let error = loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(payload)) => match serde_json::from_slice::<Invoke>(&payload) {
                    Ok(invoke) => base.communicator().dispatch_incoming(invoke),
                    Err(e) => warn!("dropping malformed envelope: {}", e),
                },
                Ok(None) => {
                    debug!("peer closed the socket");
                    break None;
                }
                Err(e) => break Some(e),
            },
            _ = shutdown.wait() => break None,
            _ = server_stopped(server.as_ref()) => break None,
        }
    };
    base.destructor(error);
}

async fn server_stopped(server: Option<&Shutdown>) {
    match server {
        Some(server) => server.wait().await,
        None => std::future::pending().await,
    }
}
