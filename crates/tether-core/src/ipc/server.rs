//! TCP server: one [`TcpAcceptor`] per incoming connection.
//!
//! The accept loop reads each peer's handshake frame and hands the resulting
//! acceptor to the application's [`AcceptHandler`]. A connection the handler
//! leaves undecided is rejected once the handler returns.
//!
//! # Thread Safety
//!
//! Each connection is handled in its own spawned task. Closing the server
//! stops the accept loop and closes every connection it accepted.

use super::link;
use super::protocol::{read_message, write_message, HandshakeReply, HandshakeRequest};
use crate::acceptor::AcceptorBase;
use crate::config::{CloseStatus, ProtocolConfig};
use crate::connection::Shutdown;
use crate::error::{Result, TetherError};
use crate::provider::ProviderSlot;
use crate::state::AcceptorState;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Application hook deciding each incoming connection.
#[async_trait::async_trait]
pub trait AcceptHandler<H: Send + Sync + 'static>: Send + Sync + 'static {
    /// Inspect `acceptor.header()` and call `accept` or `reject`.
    async fn on_connection(&self, acceptor: TcpAcceptor<H>);
}

/// Handle to a running server. Dropping closes it.
pub struct TcpServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    connections: Shutdown,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TcpServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting and close every open connection.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.connections.trigger();
    }
}

impl Drop for TcpServerHandle {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub struct TcpServer;

impl TcpServer {
    /// Listen on `addr` (use port 0 for an OS-assigned port).
    pub async fn open<H, A>(addr: impl ToSocketAddrs, handler: Arc<A>) -> Result<TcpServerHandle>
    where
        H: DeserializeOwned + Send + Sync + 'static,
        A: AcceptHandler<H>,
    {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let connections = Shutdown::new();
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            handler,
            shutdown_rx,
            connections.clone(),
            active_connections,
        ));

        Ok(TcpServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            connections,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<H, A>(
        listener: TcpListener,
        handler: Arc<A>,
        mut shutdown_rx: oneshot::Receiver<()>,
        connections: Shutdown,
        active_connections: Arc<AtomicUsize>,
    ) where
        H: DeserializeOwned + Send + Sync + 'static,
        A: AcceptHandler<H>,
    {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= ProtocolConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    ProtocolConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let handler = handler.clone();
                            let conns = active_connections.clone();
                            let connections = connections.clone();

                            tokio::spawn(async move {
                                debug!("connection from {}", peer_addr);
                                Self::handle_connection(stream, peer_addr, &*handler, connections)
                                    .await;
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<H, A>(
        stream: TcpStream,
        peer_addr: SocketAddr,
        handler: &A,
        connections: Shutdown,
    ) where
        H: DeserializeOwned + Send + Sync + 'static,
        A: AcceptHandler<H>,
    {
        let acceptor = match Self::handshake::<H>(stream, peer_addr, connections).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                debug!("handshake with {} failed: {}", peer_addr, e);
                return;
            }
        };

        handler.on_connection(acceptor.clone()).await;

        if acceptor.state() == AcceptorState::None {
            warn!("connection from {} was neither accepted nor rejected", peer_addr);
            if let Err(e) = acceptor
                .reject(CloseStatus::DEFAULT_REJECT, "the connection was not accepted")
                .await
            {
                debug!("rejecting {} failed: {}", peer_addr, e);
            }
        }

        // Hold the connection slot until the link is gone.
        if let Err(e) = acceptor.join().await {
            debug!("connection {} ended: {}", peer_addr, e);
        }
    }

    async fn handshake<H>(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        connections: Shutdown,
    ) -> Result<TcpAcceptor<H>>
    where
        H: DeserializeOwned + Send + Sync + 'static,
    {
        let received = tokio::time::timeout(
            ProtocolConfig::HANDSHAKE_TIMEOUT,
            read_message::<_, HandshakeRequest<H>>(&mut stream),
        )
        .await
        .map_err(|_| TetherError::Timeout(ProtocolConfig::HANDSHAKE_TIMEOUT))?;

        let request = match received {
            Ok(Some(request)) => request,
            Ok(None) => {
                return Err(TetherError::Disconnected {
                    reason: "the peer closed the socket before sending its header".to_string(),
                })
            }
            Err(e @ TetherError::Json { .. }) => {
                let reply = HandshakeReply::rejected(CloseStatus::POLICY_VIOLATION, e.to_string());
                let _ = write_message(&mut stream, &reply).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        Ok(TcpAcceptor {
            inner: Arc::new(AcceptorInner {
                base: AcceptorBase::for_header(request.header),
                peer_addr,
                stream: Mutex::new(Some(stream)),
                link: Mutex::new(None),
                connections,
            }),
        })
    }
}

struct AcceptorInner<H> {
    base: AcceptorBase<H>,
    peer_addr: SocketAddr,
    /// Held until the application decides.
    stream: Mutex<Option<TcpStream>>,
    link: Mutex<Option<Shutdown>>,
    connections: Shutdown,
}

/// Accepting side of one TCP connection.
///
/// Cloning yields another handle to the same connection. Derefs to
/// [`AcceptorBase`] for the Header, driver, events and join.
pub struct TcpAcceptor<H> {
    inner: Arc<AcceptorInner<H>>,
}

impl<H> Clone for TcpAcceptor<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H> TcpAcceptor<H>
where
    H: Send + Sync + 'static,
{
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    fn take_stream(&self, method: &str) -> Result<TcpStream> {
        self.inner
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TetherError::InvalidState {
                method: method.to_string(),
                state: self.inner.base.state().to_string(),
            })
    }

    /// Accept the connection, serving `provider` to the peer.
    pub async fn accept(&self, provider: impl Into<ProviderSlot>) -> Result<()> {
        let base = &self.inner.base;
        base.begin_accept(provider)?;
        let mut stream = self.take_stream("accept")?;

        if let Err(e) = write_message(&mut stream, &HandshakeReply::accepted()).await {
            base.destructor(Some(e.clone()));
            return Err(e);
        }

        let shutdown = link::open(
            base,
            stream,
            Some(self.inner.connections.clone()),
            |channel| base.complete_accept(channel),
        )?;
        *self.inner.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown);
        info!("accepted connection from {}", self.inner.peer_addr);
        Ok(())
    }

    /// Refuse the connection with `status` and `reason`, then close it.
    pub async fn reject(&self, status: u16, reason: impl Into<String>) -> Result<()> {
        let base = &self.inner.base;
        base.begin_reject()?;
        let mut stream = self.take_stream("reject")?;

        let sent = write_message(&mut stream, &HandshakeReply::rejected(status, reason)).await;
        let _ = stream.shutdown().await;
        info!("rejected connection from {} ({})", self.inner.peer_addr, status);

        base.destructor(sent.clone().err());
        sent
    }

    /// Close the connection and wait until CLOSED.
    pub async fn close(&self) -> Result<()> {
        self.inner.base.begin_close()?;
        if let Some(shutdown) = self
            .inner
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            shutdown.trigger();
        }
        self.inner.base.join().await
    }
}

impl<H> Deref for TcpAcceptor<H> {
    type Target = AcceptorBase<H>;

    fn deref(&self) -> &Self::Target {
        &self.inner.base
    }
}

impl<H> std::fmt::Debug for TcpAcceptor<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("peer_addr", &self.inner.peer_addr)
            .field("base", &self.inner.base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::{Invoke, InvokeFunction, InvokeReturn};
    use crate::provider::Provider;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl AcceptHandler<String> for EchoHandler {
        async fn on_connection(&self, acceptor: TcpAcceptor<String>) {
            match acceptor.header().as_str() {
                "let me in" => {
                    let provider = Provider::new()
                        .sync_method("echo", |(v,): (serde_json::Value,)| Ok(v));
                    acceptor.accept(provider).await.unwrap();
                }
                "undecided" => {}
                _ => acceptor.reject(4003, "unknown header").await.unwrap(),
            }
        }
    }

    async fn raw_handshake(addr: SocketAddr, header: &str) -> (TcpStream, HandshakeReply) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &HandshakeRequest { header }).await.unwrap();
        let reply: HandshakeReply = read_message(&mut stream).await.unwrap().unwrap();
        (stream, reply)
    }

    #[tokio::test]
    async fn test_server_open_and_close() {
        let mut handle = TcpServer::open("127.0.0.1:0", Arc::new(EchoHandler))
            .await
            .unwrap();

        assert!(handle.port() > 0);
        assert_eq!(handle.addr().ip(), std::net::Ipv4Addr::LOCALHOST);

        handle.close();
    }

    #[tokio::test]
    async fn test_server_echo_over_raw_frames() {
        let mut handle = TcpServer::open("127.0.0.1:0", Arc::new(EchoHandler))
            .await
            .unwrap();

        let (mut stream, reply) = raw_handshake(handle.addr(), "let me in").await;
        assert_eq!(reply, HandshakeReply::accepted());

        let call = Invoke::from(InvokeFunction::new(41, "echo", vec![json!({"hello": "world"})]));
        write_message(&mut stream, &call).await.unwrap();

        let back: Invoke = read_message(&mut stream).await.unwrap().unwrap();
        assert_eq!(
            back,
            Invoke::from(InvokeReturn::success(41, json!({"hello": "world"})))
        );

        handle.close();
    }

    #[tokio::test]
    async fn test_server_rejects_with_reason() {
        let mut handle = TcpServer::open("127.0.0.1:0", Arc::new(EchoHandler))
            .await
            .unwrap();

        let (mut stream, reply) = raw_handshake(handle.addr(), "who knows").await;
        assert_eq!(reply, HandshakeReply::rejected(4003, "unknown header"));
        assert!(read_message::<_, Invoke>(&mut stream).await.unwrap().is_none());

        let (_, reply) = raw_handshake(handle.addr(), "undecided").await;
        assert_eq!(reply.status, Some(CloseStatus::DEFAULT_REJECT));

        handle.close();
    }

    #[tokio::test]
    async fn test_server_malformed_header_is_policy_violation() {
        let mut handle = TcpServer::open("127.0.0.1:0", Arc::new(EchoHandler))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        write_message(&mut stream, &json!({"header": 42})).await.unwrap();
        let reply: HandshakeReply = read_message(&mut stream).await.unwrap().unwrap();
        assert!(!reply.accepted);
        assert_eq!(reply.status, Some(CloseStatus::POLICY_VIOLATION));

        handle.close();
    }
}
