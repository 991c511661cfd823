//! TCP connector.
//!
//! Opens a socket to a [`TcpServer`](super::TcpServer), sends the Header and
//! waits for the acceptor's decision. Once accepted, calls flow both ways
//! over the same socket.

use super::link;
use super::protocol::{read_message, write_message, HandshakeReply, HandshakeRequest};
use crate::config::ProtocolConfig;
use crate::connection::Shutdown;
use crate::connector::ConnectorBase;
use crate::error::{Result, TetherError};
use crate::provider::ProviderSlot;
use serde::Serialize;
use std::ops::Deref;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// Initiating side of a TCP connection.
///
/// Derefs to [`ConnectorBase`] for the driver, provider, events and join.
pub struct TcpConnector<H> {
    base: ConnectorBase<H>,
    connect_timeout: Duration,
    link: Mutex<Option<Shutdown>>,
}

impl<H> TcpConnector<H>
where
    H: Serialize + Send + Sync + 'static,
{
    pub fn new(header: H, provider: impl Into<ProviderSlot>) -> Self {
        Self {
            base: ConnectorBase::new(header, provider),
            connect_timeout: ProtocolConfig::CONNECT_TIMEOUT,
            link: Mutex::new(None),
        }
    }

    /// Bound the socket connection and handshake by `timeout` instead of
    /// [`ProtocolConfig::CONNECT_TIMEOUT`].
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect to `addr` and run the handshake, both within the connect
    /// timeout.
    ///
    /// A refused handshake fails with `Rejected`; an unreachable or silent
    /// server with an I/O error or `Timeout`. The connector is back in NONE
    /// either way.
    pub async fn connect(&self, addr: impl ToSocketAddrs) -> Result<()> {
        self.base.begin_connect()?;

        let attempt = tokio::time::timeout(self.connect_timeout, self.handshake(addr)).await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.base.fail_connect(e)),
            Err(_) => {
                let timeout = TetherError::Timeout(self.connect_timeout);
                return Err(self.base.fail_connect(timeout));
            }
        };
        let peer_addr = stream.peer_addr().ok();

        let shutdown = link::open(&self.base, stream, None, |channel| {
            self.base.complete_connect(channel)
        })?;
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown);

        match peer_addr {
            Some(addr) => info!("connected to {}", addr),
            None => info!("connected"),
        }
        Ok(())
    }

    async fn handshake(&self, addr: impl ToSocketAddrs) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(addr).await?;

        let request = HandshakeRequest {
            header: self.base.header(),
        };
        write_message(&mut stream, &request).await?;
        let reply = read_message::<_, HandshakeReply>(&mut stream)
            .await?
            .ok_or_else(|| TetherError::Disconnected {
                reason: "the server closed the socket during the handshake".to_string(),
            })?;

        debug!("handshake reply: {:?}", reply);
        reply.into_result()?;
        Ok(stream)
    }

    /// Close the socket and wait until CLOSED.
    pub async fn close(&self) -> Result<()> {
        self.base.begin_close()?;
        if let Some(shutdown) = self.link.lock().unwrap_or_else(PoisonError::into_inner).take() {
            shutdown.trigger();
        }
        self.base.join().await
    }
}

impl<H> Deref for TcpConnector<H> {
    type Target = ConnectorBase<H>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<H> std::fmt::Debug for TcpConnector<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector").field("base", &self.base).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::{AcceptHandler, TcpAcceptor, TcpServer};
    use crate::provider::Provider;
    use crate::state::ConnectorState;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;

    struct TestHandler;

    #[async_trait::async_trait]
    impl AcceptHandler<String> for TestHandler {
        async fn on_connection(&self, acceptor: TcpAcceptor<String>) {
            if acceptor.header() == "secret" {
                let provider = Provider::new()
                    .sync_method("ping", |(): ()| Ok("pong"))
                    .sync_method("add", |(a, b): (i64, i64)| Ok(a + b));
                acceptor.accept(provider).await.unwrap();
            } else {
                acceptor.reject(4001, "wrong password").await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_connector_call_success() {
        let mut handle = TcpServer::open("127.0.0.1:0", Arc::new(TestHandler))
            .await
            .unwrap();

        let connector = TcpConnector::new("secret".to_string(), ProviderSlot::Absent);
        connector.connect(handle.addr()).await.unwrap();
        assert_eq!(connector.state(), ConnectorState::Open);

        let driver = connector.driver();
        assert_eq!(driver.invoke("ping", vec![]).await.unwrap(), json!("pong"));
        assert_eq!(
            driver.invoke("add", vec![json!(3), json!(4)]).await.unwrap(),
            json!(7)
        );

        connector.close().await.unwrap();
        assert_eq!(connector.state(), ConnectorState::Closed);
        handle.close();
    }

    #[tokio::test]
    async fn test_rejected_connect_stays_in_none() {
        let mut handle = TcpServer::open("127.0.0.1:0", Arc::new(TestHandler))
            .await
            .unwrap();

        let connector = TcpConnector::new("guess".to_string(), ProviderSlot::Absent);
        let err = connector.connect(handle.addr()).await.unwrap_err();
        assert!(matches!(
            err,
            TetherError::Rejected { status: 4001, ref reason } if reason == "wrong password"
        ));
        assert_eq!(connector.state(), ConnectorState::None);
        assert!(matches!(
            connector.join().await,
            Err(TetherError::NotOpen { .. })
        ));

        handle.close();
    }

    #[tokio::test]
    async fn test_connect_to_dead_server_fails() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let connector = TcpConnector::new("secret".to_string(), ProviderSlot::Absent);

        let err = connector.connect(addr).await.unwrap_err();
        assert!(matches!(err, TetherError::Io { .. } | TetherError::Timeout(_)));
        assert_eq!(connector.state(), ConnectorState::None);
    }

    #[tokio::test]
    async fn test_silent_server_times_out_within_connect_timeout() {
        // Completes the TCP connection but never answers the header.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let limit = Duration::from_millis(200);
        let connector = TcpConnector::new("secret".to_string(), ProviderSlot::Absent)
            .with_connect_timeout(limit);
        let started = std::time::Instant::now();
        let err = connector.connect(addr).await.unwrap_err();

        assert!(matches!(err, TetherError::Timeout(t) if t == limit));
        assert!(started.elapsed() < ProtocolConfig::HANDSHAKE_TIMEOUT);
        assert_eq!(connector.state(), ConnectorState::None);
        silent.abort();
    }

    #[tokio::test]
    async fn test_connector_detects_server_shutdown() {
        let mut handle = TcpServer::open("127.0.0.1:0", Arc::new(TestHandler))
            .await
            .unwrap();

        let connector = TcpConnector::new("secret".to_string(), ProviderSlot::Absent);
        connector.connect(handle.addr()).await.unwrap();
        assert!(connector.driver().invoke("ping", vec![]).await.is_ok());

        handle.close();

        connector.join().await.unwrap();
        assert_eq!(connector.state(), ConnectorState::Closed);
        let err = connector.driver().invoke("ping", vec![]).await.unwrap_err();
        assert!(matches!(err, TetherError::Closed { .. }));
    }
}
