use super::{open, port_dropped, ChannelPort, Link, Message};
use crate::acceptor::AcceptorBase;
use crate::config::ProtocolConfig;
use crate::error::{Result, TetherError};
use crate::provider::ProviderSlot;
use std::ops::Deref;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Accepting side of an in-process link.
///
/// Derefs to [`AcceptorBase`] for the Header, driver, events and join.
pub struct ChannelAcceptor<H> {
    base: AcceptorBase<H>,
    port: Mutex<Option<ChannelPort<H>>>,
    link: Mutex<Option<Link<H>>>,
}

impl<H> ChannelAcceptor<H>
where
    H: Send + Sync + 'static,
{
    /// Wait for the peer's Header on `port`. The acceptor starts in NONE.
    pub async fn handshake(port: ChannelPort<H>) -> Result<Self> {
        let ChannelPort { tx, mut rx } = port;
        let header = match tokio::time::timeout(ProtocolConfig::HANDSHAKE_TIMEOUT, rx.recv()).await
        {
            Ok(Some(Message::Header(header))) => header,
            Ok(Some(other)) => {
                return Err(TetherError::Protocol {
                    message: format!("expected a header, got {}", other.kind()),
                })
            }
            Ok(None) => return Err(port_dropped("before sending its header")),
            Err(_) => return Err(TetherError::Timeout(ProtocolConfig::HANDSHAKE_TIMEOUT)),
        };

        Ok(Self {
            base: AcceptorBase::for_header(header),
            port: Mutex::new(Some(ChannelPort { tx, rx })),
            link: Mutex::new(None),
        })
    }

    fn take_port(&self, method: &str) -> Result<ChannelPort<H>> {
        self.port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TetherError::InvalidState {
                method: method.to_string(),
                state: self.base.state().to_string(),
            })
    }

    /// Accept the connection, serving `provider` to the peer.
    pub async fn accept(&self, provider: impl Into<ProviderSlot>) -> Result<()> {
        self.base.begin_accept(provider)?;
        let port = self.take_port("accept")?;

        if port.tx.send(Message::Accepted).is_err() {
            let err = port_dropped("before the accept reply");
            self.base.destructor(Some(err.clone()));
            return Err(err);
        }

        let link = open(&self.base, port, |channel| self.base.complete_accept(channel))?;
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
        info!("channel accepted");
        Ok(())
    }

    /// Refuse the connection. The peer's `connect` fails with `Rejected`.
    pub async fn reject(&self, status: u16, reason: impl Into<String>) -> Result<()> {
        self.base.begin_reject()?;
        let port = self.take_port("reject")?;
        let _ = port.tx.send(Message::Rejected {
            status,
            reason: reason.into(),
        });
        drop(port);
        self.base.destructor(None);
        Ok(())
    }

    /// Close the link and wait until CLOSED.
    pub async fn close(&self) -> Result<()> {
        self.base.begin_close()?;
        if let Some(link) = self.link.lock().unwrap_or_else(PoisonError::into_inner).take() {
            link.close();
        }
        self.base.join().await
    }
}

impl<H> Deref for ChannelAcceptor<H> {
    type Target = AcceptorBase<H>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
