use super::{open, port_dropped, ChannelPort, Link, Message};
use crate::config::ProtocolConfig;
use crate::connector::ConnectorBase;
use crate::error::{Result, TetherError};
use crate::provider::ProviderSlot;
use std::ops::Deref;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Initiating side of an in-process link.
///
/// Derefs to [`ConnectorBase`] for the driver, provider, events and join.
pub struct ChannelConnector<H> {
    base: ConnectorBase<H>,
    link: Mutex<Option<Link<H>>>,
}

impl<H> ChannelConnector<H>
where
    H: Clone + Send + Sync + 'static,
{
    pub fn new(header: H, provider: impl Into<ProviderSlot>) -> Self {
        Self {
            base: ConnectorBase::new(header, provider),
            link: Mutex::new(None),
        }
    }

    /// Send the Header over `port` and wait for the acceptor's decision.
    ///
    /// Fails with `Rejected` if the acceptor refused, `Timeout` if it never
    /// answered; the connector is back in NONE either way.
    pub async fn connect(&self, port: ChannelPort<H>) -> Result<()> {
        self.base.begin_connect()?;

        let ChannelPort { tx, mut rx } = port;
        let handshake = async {
            tx.send(Message::Header(self.base.header().clone()))
                .map_err(|_| port_dropped("before the handshake"))?;
            match rx.recv().await {
                Some(Message::Accepted) => Ok(()),
                Some(Message::Rejected { status, reason }) => {
                    Err(TetherError::Rejected { status, reason })
                }
                Some(other) => Err(TetherError::Protocol {
                    message: format!("expected a handshake reply, got {}", other.kind()),
                }),
                None => Err(port_dropped("during the handshake")),
            }
        };

        match tokio::time::timeout(ProtocolConfig::HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.base.fail_connect(e)),
            Err(_) => {
                return Err(self
                    .base
                    .fail_connect(TetherError::Timeout(ProtocolConfig::HANDSHAKE_TIMEOUT)))
            }
        }

        let link = open(&self.base, ChannelPort { tx, rx }, |channel| {
            self.base.complete_connect(channel)
        })?;
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
        info!("channel connected");
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

impl<H> Deref for ChannelConnector<H> {
    type Target = ConnectorBase<H>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
