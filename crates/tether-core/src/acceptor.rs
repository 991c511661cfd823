//! Server-side connection skeleton.
//!
//! An acceptor is created by a transport once the peer's Header arrived.
//! The application then decides exactly once: `accept` with a Provider or
//! `reject` with a status and reason. A second decision fails loudly.

use crate::communicator::Channel;
use crate::connection::ConnectionBase;
use crate::error::Result;
use crate::provider::ProviderSlot;
use crate::state::{AcceptorEvent, AcceptorState};
use std::sync::Arc;

/// The accepting end of a connection. `H` is the Header the peer sent.
pub type AcceptorBase<H> = ConnectionBase<AcceptorState, H>;

impl<H> ConnectionBase<AcceptorState, H> {
    /// Build an acceptor for a peer that sent `header`. No Provider is
    /// installed until `accept`.
    pub fn for_header(header: H) -> Self {
        Self::new(header, ProviderSlot::Unspecified)
    }

    /// NONE -> ACCEPTING, installing `provider`.
    pub fn begin_accept(&self, provider: impl Into<ProviderSlot>) -> Result<()> {
        self.transition("accept", AcceptorEvent::Accept)?;
        self.set_provider(provider);
        Ok(())
    }

    /// The accept reply went out: bind `channel` and move to OPEN.
    pub fn complete_accept(&self, channel: Arc<dyn Channel>) -> Result<()> {
        self.communicator().attach(channel);
        self.transition("accept", AcceptorEvent::AcceptCompleted)?;
        Ok(())
    }

    /// NONE -> REJECTING. The transport sends the rejection, then reports
    /// closure through `destructor`.
    pub fn begin_reject(&self) -> Result<()> {
        self.transition("reject", AcceptorEvent::Reject)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TetherError;
    use crate::invoke::Invoke;
    use crate::provider::Provider;
    use std::time::Duration;

    struct NullChannel;

    impl Channel for NullChannel {
        fn send_data(&self, _invoke: Invoke) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_accept_is_single_shot() {
        let acceptor = AcceptorBase::for_header("guest".to_string());
        assert!(!acceptor.provider().is_present());

        acceptor.begin_accept(Provider::new()).unwrap();
        assert!(acceptor.provider().is_present());
        acceptor.complete_accept(Arc::new(NullChannel)).unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Open);

        let err = acceptor.begin_accept(Provider::new()).unwrap_err();
        assert!(matches!(err, TetherError::InvalidState { .. }));
        assert!(acceptor.begin_reject().is_err());
        assert_eq!(acceptor.state(), AcceptorState::Open);
    }

    #[tokio::test]
    async fn test_reject_then_closed() {
        let acceptor = AcceptorBase::for_header(());
        acceptor.begin_reject().unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Rejecting);
        assert!(matches!(
            acceptor.inspect_ready("call"),
            Some(TetherError::Closed { .. })
        ));
        assert!(acceptor.begin_accept(Provider::new()).is_err());

        // REJECTING is joinable: the wait ends when the link closes.
        assert!(!acceptor.join_for(Duration::from_millis(1)).await.unwrap());
        assert!(acceptor.destructor(None));
        assert_eq!(acceptor.state(), AcceptorState::Closed);
        acceptor.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_while_accepting_is_not_open() {
        let acceptor = AcceptorBase::for_header(());
        acceptor.begin_accept(Provider::new()).unwrap();
        let err = acceptor.join().await.unwrap_err();
        assert!(matches!(err, TetherError::NotOpen { ref state, .. } if state == "ACCEPTING"));
    }
}
