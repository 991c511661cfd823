//! Connection policy for the calculator server.

use crate::calculator;
use serde::{Deserialize, Serialize};
use tether::{AcceptHandler, CloseStatus, Event, EventKind, TcpAcceptor};
use tracing::{debug, info, warn};

/// Header every client sends when connecting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Accepts clients presenting the configured password (any client when
/// none is configured) and serves them the calculator.
pub struct CalculatorHandler {
    password: Option<String>,
}

impl CalculatorHandler {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    fn admits(&self, credentials: &Credentials) -> bool {
        match &self.password {
            Some(expected) => credentials.password.as_deref() == Some(expected.as_str()),
            None => true,
        }
    }
}

#[async_trait::async_trait]
impl AcceptHandler<Credentials> for CalculatorHandler {
    async fn on_connection(&self, acceptor: TcpAcceptor<Credentials>) {
        let peer = acceptor.peer_addr();

        if !self.admits(acceptor.header()) {
            warn!("Rejecting {}: invalid password", peer);
            if let Err(e) = acceptor
                .reject(CloseStatus::POLICY_VIOLATION, "invalid password")
                .await
            {
                debug!("reject {} failed: {}", peer, e);
            }
            return;
        }

        acceptor.on(EventKind::Return, move |event| {
            if let Event::Return(ret) = event {
                debug!(
                    "{} called {} ({})",
                    peer,
                    ret.function.listener,
                    if ret.ret.success { "ok" } else { "failed" }
                );
            }
        });

        match acceptor.accept(calculator::provider()).await {
            Ok(()) => info!("Serving calculator to {}", peer),
            Err(e) => warn!("accept {} failed: {}", peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tether::{Provider, TcpConnector, TcpServer, TetherError};

    #[tokio::test]
    async fn test_open_server_serves_anyone() {
        let mut server = TcpServer::open("127.0.0.1:0", Arc::new(CalculatorHandler::new(None)))
            .await
            .unwrap();

        let connector = TcpConnector::new(Credentials::default(), None::<Provider>);
        connector.connect(server.addr()).await.unwrap();
        let sum = connector
            .driver()
            .invoke("plus", vec![json!(2), json!(3)])
            .await
            .unwrap();
        assert_eq!(sum, json!(5.0));

        connector.close().await.unwrap();
        server.close();
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let handler = CalculatorHandler::new(Some("hunter2".to_string()));
        let mut server = TcpServer::open("127.0.0.1:0", Arc::new(handler))
            .await
            .unwrap();

        let wrong = Credentials {
            password: Some("guess".to_string()),
        };
        let connector = TcpConnector::new(wrong, None::<Provider>);
        let err = connector.connect(server.addr()).await.unwrap_err();
        assert!(matches!(
            err,
            TetherError::Rejected { status: CloseStatus::POLICY_VIOLATION, .. }
        ));

        let right = Credentials {
            password: Some("hunter2".to_string()),
        };
        let connector = TcpConnector::new(right, None::<Provider>);
        connector.connect(server.addr()).await.unwrap();

        server.close();
    }
}
