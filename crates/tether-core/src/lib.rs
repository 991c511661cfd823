//! Tether - Transport-agnostic bidirectional RPC.
//!
//! Both ends of a connection may expose a [`Provider`] (a tree of named
//! async functions) and call the other side's Provider through a [`Driver`].
//! Calls travel as [`Invoke`] envelopes and are paired with their Returns by
//! a [`Communicator`]; the connection lifecycle lives in [`ConnectorBase`]
//! and [`AcceptorBase`]. Two transports are included: an in-process
//! [`channel`] pair and a TCP transport in [`ipc`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether::{AcceptHandler, Provider, TcpAcceptor, TcpConnector, TcpServer};
//!
//! tether::driver! {
//!     pub struct CalculatorDriver {
//!         fn plus(x: f64, y: f64) -> f64;
//!     }
//! }
//!
//! struct Calculator;
//!
//! #[async_trait::async_trait]
//! impl AcceptHandler<String> for Calculator {
//!     async fn on_connection(&self, acceptor: TcpAcceptor<String>) {
//!         let provider = Provider::new().sync_method("plus", |(x, y): (f64, f64)| Ok(x + y));
//!         let _ = acceptor.accept(provider).await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> tether::Result<()> {
//!     let server = TcpServer::open("127.0.0.1:0", Arc::new(Calculator)).await?;
//!
//!     let connector = TcpConnector::new("guest".to_string(), None::<Provider>);
//!     connector.connect(server.addr()).await?;
//!
//!     let calculator: CalculatorDriver = connector.driver_as();
//!     assert_eq!(calculator.plus(2.0, 3.0).await?, 5.0);
//!
//!     connector.close().await
//! }
//! ```

pub mod acceptor;
pub mod channel;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod connector;
pub mod driver;
pub mod error;
pub mod events;
pub mod invoke;
pub mod ipc;
pub mod path;
pub mod provider;
pub mod state;
pub mod uid;

// Re-export commonly used types
pub use acceptor::AcceptorBase;
pub use channel::{endpoints, ChannelAcceptor, ChannelConnector, ChannelPort};
pub use communicator::{AlwaysReady, Channel, Communicator, Readiness};
pub use config::{CloseStatus, ProtocolConfig};
pub use connection::ConnectionBase;
pub use connector::ConnectorBase;
pub use driver::Driver;
pub use error::{RemoteError, Result, TetherError};
pub use events::{Event, EventKind, ListenerId};
pub use invoke::{Invoke, InvokeFunction, InvokeParameter, InvokeReturn};
pub use ipc::{AcceptHandler, TcpAcceptor, TcpConnector, TcpServer, TcpServerHandle};
pub use provider::{Handler, HandlerFuture, Provider, ProviderSlot};
pub use state::{AcceptorEvent, AcceptorState, ConnectorEvent, ConnectorState, Lifecycle};

// Used by `driver!` expansions in downstream crates.
#[doc(hidden)]
pub use serde_json;
