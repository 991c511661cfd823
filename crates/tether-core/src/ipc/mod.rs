//! TCP transport.
//!
//! Carries Invocation Envelopes between processes as length-prefixed JSON
//! frames over a plain TCP socket.
//!
//! # Architecture
//!
//! - **Server**: accepts sockets, reads each Header, lets the application decide
//! - **Client**: connects, sends the Header, awaits the decision
//! - **Protocol**: framing and handshake messages used by both
//! - **Link**: the reader/writer tasks of an open connection

pub mod client;
mod link;
pub mod protocol;
pub mod server;

pub use client::TcpConnector;
pub use protocol::{HandshakeReply, HandshakeRequest};
pub use server::{AcceptHandler, TcpAcceptor, TcpServer, TcpServerHandle};
