//! Centralized configuration for Tether.
//!
//! The engine itself has no knobs; these constants bound the reference
//! transports shipped in `channel` and `ipc`.

use std::time::Duration;

/// Wire-level limits and handshake timing.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Largest accepted IPC frame payload.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// How long an acceptor waits for the connector's header frame.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default bound on a TCP connector's whole connect: socket connection,
    /// header and handshake reply.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Maximum simultaneous connections a TCP server keeps open.
    pub const MAX_CONNECTIONS: usize = 256;
}

/// Status codes carried by a handshake rejection.
///
/// Values follow the WebSocket close-code registry so they survive being
/// forwarded to socket-style transports unchanged.
pub struct CloseStatus;

impl CloseStatus {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const DEFAULT_REJECT: u16 = Self::POLICY_VIOLATION;
}
