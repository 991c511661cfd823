//! Connection lifecycles.
//!
//! Connector:
//!
//! | State      | Entered via                    | Valid next            |
//! |------------|--------------------------------|-----------------------|
//! | NONE       | construction / failed connect  | CONNECTING            |
//! | CONNECTING | connect() start                | OPEN, NONE            |
//! | OPEN       | handshake success              | CLOSING, CLOSED       |
//! | CLOSING    | close() start                  | CLOSED                |
//! | CLOSED     | transport closure signal       | (terminal)            |
//!
//! Acceptor adds REJECTING and ACCEPTING as parallel early states off NONE.
//! OPEN may go straight to CLOSED when the remote side ends the session.
//!
//! Transitions are pure functions; [`StateCell`] applies them atomically and
//! answers the engine's readiness question from the current state.

use crate::communicator::Readiness;
use crate::error::{Result, TetherError};
use std::fmt::{Debug, Display};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// A lifecycle the connection layer can drive.
pub trait Lifecycle: Copy + Eq + Debug + Display + Send + Sync + 'static {
    type Event: Copy + Debug + Send + Sync + 'static;

    const INITIAL: Self;
    const CLOSE: Self::Event;
    const TRANSPORT_CLOSED: Self::Event;

    /// The state `event` leads to, or `None` if the table has no such edge.
    fn next(self, event: Self::Event) -> Option<Self>;

    /// Why calls are not permitted right now; `None` only in OPEN.
    fn readiness_error(self, method: &str) -> Option<TetherError>;

    /// Whether `join` may wait in this state (i.e. the connection got past
    /// its opening phase).
    fn is_joinable(self) -> bool;
}

fn not_open(method: &str, state: impl Display) -> Option<TetherError> {
    Some(TetherError::NotOpen {
        method: method.to_string(),
        state: state.to_string(),
    })
}

fn closed(method: &str, state: impl Display) -> Option<TetherError> {
    Some(TetherError::Closed {
        method: method.to_string(),
        state: state.to_string(),
    })
}

// ============================================================================
// Connector
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ConnectorState {
    None = -1,
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorEvent {
    Connect,
    HandshakeSucceeded,
    HandshakeFailed,
    Close,
    TransportClosed,
}

impl ConnectorState {
    pub const ALL: [ConnectorState; 5] = [
        ConnectorState::None,
        ConnectorState::Connecting,
        ConnectorState::Open,
        ConnectorState::Closing,
        ConnectorState::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::None => "NONE",
            ConnectorState::Connecting => "CONNECTING",
            ConnectorState::Open => "OPEN",
            ConnectorState::Closing => "CLOSING",
            ConnectorState::Closed => "CLOSED",
        }
    }
}

impl ConnectorEvent {
    pub const ALL: [ConnectorEvent; 5] = [
        ConnectorEvent::Connect,
        ConnectorEvent::HandshakeSucceeded,
        ConnectorEvent::HandshakeFailed,
        ConnectorEvent::Close,
        ConnectorEvent::TransportClosed,
    ];
}

impl Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for ConnectorState {
    type Event = ConnectorEvent;

    const INITIAL: Self = ConnectorState::None;
    const CLOSE: ConnectorEvent = ConnectorEvent::Close;
    const TRANSPORT_CLOSED: ConnectorEvent = ConnectorEvent::TransportClosed;

    fn next(self, event: ConnectorEvent) -> Option<Self> {
        use ConnectorEvent as E;
        use ConnectorState as S;

        match (self, event) {
            (S::None, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::HandshakeSucceeded) => Some(S::Open),
            (S::Connecting, E::HandshakeFailed) => Some(S::None),
            (S::Open, E::Close) => Some(S::Closing),
            (S::Open, E::TransportClosed) => Some(S::Closed),
            (S::Closing, E::TransportClosed) => Some(S::Closed),
            _ => None,
        }
    }

    fn readiness_error(self, method: &str) -> Option<TetherError> {
        match self {
            ConnectorState::Open => None,
            ConnectorState::None | ConnectorState::Connecting => not_open(method, self),
            ConnectorState::Closing | ConnectorState::Closed => closed(method, self),
        }
    }

    fn is_joinable(self) -> bool {
        !matches!(self, ConnectorState::None | ConnectorState::Connecting)
    }
}

// ============================================================================
// Acceptor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum AcceptorState {
    Rejecting = -1,
    None = 0,
    Accepting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcceptorEvent {
    Accept,
    AcceptCompleted,
    Reject,
    Close,
    TransportClosed,
}

impl AcceptorState {
    pub const ALL: [AcceptorState; 6] = [
        AcceptorState::Rejecting,
        AcceptorState::None,
        AcceptorState::Accepting,
        AcceptorState::Open,
        AcceptorState::Closing,
        AcceptorState::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AcceptorState::Rejecting => "REJECTING",
            AcceptorState::None => "NONE",
            AcceptorState::Accepting => "ACCEPTING",
            AcceptorState::Open => "OPEN",
            AcceptorState::Closing => "CLOSING",
            AcceptorState::Closed => "CLOSED",
        }
    }
}

impl AcceptorEvent {
    pub const ALL: [AcceptorEvent; 5] = [
        AcceptorEvent::Accept,
        AcceptorEvent::AcceptCompleted,
        AcceptorEvent::Reject,
        AcceptorEvent::Close,
        AcceptorEvent::TransportClosed,
    ];
}

impl Display for AcceptorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for AcceptorState {
    type Event = AcceptorEvent;

    const INITIAL: Self = AcceptorState::None;
    const CLOSE: AcceptorEvent = AcceptorEvent::Close;
    const TRANSPORT_CLOSED: AcceptorEvent = AcceptorEvent::TransportClosed;

    fn next(self, event: AcceptorEvent) -> Option<Self> {
        use AcceptorEvent as E;
        use AcceptorState as S;

        match (self, event) {
            (S::None, E::Accept) => Some(S::Accepting),
            (S::None, E::Reject) => Some(S::Rejecting),
            (S::Accepting, E::AcceptCompleted) => Some(S::Open),
            // The link died before the accept reply went out.
            (S::Accepting, E::TransportClosed) => Some(S::Closed),
            (S::Rejecting, E::TransportClosed) => Some(S::Closed),
            (S::Open, E::Close) => Some(S::Closing),
            (S::Open, E::TransportClosed) => Some(S::Closed),
            (S::Closing, E::TransportClosed) => Some(S::Closed),
            _ => None,
        }
    }

    fn readiness_error(self, method: &str) -> Option<TetherError> {
        match self {
            AcceptorState::Open => None,
            AcceptorState::None | AcceptorState::Accepting => not_open(method, self),
            AcceptorState::Rejecting | AcceptorState::Closing | AcceptorState::Closed => {
                closed(method, self)
            }
        }
    }

    fn is_joinable(self) -> bool {
        !matches!(self, AcceptorState::None | AcceptorState::Accepting)
    }
}

// ============================================================================
// StateCell
// ============================================================================

/// The single mutable state of one connection.
#[derive(Debug)]
pub struct StateCell<S: Lifecycle> {
    state: Mutex<S>,
}

impl<S: Lifecycle> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> S {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `event`, or fail with `InvalidState` naming `method` and the
    /// current state. A refused transition leaves the state untouched.
    pub fn transition(&self, method: &str, event: S::Event) -> Result<S> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.next(event) {
            Some(next) => {
                debug!("{}: {} -> {} ({:?})", method, *state, next, event);
                *state = next;
                Ok(next)
            }
            None => Err(TetherError::InvalidState {
                method: method.to_string(),
                state: state.to_string(),
            }),
        }
    }
}

impl<S: Lifecycle> Readiness for StateCell<S> {
    fn inspect_ready(&self, method: &str) -> Option<TetherError> {
        self.get().readiness_error(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_table() {
        use ConnectorEvent as E;
        use ConnectorState as S;

        let expected = [
            (S::None, E::Connect, S::Connecting),
            (S::Connecting, E::HandshakeSucceeded, S::Open),
            (S::Connecting, E::HandshakeFailed, S::None),
            (S::Open, E::Close, S::Closing),
            (S::Open, E::TransportClosed, S::Closed),
            (S::Closing, E::TransportClosed, S::Closed),
        ];

        for state in S::ALL {
            for event in E::ALL {
                let want = expected
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, next)| *next);
                assert_eq!(state.next(event), want, "{} + {:?}", state, event);
            }
        }
    }

    #[test]
    fn test_acceptor_table() {
        use AcceptorEvent as E;
        use AcceptorState as S;

        let expected = [
            (S::None, E::Accept, S::Accepting),
            (S::None, E::Reject, S::Rejecting),
            (S::Accepting, E::AcceptCompleted, S::Open),
            (S::Accepting, E::TransportClosed, S::Closed),
            (S::Rejecting, E::TransportClosed, S::Closed),
            (S::Open, E::Close, S::Closing),
            (S::Open, E::TransportClosed, S::Closed),
            (S::Closing, E::TransportClosed, S::Closed),
        ];

        for state in S::ALL {
            for event in E::ALL {
                let want = expected
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, next)| *next);
                assert_eq!(state.next(event), want, "{} + {:?}", state, event);
            }
        }
    }

    #[test]
    fn test_connector_readiness_split() {
        for state in ConnectorState::ALL {
            let err = state.readiness_error("call");
            match state {
                ConnectorState::Open => assert!(err.is_none()),
                ConnectorState::None | ConnectorState::Connecting => {
                    assert!(matches!(err, Some(TetherError::NotOpen { .. })))
                }
                ConnectorState::Closing | ConnectorState::Closed => {
                    assert!(matches!(err, Some(TetherError::Closed { .. })))
                }
            }
        }
    }

    #[test]
    fn test_acceptor_readiness_split() {
        for state in AcceptorState::ALL {
            let err = state.readiness_error("call");
            match state {
                AcceptorState::Open => assert!(err.is_none()),
                AcceptorState::None | AcceptorState::Accepting => {
                    assert!(err.unwrap().is_retryable())
                }
                _ => assert!(matches!(err, Some(TetherError::Closed { .. }))),
            }
        }
    }

    #[test]
    fn test_refused_transition_keeps_state() {
        let cell = StateCell::new(AcceptorState::None);
        cell.transition("accept", AcceptorEvent::Accept).unwrap();

        let err = cell.transition("accept", AcceptorEvent::Accept).unwrap_err();
        assert_eq!(err.to_string(), "accept: not allowed in state ACCEPTING");
        assert_eq!(cell.get(), AcceptorState::Accepting);
        assert!(cell.transition("reject", AcceptorEvent::Reject).is_err());
        assert_eq!(cell.get(), AcceptorState::Accepting);
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(ConnectorState::None as i8, -1);
        assert_eq!(ConnectorState::Closed as i8, 3);
        assert_eq!(AcceptorState::Rejecting as i8, -1);
        assert_eq!(AcceptorState::Open as i8, 2);
    }
}
