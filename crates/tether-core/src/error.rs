//! Error types for Tether.
//!
//! `TetherError` is what callers observe locally: not-ready guards, remote
//! failures, disconnections and transport problems. `RemoteError` is the
//! plain structure a failed Provider function travels as on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Main error type for Tether.
///
/// Cloneable because a single disconnection is delivered to every call that
/// was still pending on the connection.
#[derive(Debug, Clone, Error)]
pub enum TetherError {
    // Not-ready errors
    #[error("{method}: the connection is not open yet (state: {state})")]
    NotOpen { method: String, state: String },

    #[error("{method}: the connection has been closed (state: {state})")]
    Closed { method: String, state: String },

    #[error("{method}: not allowed in state {state}")]
    InvalidState { method: String, state: String },

    // Disconnection errors
    #[error("Connection has been closed: {reason}")]
    Disconnected { reason: String },

    #[error("Connection rejected ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    // Remote execution errors
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<Arc<serde_json::Error>>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<RemoteError> for TetherError {
    fn from(err: RemoteError) -> Self {
        TetherError::Remote(err)
    }
}

impl TetherError {
    /// The error every pending call receives when a connection ends cleanly.
    pub fn connection_closed() -> Self {
        TetherError::Disconnected {
            reason: "the connection ended before a reply arrived".to_string(),
        }
    }

    /// Check if the caller may reasonably try the same operation again later.
    ///
    /// `NotOpen` means the connection has not reached OPEN yet; everything
    /// tied to CLOSING/CLOSED/REJECTING is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TetherError::NotOpen { .. } | TetherError::Timeout(_))
    }

    /// The remote failure carried by this error, if any.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            TetherError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

/// A failure raised by a Provider function, in transportable form.
///
/// Serializes to `{ "name", "message", "stack"?, ...extra }`, the shape an
/// Error object takes once flattened for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default = "RemoteError::default_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Any additional fields the thrower attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RemoteError {
    fn default_name() -> String {
        "Error".to_string()
    }

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            extra: Map::new(),
        }
    }

    /// A generic `Error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// Argument or member shape mismatch.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// A refused call to a member the path guards forbid.
    pub fn security(message: impl Into<String>) -> Self {
        Self::new("SecurityError", message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Rebuild a remote failure from the value of a failed Return.
    ///
    /// Objects keep their fields; any other value becomes the message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value(value.clone())
                .unwrap_or_else(|_| Self::error(value.to_string())),
            Value::String(message) => Self::error(message),
            other => Self::error(other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::type_error(err.to_string())
    }
}

impl From<TetherError> for RemoteError {
    fn from(err: TetherError) -> Self {
        match err {
            TetherError::Remote(remote) => remote,
            other => RemoteError::error(other.to_string()),
        }
    }
}
