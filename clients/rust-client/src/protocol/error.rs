use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The three kinds of object the server hands out handles for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Connection,
    Statement,
    Cursor,
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleKind::Connection => write!(f, "connection"),
            HandleKind::Statement => write!(f, "statement"),
            HandleKind::Cursor => write!(f, "cursor"),
        }
    }
}

/// Driver protocol error types
///
/// These travel over the wire inside a failed acknowledgment, so they must
/// stay serializable.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DriverError {
    /// Channel or I/O failure, fatal to the connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Malformed frame or out-of-order acknowledgment
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Error passed through from the local database driver
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Password could not be sealed or unsealed
    #[error("Auth error: {0}")]
    AuthError(String),

    /// Open request did not match the server allow-list
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error("{kind} handle {handle:#010x} not found")]
    HandleNotFound { kind: HandleKind, handle: u32 },

    /// A client-side precondition failed
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Message too large")]
    MessageTooLarge,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl DriverError {
    /// True when the connection can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionError(_) | DriverError::ProtocolError(_)
        )
    }
}
