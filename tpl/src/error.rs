//! TPL2 error types
//!
//! Provides structured error types for TPL2 client operations.
//!
//! Only transport, handshake and caller-facing lookup failures are surfaced
//! as errors. Per-line desync and payload decode problems are recovered inside
//! the dispatcher and only show up in the logs and on the affected command.

use std::time::Duration;
use thiserror::Error;

/// TPL2 client errors
#[derive(Debug, Clone, Error)]
pub enum TplError {
    /// Transport could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Transport open or greeting did not finish in time
    #[error("Connection timeout: no answer from {host}:{port} after {duration:?}")]
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },

    /// Greeting or handshake line could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server refused the credentials
    #[error("Authentication rejected for user '{user}': {reply}")]
    AuthRejected { user: String, reply: String },

    /// Write failed even after one reconnect-and-retry
    ///
    /// `id` is the command that stays registered without ever being sent.
    #[error("I/O error{}: {message}", .id.map(|id| format!(" on command {}", id)).unwrap_or_default())]
    Io { id: Option<u64>, message: String },

    /// No transport session is open
    #[error("Not connected to TPL2 server")]
    NotConnected,

    /// Command id was evicted or never allocated
    #[error("Unknown command id {0}")]
    UnknownCommand(u64),

    /// Command completed without delivering a value
    #[error("Command {id} for '{target}' completed without data")]
    NoData { id: u64, target: String },

    /// Payload for a command could not be decoded to its declared type
    #[error("Command {id} for '{target}' could not be decoded: {message}")]
    Decode {
        id: u64,
        target: String,
        message: String,
    },

    /// Blocking wait ran out of time; the command may still complete later
    #[error("Command {id} for '{target}' did not complete within {duration:?}")]
    WaitTimeout {
        id: u64,
        target: String,
        duration: Duration,
    },
}

impl TplError {
    /// Whether the error only means "outcome unknown yet"
    pub fn is_timeout(&self) -> bool {
        matches!(self, TplError::WaitTimeout { .. })
    }

    /// Whether the session is unusable until the caller reconnects
    pub fn is_fatal(&self) -> bool {
        match self {
            TplError::ConnectionFailed(_)
            | TplError::ConnectionTimeout { .. }
            | TplError::Protocol(_)
            | TplError::AuthRejected { .. }
            | TplError::NotConnected => true,
            TplError::Io { .. }
            | TplError::UnknownCommand(_)
            | TplError::NoData { .. }
            | TplError::Decode { .. }
            | TplError::WaitTimeout { .. } => false,
        }
    }
}

impl From<std::io::Error> for TplError {
    fn from(err: std::io::Error) -> Self {
        TplError::Io {
            id: None,
            message: err.to_string(),
        }
    }
}

impl From<TplError> for String {
    fn from(err: TplError) -> String {
        err.to_string()
    }
}

/// Result type for TPL2 operations
pub type TplResult<T> = Result<T, TplError>;
