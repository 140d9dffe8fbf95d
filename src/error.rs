//! Error types for pgwire-walstream.
//!
//! All errors in this crate are represented by [`PgWireError`], which covers:
//! - Configuration errors (invalid replication options, detected before any I/O)
//! - Handshake errors (the server rejected a replication command)
//! - Protocol errors (malformed or unexpected messages once streaming)
//! - I/O errors (channel failure, liveness timeouts)
//! - Server errors (ErrorResponse received while streaming)
//! - Use of a stream or client that is already closed

use thiserror::Error;

use crate::protocol::messages::ErrorFields;

/// Error type for all pgwire-walstream operations.
#[derive(Debug, Error, Clone)]
pub enum PgWireError {
    /// Invalid or incomplete replication options.
    #[error("invalid replication options: {field}: {reason}")]
    Config { field: &'static str, reason: String },

    /// The server rejected a replication command; copy mode was not entered
    /// and the connection is still usable.
    #[error("replication command rejected: {0}")]
    Handshake(ErrorFields),

    /// I/O error (network, liveness timeout).
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// Protocol error - malformed message or unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server error - PostgreSQL sent an ErrorResponse mid-stream.
    #[error("server error: {0}")]
    Server(ErrorFields),

    /// The stream (or the client that handed its connection to a stream)
    /// is closed.
    #[error("replication stream closed")]
    Closed,

    /// Task error - worker panicked or terminated unexpectedly.
    #[error("task error: {0}")]
    Task(String),

    /// Internal error - bug in the library.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PgWireError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        PgWireError::Config {
            field,
            reason: reason.into(),
        }
    }

    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, PgWireError::Io(_))
    }

    /// Returns `true` if the server reported an error, either while
    /// negotiating or while streaming.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, PgWireError::Server(_) | PgWireError::Handshake(_))
    }

    /// Returns `true` if this is an options validation error.
    #[inline]
    pub fn is_config(&self) -> bool {
        matches!(self, PgWireError::Config { .. })
    }

    /// Returns `true` if the stream or client was already closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, PgWireError::Closed)
    }

    /// Returns `true` if this error is likely transient and retryable.
    ///
    /// Transient errors include I/O errors and task errors. Non-transient
    /// errors (config, handshake, protocol) typically require changes first.
    pub fn is_transient(&self) -> bool {
        matches!(self, PgWireError::Io(_) | PgWireError::Task(_))
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            PgWireError::Handshake(f) | PgWireError::Server(f) => f.code.as_deref(),
            _ => None,
        }
    }
}

// Manual From impl since io::Error isn't Clone
impl From<std::io::Error> for PgWireError {
    fn from(err: std::io::Error) -> Self {
        PgWireError::Io(err.to_string())
    }
}

/// Result type alias for pgwire-walstream operations.
pub type Result<T> = std::result::Result<T, PgWireError>;
