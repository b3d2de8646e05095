//! Error types for pgcursor.
//!
//! The taxonomy has three families that callers usually branch on:
//!
//! - usage errors ([`Error::InvalidUsage`], [`Error::ConnectionClosed`]): the
//!   operation is illegal in the current state and nothing was sent;
//! - operational errors ([`Error::Server`], [`Error::Io`],
//!   [`Error::ConnectionBroken`], [`Error::Protocol`]): the server or the
//!   transport failed;
//! - boundary errors ([`Error::OutOfRange`]): a client-side scroll left the
//!   buffered result set.

use thiserror::Error;

/// Result type for pgcursor operations.
pub type Result<T> = core::result::Result<T, Error>;

/// SQLSTATE raised when a named cursor does not exist.
pub const SQLSTATE_INVALID_CURSOR_NAME: &str = "34000";

/// SQLSTATE raised when the administrator terminated the backend.
pub const SQLSTATE_ADMIN_SHUTDOWN: &str = "57P01";

/// PostgreSQL error/notice fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity
    pub severity_non_localized: Option<String>,
    /// SQLSTATE code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Context/stack trace
    pub where_: Option<String>,
}

impl ErrorFields {
    /// Severity, preferring the non-localized form.
    pub fn severity(&self) -> Option<&str> {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for pgcursor.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response
    #[error("PostgreSQL error: {0}")]
    Server(ErrorFields),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server closed the connection without being asked to
    #[error("server closed the connection unexpectedly")]
    ConnectionBroken,

    /// The connection was already closed (normally or abnormally)
    #[error("connection already closed")]
    ConnectionClosed,

    /// Operation not allowed in the current state
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Client-side scroll or index outside the result set
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Value could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionBroken => true,
            Error::Server(fields) => matches!(fields.severity(), Some("FATAL") | Some("PANIC")),
            _ => false,
        }
    }

    /// Returns true for errors raised before any wire interaction because the
    /// operation was illegal.
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::InvalidUsage(_) | Error::ConnectionClosed)
    }

    /// Returns true for failures that originate from the server or the transport.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            Error::Server(_) | Error::Io(_) | Error::ConnectionBroken | Error::Protocol(_)
        )
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Error::InvalidUsage(msg.into())
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}
