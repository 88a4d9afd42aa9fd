//! Error types for the file store
//!
//! Every crate in the workspace reports failures through [`Error`]. The
//! variants follow the store's failure taxonomy: pattern parse errors,
//! I/O errors, on-disk corruption, admission timeouts, and the usual
//! argument/configuration mistakes.

use crate::types::Xid;
use std::path::PathBuf;
use thiserror::Error;

/// Common result type for file store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the file store
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handle closed: {0}")]
    Closed(String),

    #[error("corruption in {path} at offset {offset}: {reason}")]
    Corruption {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("journal belongs to transaction {found}, expected {expected}")]
    XidMismatch { expected: Xid, found: Xid },

    #[error("storage error: {0}")]
    Storage(String),

    // Query errors
    #[error("bad pattern {pattern:?} at {position}: {message}")]
    QueryParse {
        pattern: String,
        position: usize,
        message: String,
    },

    // Identifier errors
    #[error("invalid file store id: {0}")]
    InvalidFsId(String),

    #[error("not found: {0}")]
    NotFound(String),

    // Transaction errors
    #[error("transaction not found: {0}")]
    TransactionNotFound(Xid),

    #[error("transaction still active: {0}")]
    TransactionActive(Xid),

    #[error("recovery failed: {0}")]
    Recovery(String),

    // Admission errors
    #[error("timed out after {waited_ms} ms waiting for {resource}")]
    Timeout { resource: String, waited_ms: u64 },

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a corruption error for a file position
    pub fn corruption(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        Self::Corruption {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Create a pattern parse error
    pub fn query_parse(
        pattern: impl Into<String>,
        position: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::QueryParse {
            pattern: pattern.into(),
            position,
            message: message.into(),
        }
    }

    /// Create an admission timeout error
    pub fn timeout(resource: impl Into<String>, waited: std::time::Duration) -> Self {
        Self::Timeout {
            resource: resource.into(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Check if the caller may retry the operation
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error must abort the enclosing transaction
    /// rather than being retried
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Corruption { .. }
                | Self::XidMismatch { .. }
                | Self::QueryParse { .. }
                | Self::Recovery(_)
                | Self::Internal(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::TransactionNotFound(_))
    }
}

/// Lets `std::io::Write` adapters surface store errors
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            Error::Timeout { .. } => Self::new(std::io::ErrorKind::TimedOut, e),
            other => Self::other(other),
        }
    }
}
