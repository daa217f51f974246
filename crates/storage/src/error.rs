//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Every backend implementing the
//! storage contract reports failures with these kinds, so callers can map
//! them onto client or server errors without knowing which backend answered.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
///
/// ### Client-correctable
/// - [`ErrorKind::NotFound`]
/// - [`ErrorKind::Validation`]
/// - [`ErrorKind::InvalidPath`]
///
/// ### Deployment mismatch
/// - [`ErrorKind::Unsupported`]
///
/// ### Server-side
/// Everything else. The error tree underneath carries the driver-level cause.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Module, version, file or compiled artifact does not exist.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// A required field is missing or malformed on write.
    #[display("validation failed: {_0}")]
    Validation(#[error(not(source))] String),
    /// The backend does not implement this capability.
    #[display("operation not supported by this backend: {_0}")]
    Unsupported(#[error(not(source))] &'static str),
    /// A dependency (primary, every replica, object store) cannot serve requests.
    #[display("unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// The deadline attached to the operation expired before it completed.
    #[display("operation cancelled: deadline exceeded")]
    Cancelled,
    /// Path contains invalid characters or escapes the version root.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Stored metadata could not be encoded or decoded. The payload names
    /// what was being read or written.
    #[display("serialization error: {_0}")]
    Serialization(#[error(not(source))] String),
    /// Relational store query or transaction failed. The payload names the
    /// operation and the module or version it touched.
    #[display("database error: {_0}")]
    Database(#[error(not(source))] String),
    /// Object store request failed.
    #[display("object store error: {_0}")]
    ObjectStore(#[error(not(source))] String),
    /// Explicit cache operation failed.
    #[display("cache error: {_0}")]
    Cache(#[error(not(source))] String),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    Backend(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Unavailable(_)
                | Self::Cancelled
                | Self::Database(_)
                | Self::ObjectStore(_)
                | Self::Cache(_)
        )
    }

    /// Returns `true` if the caller sent something it can correct (the
    /// equivalent of a 4xx response).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Validation(_) | Self::InvalidPath(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ErrorKind::NotFound("module `a`".into()).is_client_error());
        assert!(ErrorKind::Validation("name".into()).is_client_error());
        assert!(!ErrorKind::Unsupported("content addressing").is_client_error());
        assert!(!ErrorKind::Unsupported("content addressing").is_retryable());
        assert!(ErrorKind::Unavailable("primary".into()).is_retryable());
        assert!(ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_display_does_not_hide_identifiers() {
        let kind = ErrorKind::NotFound("version `acme.users@v1.0.0`".into());
        assert_eq!(kind.to_string(), "not found: version `acme.users@v1.0.0`");
        let kind = ErrorKind::Database("get version `acme.users@v1.0.0`".into());
        assert_eq!(kind.to_string(), "database error: get version `acme.users@v1.0.0`");
    }
}
