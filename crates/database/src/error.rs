//! Database Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Connection targets appear in
//! messages only in redacted form (see
//! [`redact_url`](crate::manager::redact_url)).

use derive_more::{Display, Error};

/// A database error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A query or transaction failed.
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A pool could not be opened or did not answer its first probe.
    #[display("cannot connect to {_0}")]
    Connect(#[error(not(source))] String),
    /// The primary, or every registered replica, failed a health probe.
    #[display("database unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// A probe did not answer before its deadline.
    #[display("operation cancelled: deadline exceeded")]
    Cancelled,
    /// Closing one or more pools failed; the payload lists them.
    #[display("failed to close: {_0}")]
    Close(#[error(not(source))] String),
    /// A stored row could not be converted to or from its model.
    #[display("invalid row data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Connect(_) | Self::Unavailable(_) | Self::Cancelled)
    }
}
