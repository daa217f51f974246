//! Object Store Error Types
//!
//! The object store never retries internally; [`ErrorKind::is_retryable`]
//! tells the caller whether doing so might help.

use derive_more::{Display, Error};

/// An object store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for object store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No object is stored under the key.
    #[display("object not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Key or content hash is malformed.
    #[display("invalid object key: {_0}")]
    InvalidKey(#[error(not(source))] String),
    /// The request reached the store and failed, or never reached it. The
    /// payload names the operation and key.
    #[display("object store request failed: {_0}")]
    Request(#[error(not(source))] String),
    /// The bucket cannot be reached at all.
    #[display("object store unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// The deadline expired before the store answered.
    #[display("operation cancelled: deadline exceeded")]
    Cancelled,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Unavailable(_) | Self::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
