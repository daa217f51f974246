//! Cache Error Types
//!
//! The cache layer recovers from every one of these on the read path (a
//! failed lookup is a miss). They only reach callers of the explicit cache
//! operations: warmup, flush and pattern invalidation.

use derive_more::{Display, Error};

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Could not establish a connection. The payload never carries
    /// credentials.
    #[display("failed to connect to cache at {_0}")]
    Connect(#[error(not(source))] String),
    /// A command reached the cache and failed.
    #[display("cache command {_0} failed")]
    Command(#[error(not(source))] &'static str),
    /// The cache is not answering at all.
    #[display("cache unavailable")]
    Unavailable,
    /// The command did not complete before its deadline.
    #[display("operation cancelled: deadline exceeded")]
    Cancelled,
    /// A value could not be encoded or decoded.
    #[display("cache payload could not be (de)serialized")]
    Serialization,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization)
    }
}
