//! Startup and Shutdown Error Types
//!
//! Once the registry is open, every capability call reports
//! [`protoreg_storage::error::ErrorKind`] instead.

use derive_more::{Display, Error};

/// A registry error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for opening and closing the registry.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The configuration is unusable.
    #[display("invalid configuration")]
    Config,
    /// A backend could not be opened.
    #[display("failed to open {_0} backend")]
    Open(#[error(not(source))] &'static str),
    /// Migrations could not be applied.
    #[display("failed to migrate the registry schema")]
    Migrate,
    /// Some resources did not release cleanly.
    #[display("failed to shut down cleanly")]
    Shutdown,
}
