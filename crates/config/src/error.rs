//! Configuration Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// An explicitly requested configuration file does not exist.
    #[display("configuration file not found: {}", _0.display())]
    Missing(#[error(not(source))] PathBuf),
    /// The file extension does not name a supported format.
    #[display("unsupported configuration format: {}", _0.display())]
    Format(#[error(not(source))] PathBuf),
    /// A source could not be read or its values do not fit the schema.
    #[display("failed to load configuration")]
    Load,
    /// The configuration loaded but is inconsistent.
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
}
