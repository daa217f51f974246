//! Storage contracts for the protoreg schema registry.
//!
//! This crate defines the capability traits every backend implements, the
//! shared data model, `"latest"` resolution, cache key conventions and the
//! single-node [`FilesystemBackend`](backend::FilesystemBackend).

pub mod backend;
pub mod compare;
pub mod deadline;
pub mod error;
pub mod keys;
pub mod models;
mod path;

pub use crate::backend::Storage;
pub use crate::path::normalize as normalize_path;
pub use crate::path::validate as validate_path;
use std::sync::Arc;

/// The one handle per process that callers issue capability calls through.
pub type StorageHandle = Arc<dyn Storage>;
