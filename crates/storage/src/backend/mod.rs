//! Storage capability contracts and the filesystem implementation.
//!
//! Each capability is its own narrow trait so a backend (or a test double)
//! can implement exactly the subset it supports. [`Storage`] is the
//! aggregate that the HTTP layer and other collaborators hold; every type
//! implementing all of the capabilities gets it for free.
//!
//! A backend that cannot support a capability still implements its trait,
//! failing every call with [`Unsupported`](crate::error::ErrorKind::Unsupported)
//! rather than silently doing nothing.

mod filesystem;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::filesystem::FilesystemBackend;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockStorage;
use crate::error::Result;
use crate::models::{Module, Page, PageRequest, ProtoFile, Version};
use async_trait::async_trait;
use std::time::Duration;

/// Read access to modules.
#[async_trait]
pub trait ModuleReader: Send + Sync {
    /// Fetch one module by name.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if no module
    /// with that name exists.
    async fn get_module(&self, name: &str) -> Result<Module>;

    /// List every module, ordered by name.
    async fn list_modules(&self) -> Result<Vec<Module>>;

    /// List one page of modules (ordered by name) plus the total count.
    async fn list_modules_paginated(&self, page: PageRequest) -> Result<Page<Module>>;
}

/// Write access to modules.
#[async_trait]
pub trait ModuleWriter: Send + Sync {
    /// Create a module.
    ///
    /// Fails with [`Validation`](crate::error::ErrorKind::Validation) when
    /// required fields are missing. Whether an existing name is an error is
    /// up to the backend.
    async fn create_module(&self, module: &Module) -> Result<()>;
}

/// Read access to versions and their files.
#[async_trait]
pub trait VersionReader: Send + Sync {
    /// Fetch one version with its full file set, ordered by path.
    ///
    /// The label [`LATEST`](crate::models::LATEST) resolves to the greatest
    /// version according to [`compare`](crate::compare::compare).
    async fn get_version(&self, module: &str, version: &str) -> Result<Version>;

    /// List summaries (no file contents) of every version of a module,
    /// oldest first.
    async fn list_versions(&self, module: &str) -> Result<Vec<Version>>;

    /// One page of [`list_versions`](Self::list_versions) plus the total count.
    async fn list_versions_paginated(&self, module: &str, page: PageRequest) -> Result<Page<Version>>;

    /// Fetch a single file of a version (the label may be `"latest"`).
    async fn get_file(&self, module: &str, version: &str, path: &str) -> Result<ProtoFile>;
}

/// Write access to versions.
#[async_trait]
pub trait VersionWriter: Send + Sync {
    /// Create a version.
    ///
    /// Metadata and every file payload are persisted atomically: on failure
    /// nothing about the version becomes visible to readers.
    async fn create_version(&self, version: &Version) -> Result<()>;

    /// Replace the whole file set of an existing version.
    async fn update_version(&self, module: &str, version: &str, files: &[ProtoFile]) -> Result<()>;
}

/// Content-addressed blob storage.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store bytes and return their content hash (hex SHA-256).
    async fn store_content(&self, content: &[u8]) -> Result<String>;

    /// Fetch bytes by content hash.
    async fn fetch_content(&self, hash: &str) -> Result<Vec<u8>>;
}

/// Storage for compiled, language-specific artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn store_compiled(&self, module: &str, version: &str, language: &str, artifact: &[u8]) -> Result<()>;

    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) when no
    /// artifact was stored for that language.
    async fn get_compiled(&self, module: &str, version: &str, language: &str) -> Result<Vec<u8>>;
}

/// Cache invalidation by key glob.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Remove every cache entry matching any of the glob `patterns`.
    ///
    /// Backends without a cache treat this as a no-op.
    async fn invalidate_cache(&self, patterns: &[String]) -> Result<()>;
}

/// Liveness of a backend and everything it depends on.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name of the backend, for logging only.
    fn name(&self) -> &str;

    /// Verify the backend can serve requests, giving up after `timeout`
    /// with [`Cancelled`](crate::error::ErrorKind::Cancelled).
    async fn health_check(&self, timeout: Duration) -> Result<()>;
}

/// The full capability set, as consumed by the HTTP layer.
pub trait Storage:
    ModuleReader
    + ModuleWriter
    + VersionReader
    + VersionWriter
    + ContentStore
    + ArtifactStore
    + CacheInvalidator
    + HealthCheck
{
}
impl<T> Storage for T where
    T: ModuleReader
        + ModuleWriter
        + VersionReader
        + VersionWriter
        + ContentStore
        + ArtifactStore
        + CacheInvalidator
        + HealthCheck
{
}
