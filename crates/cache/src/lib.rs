//! Read-through, write-invalidate caching for any storage backend.
//!
//! [`CachedBackend`] wraps a [`Storage`](protoreg_storage::Storage)
//! implementation. Reads consult the cache first and populate it on a miss;
//! writes go to the wrapped backend and then drop every key they made stale.
//! Writes never populate the cache themselves.
//!
//! The cache is an optimisation and never a source of truth: a corrupt
//! entry is deleted and read again from the backend, and an unreachable
//! cache behaves like an empty one.

mod backend;
pub mod error;
#[cfg(any(test, feature = "mock"))]
mod memory;
mod redis;
pub mod ttl;

pub use crate::backend::{CacheStats, CachedBackend, Invalidator};
#[cfg(any(test, feature = "mock"))]
pub use crate::memory::MemoryCache;
pub use crate::redis::{RedisCache, RedisSettings};
pub use crate::ttl::TtlPolicy;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A key/value store with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value that expires after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete the given keys. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Delete every key matching a glob (`*` wildcard), returning how many
    /// were removed.
    async fn delete_matching(&self, pattern: &str) -> Result<usize>;

    /// Drop everything.
    async fn flush(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}
