//! The caching decorator.

use crate::CacheStore;
use crate::ttl::{self, TtlPolicy};
use async_trait::async_trait;
use exn::ResultExt;
use protoreg_storage::Storage;
use protoreg_storage::backend::{
    ArtifactStore, CacheInvalidator, ContentStore, HealthCheck, ModuleReader, ModuleWriter, VersionReader,
    VersionWriter,
};
use protoreg_storage::error::{ErrorKind, Result};
use protoreg_storage::keys;
use protoreg_storage::models::{LATEST, Module, Page, PageRequest, ProtoFile, Version};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How many of each module's most recent versions [`CachedBackend::warmup_cache`]
/// loads.
const WARMUP_VERSIONS_PER_MODULE: usize = 5;

/// How a cached value is laid out in the store.
trait Entry: Sized {
    fn encode(&self) -> serde_json::Result<Vec<u8>>;
    fn decode(bytes: Vec<u8>) -> serde_json::Result<Self>;
}

macro_rules! json_entry {
    ($($ty:ty),+ $(,)?) => {$(
        impl Entry for $ty {
            fn encode(&self) -> serde_json::Result<Vec<u8>> {
                serde_json::to_vec(self)
            }
            fn decode(bytes: Vec<u8>) -> serde_json::Result<Self> {
                serde_json::from_slice(&bytes)
            }
        }
    )+};
}
json_entry!(Module, Vec<Module>, Version, Vec<Version>, ProtoFile);

/// Blobs and artifacts are stored as-is.
impl Entry for Vec<u8> {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        Ok(self.clone())
    }
    fn decode(bytes: Vec<u8>) -> serde_json::Result<Self> {
        Ok(bytes)
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Failed lookups or stores plus discarded corrupt entries.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Wraps a backend with a read-through, write-invalidate cache.
pub struct CachedBackend<B> {
    inner: B,
    cache: Arc<dyn CacheStore>,
    ttl: TtlPolicy,
    counters: Counters,
}

impl<B: Storage> CachedBackend<B> {
    pub fn new(inner: B, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            cache,
            ttl: TtlPolicy::default(),
            counters: Counters::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// The live TTL policy; changes apply to the next cache write.
    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    fn error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    async fn lookup<T: Entry>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(bytes)) => match T::decode(bytes) {
                Ok(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key, "Cache hit");
                    Some(value)
                },
                Err(e) => {
                    self.error();
                    tracing::warn!(key, error = %e, "Discarding corrupt cache entry");
                    if let Err(e) = self.cache.delete(&[key.to_string()]).await {
                        tracing::warn!(key, error = %e, "Failed to delete corrupt cache entry");
                    }
                    None
                },
            },
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "Cache miss");
                None
            },
            Err(e) => {
                self.error();
                tracing::warn!(key, error = %e, "Cache lookup failed, reading through");
                None
            },
        }
    }

    async fn store<T: Entry>(&self, key: &str, ttl: Duration, value: &T) {
        if ttl.is_zero() {
            return;
        }
        let bytes = match value.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.error();
                tracing::warn!(key, error = %e, "Failed to encode cache entry");
                return;
            },
        };
        if let Err(e) = self.cache.set(key, &bytes, ttl).await {
            self.error();
            tracing::warn!(key, error = %e, "Failed to populate cache");
        }
    }

    /// Serve `key` from the cache, or run `load` and cache its result for
    /// the TTL of `kind`. A zero TTL bypasses the cache entirely.
    async fn cached<T, F>(&self, key: String, kind: &str, load: F) -> Result<T>
    where
        T: Entry + Send + Sync,
        F: Future<Output = Result<T>> + Send,
    {
        let ttl = self.ttl.get(kind);
        if ttl.is_zero() {
            return load.await;
        }
        if let Some(hit) = self.lookup(&key).await {
            return Ok(hit);
        }
        let value = load.await?;
        self.store(&key, ttl, &value).await;
        Ok(value)
    }

    /// Drop keys made stale by a successful write. Failures are logged: the
    /// write itself has already succeeded.
    async fn forget(&self, keys: &[String], patterns: &[String]) {
        if let Err(e) = self.cache.delete(keys).await {
            self.error();
            tracing::warn!(error = %e, ?keys, "Failed to invalidate cache keys; entries stay stale until they expire");
        }
        for pattern in patterns {
            if let Err(e) = self.cache.delete_matching(pattern).await {
                self.error();
                tracing::warn!(error = %e, pattern, "Failed to invalidate cache pattern");
            }
        }
    }

    async fn forget_version(&self, module: &str, version: &str) {
        let patterns = keys::version_write_patterns(module, version);
        self.forget(&keys::version_write(module, version), &patterns).await;
    }

    /// Load every module, its version list and its most recent versions
    /// into the cache.
    #[tracing::instrument(skip_all)]
    pub async fn warmup_cache(&self) -> Result<()> {
        let modules = self.inner.list_modules().await?;
        self.store(keys::MODULES_LIST, self.ttl.get(ttl::MODULE), &modules).await;
        let mut warmed = 0;
        for module in &modules {
            self.store(&keys::module(&module.name), self.ttl.get(ttl::MODULE), module).await;
            let mut versions = self.inner.list_versions(&module.name).await?;
            self.store(&keys::versions_list(&module.name), self.ttl.get(ttl::VERSION_LIST), &versions)
                .await;
            versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            for summary in versions.iter().take(WARMUP_VERSIONS_PER_MODULE) {
                let version = self.inner.get_version(&module.name, &summary.version).await?;
                let key = keys::version(&module.name, &version.version);
                self.store(&key, self.ttl.get(ttl::VERSION_FULL), &version).await;
                warmed += 1;
            }
        }
        tracing::info!(modules = modules.len(), versions = warmed, "Cache warmed up");
        Ok(())
    }

    /// Flush the whole cache.
    pub async fn invalidate_all(&self) -> Result<()> {
        self.cache.flush().await.or_raise(|| ErrorKind::Cache("flush".to_string()))?;
        tracing::info!("Cache flushed");
        Ok(())
    }
}

fn is_glob(key: &str) -> bool {
    key.contains(['*', '?', '['])
}

fn version_kind(version: &str) -> &'static str {
    match version {
        LATEST => ttl::LATEST,
        _ => ttl::VERSION_FULL,
    }
}

fn compiled_kind(version: &str) -> &'static str {
    match version {
        LATEST => ttl::LATEST,
        _ => ttl::COMPILED,
    }
}

fn file_kind(version: &str) -> &'static str {
    match version {
        LATEST => ttl::LATEST,
        _ => ttl::PROTO_CONTENT,
    }
}

#[async_trait]
impl<B: Storage> ModuleReader for CachedBackend<B> {
    async fn get_module(&self, name: &str) -> Result<Module> {
        self.cached(keys::module(name), ttl::MODULE, self.inner.get_module(name)).await
    }

    async fn list_modules(&self) -> Result<Vec<Module>> {
        self.cached(keys::MODULES_LIST.to_string(), ttl::MODULE, self.inner.list_modules()).await
    }

    async fn list_modules_paginated(&self, page: PageRequest) -> Result<Page<Module>> {
        Ok(page.slice(self.list_modules().await?))
    }
}

#[async_trait]
impl<B: Storage> ModuleWriter for CachedBackend<B> {
    async fn create_module(&self, module: &Module) -> Result<()> {
        self.inner.create_module(module).await?;
        self.forget(&keys::module_write(&module.name), &[]).await;
        Ok(())
    }
}

#[async_trait]
impl<B: Storage> VersionReader for CachedBackend<B> {
    async fn get_version(&self, module: &str, version: &str) -> Result<Version> {
        let load = self.inner.get_version(module, version);
        self.cached(keys::version(module, version), version_kind(version), load).await
    }

    async fn list_versions(&self, module: &str) -> Result<Vec<Version>> {
        self.cached(keys::versions_list(module), ttl::VERSION_LIST, self.inner.list_versions(module)).await
    }

    async fn list_versions_paginated(&self, module: &str, page: PageRequest) -> Result<Page<Version>> {
        Ok(page.slice(self.list_versions(module).await?))
    }

    async fn get_file(&self, module: &str, version: &str, path: &str) -> Result<ProtoFile> {
        let load = self.inner.get_file(module, version, path);
        self.cached(keys::file(module, version, path), file_kind(version), load).await
    }
}

#[async_trait]
impl<B: Storage> VersionWriter for CachedBackend<B> {
    async fn create_version(&self, version: &Version) -> Result<()> {
        self.inner.create_version(version).await?;
        self.forget_version(&version.module, &version.version).await;
        Ok(())
    }

    async fn update_version(&self, module: &str, version: &str, files: &[ProtoFile]) -> Result<()> {
        self.inner.update_version(module, version, files).await?;
        self.forget_version(module, version).await;
        Ok(())
    }
}

#[async_trait]
impl<B: Storage> ContentStore for CachedBackend<B> {
    async fn store_content(&self, content: &[u8]) -> Result<String> {
        self.inner.store_content(content).await
    }

    async fn fetch_content(&self, hash: &str) -> Result<Vec<u8>> {
        self.cached(keys::content(hash), ttl::PROTO_CONTENT, self.inner.fetch_content(hash)).await
    }
}

#[async_trait]
impl<B: Storage> ArtifactStore for CachedBackend<B> {
    async fn store_compiled(&self, module: &str, version: &str, language: &str, artifact: &[u8]) -> Result<()> {
        self.inner.store_compiled(module, version, language, artifact).await?;
        let stale = [keys::compiled(module, version, language), keys::compiled(module, LATEST, language)];
        self.forget(&stale, &[]).await;
        Ok(())
    }

    async fn get_compiled(&self, module: &str, version: &str, language: &str) -> Result<Vec<u8>> {
        let load = self.inner.get_compiled(module, version, language);
        self.cached(keys::compiled(module, version, language), compiled_kind(version), load).await
    }
}

#[async_trait]
impl<B: Storage> CacheInvalidator for CachedBackend<B> {
    async fn invalidate_cache(&self, patterns: &[String]) -> Result<()> {
        Invalidator::new(Arc::clone(&self.cache)).invalidate_cache(patterns).await
    }
}

#[async_trait]
impl<B: Storage> HealthCheck for CachedBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    /// Only the wrapped backend decides health; an unreachable cache
    /// degrades performance but not correctness.
    async fn health_check(&self, timeout: Duration) -> Result<()> {
        let (inner, cache) = tokio::join!(
            self.inner.health_check(timeout),
            tokio::time::timeout(timeout, self.cache.ping())
        );
        match cache {
            Ok(Ok(())) => {},
            Ok(Err(e)) => tracing::warn!(error = %e, "Cache is unreachable; serving uncached"),
            Err(_elapsed) => tracing::warn!("Cache ping timed out; serving uncached"),
        }
        inner
    }
}

/// Deletes cache entries on behalf of a backend that signals its own
/// commits. Exact keys are deleted directly; only glob patterns are matched.
pub struct Invalidator {
    cache: Arc<dyn CacheStore>,
}

impl Invalidator {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CacheInvalidator for Invalidator {
    async fn invalidate_cache(&self, patterns: &[String]) -> Result<()> {
        let (globs, exact): (Vec<&String>, Vec<&String>) = patterns.iter().partition(|p| is_glob(p));
        let exact: Vec<String> = exact.into_iter().cloned().collect();
        self.cache
            .delete(&exact)
            .await
            .or_raise(|| ErrorKind::Cache(format!("delete {} keys", exact.len())))?;
        let mut removed = 0;
        for pattern in globs {
            removed += self
                .cache
                .delete_matching(pattern)
                .await
                .or_raise(|| ErrorKind::Cache(format!("delete `{pattern}`")))?;
        }
        tracing::debug!(keys = exact.len(), matched = removed, "Invalidated cache entries");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryCache;
    use protoreg_storage::backend::MockStorage;
    use time::Duration as TimeDuration;

    struct Fixture {
        backend: CachedBackend<MockStorage>,
        cache: Arc<MemoryCache>,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(MemoryCache::new());
        let storage = MockStorage::with_modules([Module::new("acme.users", "User schemas")]);
        Fixture {
            backend: CachedBackend::new(storage, cache.clone()),
            cache,
        }
    }

    fn version(label: &str, offset_secs: i64) -> Version {
        let mut version = Version::new("acme.users", label, vec![ProtoFile::new("user.proto", label)]);
        version.created_at += TimeDuration::seconds(offset_secs);
        version
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_cache() {
        let fixture = fixture();
        let first = fixture.backend.get_module("acme.users").await.unwrap();
        let second = fixture.backend.get_module("acme.users").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fixture.backend.inner().calls("get_module"), 1);
        assert_eq!(fixture.backend.stats(), CacheStats { hits: 1, misses: 1, errors: 0 });
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let fixture = fixture();
        assert!(fixture.backend.get_module("acme.orders").await.unwrap_err().is_not_found());
        assert!(fixture.backend.get_module("acme.orders").await.unwrap_err().is_not_found());
        assert_eq!(fixture.backend.inner().calls("get_module"), 2);
        assert!(!fixture.cache.contains("module:acme.orders").await);
    }

    #[tokio::test]
    async fn test_create_version_invalidates() {
        let fixture = fixture();
        fixture.backend.create_version(&version("v1.0.0", 0)).await.unwrap();
        fixture.backend.get_module("acme.users").await.unwrap();
        fixture.backend.list_modules().await.unwrap();
        fixture.backend.list_versions("acme.users").await.unwrap();
        fixture.backend.get_version("acme.users", LATEST).await.unwrap();
        fixture.backend.get_file("acme.users", LATEST, "user.proto").await.unwrap();
        assert_eq!(fixture.cache.keys().await.len(), 5);

        fixture.backend.create_version(&version("v1.1.0", 1)).await.unwrap();
        for key in [
            "versions:acme.users:list",
            "module:acme.users",
            "modules:list",
            "version:acme.users:latest",
            "file:acme.users:latest:user.proto",
        ] {
            assert!(!fixture.cache.contains(key).await, "{key} survived");
        }
        let latest = fixture.backend.get_version("acme.users", LATEST).await.unwrap();
        assert_eq!(latest.version, "v1.1.0");
    }

    #[tokio::test]
    async fn test_compiled_artifact_under_latest() {
        let fixture = fixture();
        fixture.backend.create_version(&version("v1.0.0", 0)).await.unwrap();
        fixture.backend.store_compiled("acme.users", LATEST, "go", b"first").await.unwrap();
        assert_eq!(fixture.backend.get_compiled("acme.users", LATEST, "go").await.unwrap(), b"first");
        assert!(fixture.cache.contains("compiled:acme.users:latest:go").await);

        fixture.backend.store_compiled("acme.users", "v1.0.0", "go", b"second").await.unwrap();
        assert!(!fixture.cache.contains("compiled:acme.users:latest:go").await);
        assert_eq!(fixture.backend.get_compiled("acme.users", LATEST, "go").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_writes_do_not_populate() {
        let fixture = fixture();
        fixture.backend.create_module(&Module::new("acme.orders", "")).await.unwrap();
        fixture.backend.create_version(&version("v1.0.0", 0)).await.unwrap();
        assert!(fixture.cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cache() {
        let fixture = fixture();
        fixture.backend.get_module("acme.users").await.unwrap();
        let mut orphan = version("v1.0.0", 0);
        orphan.module = "acme.orders".into();
        assert!(fixture.backend.create_version(&orphan).await.is_err());
        assert!(fixture.cache.contains("module:acme.users").await);
    }

    #[tokio::test]
    async fn test_update_version_drops_cached_files() {
        let fixture = fixture();
        fixture.backend.create_version(&version("v1.0.0", 0)).await.unwrap();
        let file = fixture.backend.get_file("acme.users", "v1.0.0", "user.proto").await.unwrap();
        assert_eq!(file.content, "v1.0.0");
        fixture
            .backend
            .update_version("acme.users", "v1.0.0", &[ProtoFile::new("user.proto", "patched")])
            .await
            .unwrap();
        assert!(fixture.cache.keys().await.is_empty());
        let file = fixture.backend.get_file("acme.users", "v1.0.0", "user.proto").await.unwrap();
        assert_eq!(file.content, "patched");
    }

    #[tokio::test]
    async fn test_corrupt_entry_falls_through() {
        let fixture = fixture();
        fixture.cache.insert_raw("module:acme.users", "{not json").await;
        let module = fixture.backend.get_module("acme.users").await.unwrap();
        assert_eq!(module.description, "User schemas");
        assert_eq!(fixture.backend.inner().calls("get_module"), 1);
        assert_eq!(fixture.backend.stats().errors, 1);
        // The good value replaced the corrupt one.
        fixture.backend.get_module("acme.users").await.unwrap();
        assert_eq!(fixture.backend.inner().calls("get_module"), 1);
    }

    #[tokio::test]
    async fn test_unavailable_cache_reads_through() {
        let fixture = fixture();
        fixture.cache.set_available(false);
        fixture.backend.get_module("acme.users").await.unwrap();
        fixture.backend.get_module("acme.users").await.unwrap();
        assert_eq!(fixture.backend.inner().calls("get_module"), 2);
        fixture.backend.create_module(&Module::new("acme.orders", "")).await.unwrap();
        fixture.backend.health_check(Duration::from_secs(1)).await.unwrap();
        assert!(fixture.backend.invalidate_all().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_by_kind() {
        let fixture = fixture();
        fixture.backend.create_version(&version("v1.0.0", 0)).await.unwrap();
        fixture.backend.get_version("acme.users", LATEST).await.unwrap();
        fixture.backend.get_version("acme.users", "v1.0.0").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!fixture.cache.contains("version:acme.users:latest").await);
        assert!(fixture.cache.contains("version:acme.users:v1.0.0").await);
    }

    #[tokio::test]
    async fn test_zero_ttl_bypasses_cache() {
        let fixture = fixture();
        fixture.backend.ttl().set(ttl::MODULE, Duration::ZERO);
        fixture.backend.get_module("acme.users").await.unwrap();
        fixture.backend.get_module("acme.users").await.unwrap();
        assert_eq!(fixture.backend.inner().calls("get_module"), 2);
        assert!(fixture.cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_paginated_lists_share_the_cached_list() {
        let fixture = fixture();
        fixture.backend.create_module(&Module::new("acme.billing", "")).await.unwrap();
        let page = fixture.backend.list_modules_paginated(PageRequest::new(1, 1)).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].name, "acme.users");
        fixture.backend.list_modules_paginated(PageRequest::new(1, 0)).await.unwrap();
        assert_eq!(fixture.backend.inner().calls("list_modules"), 1);
    }

    #[tokio::test]
    async fn test_warmup_loads_recent_versions() {
        let fixture = fixture();
        for i in 0..7 {
            fixture.backend.create_version(&version(&format!("v1.{i}.0"), i)).await.unwrap();
        }
        fixture.backend.warmup_cache().await.unwrap();
        let keys = fixture.cache.keys().await;
        assert!(keys.iter().any(|k| k == "modules:list"));
        assert!(keys.iter().any(|k| k == "versions:acme.users:list"));
        let versions: Vec<&String> = keys.iter().filter(|k| k.starts_with("version:")).collect();
        assert_eq!(versions.len(), WARMUP_VERSIONS_PER_MODULE);
        assert!(!keys.iter().any(|k| k == "version:acme.users:v1.0.0"));
        assert!(keys.iter().any(|k| k == "version:acme.users:v1.6.0"));

        fixture.backend.invalidate_all().await.unwrap();
        assert!(fixture.cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_cache_by_pattern() {
        let fixture = fixture();
        fixture.backend.create_version(&version("v1.0.0", 0)).await.unwrap();
        fixture.backend.get_module("acme.users").await.unwrap();
        fixture.backend.get_file("acme.users", "v1.0.0", "user.proto").await.unwrap();
        fixture.backend.invalidate_cache(&["file:acme.users:*".to_string()]).await.unwrap();
        assert_eq!(fixture.cache.keys().await, ["module:acme.users"]);
    }

    #[tokio::test]
    async fn test_exact_keys_skip_pattern_matching() {
        let cache = Arc::new(MemoryCache::new());
        for key in ["module:acme.users", "modules:list", "file:acme.users:v1:a.proto", "file:acme.users:v1:b.proto"] {
            cache.insert_raw(key, "{}").await;
        }
        let invalidator = Invalidator::new(cache.clone());
        let stale = keys::module_write("acme.users");
        invalidator.invalidate_cache(&stale).await.unwrap();
        assert_eq!(cache.scans(), 0);
        assert_eq!(cache.keys().await.len(), 2);

        invalidator.invalidate_cache(&keys::version_write_patterns("acme.users", "v1")).await.unwrap();
        assert!(cache.scans() > 0);
        assert!(cache.keys().await.is_empty());
    }
}
