//! Storage engine for a protobuf schema registry.
//!
//! [`open`] reads a [`Config`], builds the selected backend and hands back a
//! [`Registry`] whose [`storage`](Registry::storage) handle is the single
//! entry point for every capability call in the process.
//!
//! - [`BackendKind::Filesystem`] keeps everything in directories under one
//!   root. It suits tests and single-node installs.
//! - [`BackendKind::RelationalHybrid`] keeps metadata in PostgreSQL (or
//!   SQLite) behind a primary/replica connection manager, file contents in
//!   a content-addressed S3 bucket, and optionally fronts both with a Redis
//!   cache. Replica health is checked in the background until
//!   [`Registry::shutdown`].

pub mod error;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use protoreg_cache::{CacheStore, CachedBackend, Invalidator, RedisCache, RedisSettings, TtlPolicy};
use protoreg_database::{ConnectionManager, ConnectionSettings, PoolSettings, RelationalBackend, spawn_health_routine};
use protoreg_objects::{ObjectStore, S3ObjectStore};
use protoreg_storage::backend::FilesystemBackend;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use protoreg_config::{BackendKind, Config};
pub use protoreg_storage::{Storage, StorageHandle};

struct HealthRoutine {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// An open registry.
///
/// Dropping it stops the background health routine; call
/// [`shutdown`](Self::shutdown) to also close connection pools and wait for
/// the routine to finish.
pub struct Registry {
    storage: StorageHandle,
    kind: BackendKind,
    connections: Option<Arc<ConnectionManager>>,
    health: Option<HealthRoutine>,
}

impl Registry {
    pub fn storage(&self) -> StorageHandle {
        Arc::clone(&self.storage)
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// The connection manager of a relational registry.
    pub fn connections(&self) -> Option<&Arc<ConnectionManager>> {
        self.connections.as_ref()
    }

    /// Stop the health routine and close every connection pool.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(health) = self.health.take() {
            health.cancel.cancel();
            if let Err(e) = health.handle.await {
                tracing::error!(error = %e, "Health routine did not stop cleanly");
            }
        }
        if let Some(connections) = self.connections.take() {
            connections.close().await.or_raise(|| ErrorKind::Shutdown)?;
        }
        tracing::info!("Registry shut down");
        Ok(())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(health) = &self.health {
            health.cancel.cancel();
        }
    }
}

/// Open the backend selected by `config`.
#[tracing::instrument(skip_all, fields(backend = ?config.backend))]
pub async fn open(config: &Config) -> Result<Registry> {
    config.validate().or_raise(|| ErrorKind::Config)?;
    match config.backend {
        BackendKind::Filesystem => open_filesystem(config),
        BackendKind::RelationalHybrid => {
            let objects = open_object_store(config).await?;
            let cache = match config.cache.enabled {
                true => Some(open_cache(config).await?),
                false => None,
            };
            open_relational(config, objects, cache).await
        },
    }
}

fn open_filesystem(config: &Config) -> Result<Registry> {
    if config.cache.enabled {
        tracing::warn!("The filesystem backend has no cache layer; ignoring cache settings");
    }
    let root = &config.filesystem.root;
    let backend = FilesystemBackend::new("filesystem", root).or_raise(|| ErrorKind::Open("filesystem"))?;
    tracing::info!(root = %root.display(), "Filesystem backend ready");
    Ok(Registry {
        storage: Arc::new(backend),
        kind: BackendKind::Filesystem,
        connections: None,
        health: None,
    })
}

async fn open_object_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let settings = &config.object_store;
    let (Some(key_id), Some(key_secret)) = (&settings.access_key_id, &settings.secret_access_key) else {
        exn::bail!(ErrorKind::Config);
    };
    let store = S3ObjectStore::new(
        &settings.bucket,
        &settings.region,
        settings.endpoint.as_deref(),
        key_id,
        key_secret,
        settings.force_path_style,
    )
    .with_namespace(&settings.namespace);
    store.ensure_bucket().await.or_raise(|| ErrorKind::Open("object store"))?;
    Ok(Arc::new(store))
}

async fn open_cache(config: &Config) -> Result<Arc<dyn CacheStore>> {
    let settings = RedisSettings {
        address: config.cache.address.clone(),
        password: config.cache.password.clone(),
        db: config.cache.db,
        pool_size: config.cache.pool_size,
        timeout: config.cache.timeout(),
    };
    let cache = RedisCache::connect(&settings).await.or_raise(|| ErrorKind::Open("cache"))?;
    Ok(Arc::new(cache))
}

/// Open the relational backend over already constructed object and cache
/// stores.
///
/// Applies pending migrations on the primary and starts the replica health
/// routine.
pub async fn open_relational(
    config: &Config,
    objects: Arc<dyn ObjectStore>,
    cache: Option<Arc<dyn CacheStore>>,
) -> Result<Registry> {
    config.validate().or_raise(|| ErrorKind::Config)?;
    let db = &config.database;
    let pool = PoolSettings {
        max_connections: db.max_connections,
        min_connections: db.min_connections,
        connect_timeout: db.connect_timeout(),
        max_lifetime: db.max_lifetime(),
        idle_timeout: db.idle_timeout(),
    };
    let settings = ConnectionSettings::new(&db.primary_url).with_replicas(&db.replica_urls).with_pool(pool);
    let connections =
        Arc::new(ConnectionManager::connect(&settings).await.or_raise(|| ErrorKind::Open("relational"))?);
    protoreg_database::migrate(&connections.primary()).await.or_raise(|| ErrorKind::Migrate)?;

    let backend = RelationalBackend::new("relational", Arc::clone(&connections), objects);
    let storage: StorageHandle = match cache {
        Some(cache) => {
            let backend = backend.with_invalidator(Arc::new(Invalidator::new(Arc::clone(&cache))));
            let cached = CachedBackend::new(backend, cache)
                .with_ttl(TtlPolicy::with_overrides(config.cache.ttl_overrides()));
            if config.cache.warmup
                && let Err(e) = cached.warmup_cache().await
            {
                tracing::warn!(error = %e, "Cache warmup failed; continuing cold");
            }
            Arc::new(cached)
        },
        None => Arc::new(backend),
    };

    let cancel = CancellationToken::new();
    let handle = spawn_health_routine(
        Arc::clone(&connections),
        db.health_check_interval(),
        db.health_check_timeout(),
        cancel.clone(),
    );
    tracing::info!(replicas = connections.replica_count().await, "Relational backend ready");
    Ok(Registry {
        storage,
        kind: BackendKind::RelationalHybrid,
        connections: Some(connections),
        health: Some(HealthRoutine { cancel, handle }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use protoreg_cache::MemoryCache;
    use protoreg_objects::MemoryObjectStore;
    use protoreg_storage::models::{LATEST, Module, ProtoFile, Version};
    use std::time::Duration;

    fn relational_config() -> Config {
        let mut config = Config::default();
        config.backend = BackendKind::RelationalHybrid;
        config.database.primary_url = "sqlite::memory:".into();
        config.database.max_connections = 1;
        config.database.min_connections = 1;
        config.database.max_lifetime_secs = 0;
        config.database.idle_timeout_secs = 0;
        config.object_store.bucket = "schemas".into();
        config.object_store.access_key_id = Some("test".into());
        config.object_store.secret_access_key = Some("test".into());
        config
    }

    async fn publish(storage: &StorageHandle, label: &str) {
        let files = vec![ProtoFile::new("user.proto", "syntax=\"proto3\";message User{}")];
        storage.create_version(&Version::new("acme.users", label, files)).await.unwrap();
        // Creation timestamps must differ for the tie-break to be meaningful.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn test_filesystem_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.filesystem.root = dir.path().join("registry");
        let registry = open(&config).await.unwrap();
        assert_eq!(registry.kind(), BackendKind::Filesystem);
        assert!(registry.connections().is_none());
        let storage = registry.storage();
        storage.create_module(&Module::new("acme.users", "")).await.unwrap();
        publish(&storage, "v1.0.0").await;
        assert_eq!(storage.get_version("acme.users", LATEST).await.unwrap().version, "v1.0.0");
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = relational_config();
        config.database.primary_url.clear();
        let Err(err) = open(&config).await else {
            panic!("opened without a primary");
        };
        assert!(matches!(&*err, ErrorKind::Config));
    }

    #[tokio::test]
    async fn test_relational_registry_resolves_latest() {
        let objects = Arc::new(MemoryObjectStore::new("schemas"));
        let registry = open_relational(&relational_config(), objects, None).await.unwrap();
        let storage = registry.storage();
        storage.create_module(&Module::new("acme.users", "User schemas")).await.unwrap();
        publish(&storage, "v1.0.0").await;
        assert_eq!(storage.get_version("acme.users", LATEST).await.unwrap().version, "v1.0.0");
        publish(&storage, "v1.2.0").await;
        publish(&storage, "v1.10.0").await;
        let latest = storage.get_version("acme.users", LATEST).await.unwrap();
        assert_eq!(latest.version, "v1.10.0");
        assert_eq!(latest.files.len(), 1);
        storage.health_check(Duration::from_secs(1)).await.unwrap();
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cached_relational_registry_invalidates_on_write() {
        let objects = Arc::new(MemoryObjectStore::new("schemas"));
        let cache = Arc::new(MemoryCache::new());
        let mut config = relational_config();
        config.cache.enabled = true;
        let registry = open_relational(&config, objects, Some(cache.clone())).await.unwrap();
        let storage = registry.storage();
        storage.create_module(&Module::new("acme.users", "")).await.unwrap();
        storage.get_module("acme.users").await.unwrap();
        storage.list_modules().await.unwrap();
        storage.list_versions("acme.users").await.unwrap();
        assert_eq!(cache.keys().await.len(), 3);

        publish(&storage, "v1.0.0").await;
        for key in ["versions:acme.users:list", "module:acme.users", "modules:list"] {
            assert!(!cache.contains(key).await, "{key} survived");
        }
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_warmup_at_startup() {
        let objects = Arc::new(MemoryObjectStore::new("schemas"));
        let cache = Arc::new(MemoryCache::new());
        let mut config = relational_config();
        config.cache.enabled = true;
        config.cache.warmup = true;
        // The schema is empty, so warmup only caches the empty module list.
        let registry = open_relational(&config, objects, Some(cache.clone())).await.unwrap();
        assert_eq!(cache.keys().await, ["modules:list"]);
        registry.shutdown().await.unwrap();
    }
}
