//! Registry configuration.
//!
//! Values are layered, later sources overriding earlier ones:
//! 1. built-in defaults,
//! 2. a configuration file (TOML, YAML or JSON, picked by extension),
//! 3. environment variables prefixed `PROTOREG_`, with `__` separating
//!    nested keys (`PROTOREG_DATABASE__PRIMARY_URL`).
//!
//! ```toml
//! backend = "relational-hybrid"
//!
//! [database]
//! primary_url = "postgres://registry@db-primary/registry"
//! replica_urls = "postgres://registry@db-r1/registry,postgres://registry@db-r2/registry"
//!
//! [object_store]
//! bucket = "schemas"
//! region = "eu-west-1"
//!
//! [cache]
//! enabled = true
//! address = "cache:6379"
//!
//! [cache.ttl]
//! latest = 30
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "PROTOREG_";
const REDACTED: &str = "<redacted>";

/// Which storage backend serves the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Directories on local disk.
    #[default]
    Filesystem,
    /// Relational metadata with content in an object store.
    RelationalHybrid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    pub filesystem: FilesystemConfig,
    pub database: DatabaseConfig,
    pub object_store: ObjectStoreConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Must be absolute.
    pub root: PathBuf,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        let root = ProjectDirs::from("dev", "protoreg", "protoreg")
            .map(|dirs| dirs.data_dir().join("registry"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/protoreg"));
        Self { root }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub primary_url: String,
    /// A list, or one comma-separated string.
    #[serde(deserialize_with = "string_or_list")]
    pub replica_urls: Vec<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    /// Zero disables recycling.
    pub max_lifetime_secs: u64,
    /// Zero disables idle reaping.
    pub idle_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            primary_url: String::new(),
            replica_urls: Vec::new(),
            max_connections: 25,
            min_connections: 5,
            connect_timeout_secs: 10,
            max_lifetime_secs: 300,
            idle_timeout_secs: 300,
            health_check_interval_secs: 30,
            health_check_timeout_secs: 5,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("primary_url", &REDACTED)
            .field("replica_urls", &self.replica_urls.len())
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("health_check_interval_secs", &self.health_check_interval_secs)
            .field("health_check_timeout_secs", &self.health_check_timeout_secs)
            .finish()
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        optional_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        optional_secs(self.idle_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...).
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    /// Prefix for content-addressed keys.
    pub namespace: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: String::new(),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            namespace: "proto-files".to_string(),
        }
    }
}

impl fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| REDACTED))
            .field("force_path_style", &self.force_path_style)
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// `host:port`.
    pub address: String,
    pub password: Option<String>,
    pub db: i64,
    pub pool_size: usize,
    pub timeout_secs: u64,
    /// Load recent data into the cache at startup.
    pub warmup: bool,
    /// TTL overrides in seconds, keyed by entity type (`module`, `latest`, ...).
    pub ttl: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "localhost:6379".to_string(),
            password: None,
            db: 0,
            pool_size: 10,
            timeout_secs: 5,
            warmup: false,
            ttl: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("enabled", &self.enabled)
            .field("address", &self.address)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("db", &self.db)
            .field("pool_size", &self.pool_size)
            .field("timeout_secs", &self.timeout_secs)
            .field("warmup", &self.warmup)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CacheConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn ttl_overrides(&self) -> impl Iterator<Item = (String, Duration)> + '_ {
        self.ttl.iter().map(|(kind, secs)| (kind.clone(), Duration::from_secs(*secs)))
    }
}

fn string_or_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    let urls = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(joined) => joined.split(',').map(str::to_string).collect(),
        OneOrMany::Many(urls) => urls,
    };
    Ok(urls.into_iter().map(|url| url.trim().to_string()).filter(|url| !url.is_empty()).collect())
}

impl Config {
    /// `config.toml` in the platform configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "protoreg", "protoreg").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// The layered sources, without extracting them.
    ///
    /// An explicit `path` must exist; without one, the default location is
    /// used when present.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::Missing(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|path| path.is_file()),
        };
        if let Some(file) = file {
            tracing::debug!(path = %file.display(), "Loading configuration file");
            figment = match file.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(&file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(&file)),
                Some("json") => figment.merge(Json::file(&file)),
                _ => exn::bail!(ErrorKind::Format(file.clone())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(path)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.backend {
            BackendKind::Filesystem => {
                if !self.filesystem.root.is_absolute() {
                    exn::bail!(invalid(format!(
                        "filesystem.root must be absolute, got `{}`",
                        self.filesystem.root.display()
                    )));
                }
            },
            BackendKind::RelationalHybrid => {
                let db = &self.database;
                if db.primary_url.trim().is_empty() {
                    exn::bail!(invalid("database.primary_url is required by the relational-hybrid backend"));
                }
                if db.max_connections == 0 {
                    exn::bail!(invalid("database.max_connections must be at least 1"));
                }
                if db.min_connections > db.max_connections {
                    exn::bail!(invalid(format!(
                        "database.min_connections ({}) exceeds max_connections ({})",
                        db.min_connections, db.max_connections
                    )));
                }
                if db.health_check_interval_secs == 0 || db.health_check_timeout_secs == 0 {
                    exn::bail!(invalid("database health check interval and timeout must be positive"));
                }
                if self.object_store.bucket.trim().is_empty() {
                    exn::bail!(invalid("object_store.bucket is required by the relational-hybrid backend"));
                }
                if self.object_store.access_key_id.is_none() || self.object_store.secret_access_key.is_none() {
                    exn::bail!(invalid("object_store.access_key_id and secret_access_key are required"));
                }
            },
        }
        if self.cache.enabled {
            if self.cache.address.trim().is_empty() {
                exn::bail!(invalid("cache.address is required when the cache is enabled"));
            }
            if self.cache.pool_size == 0 {
                exn::bail!(invalid("cache.pool_size must be at least 1"));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ErrorKind {
    ErrorKind::Invalid(message.into())
}
