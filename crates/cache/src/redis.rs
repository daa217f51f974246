//! Redis-backed [`CacheStore`].

use crate::CacheStore;
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue};
use std::fmt;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

/// Where and how to reach Redis.
#[derive(Clone)]
pub struct RedisSettings {
    /// `host:port`.
    pub address: String,
    pub password: Option<String>,
    /// Logical database index.
    pub db: i64,
    /// Commands allowed in flight at once.
    pub pool_size: usize,
    /// Deadline for connecting and for each command.
    pub timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            address: "localhost:6379".to_string(),
            password: None,
            db: 0,
            pool_size: 10,
            timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSettings")
            .field("address", &self.address)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("pool_size", &self.pool_size)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisSettings {
    fn url(&self) -> String {
        let auth = match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(":{}@", encode_userinfo(password)),
            _ => String::new(),
        };
        format!("redis://{auth}{}/{}", self.address, self.db)
    }
}

/// Percent-encode everything outside the URL "unreserved" set.
fn encode_userinfo(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => char::from(b).to_string(),
            _ => format!("%{b:02X}"),
        })
        .collect()
}

/// A Redis cache over one multiplexed, auto-reconnecting connection.
pub struct RedisCache {
    connection: ConnectionManager,
    permits: Semaphore,
    timeout: Duration,
}

impl RedisCache {
    /// Connect and verify the server answers `PING`.
    #[tracing::instrument(skip_all, fields(address = %settings.address, db = settings.db))]
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let client =
            redis::Client::open(settings.url()).or_raise(|| ErrorKind::Connect(settings.address.clone()))?;
        let connection = tokio::time::timeout(settings.timeout, ConnectionManager::new(client))
            .await
            .or_raise(|| ErrorKind::Connect(settings.address.clone()))?
            .or_raise(|| ErrorKind::Connect(settings.address.clone()))?;
        let cache = Self {
            connection,
            permits: Semaphore::new(settings.pool_size.max(1)),
            timeout: settings.timeout,
        };
        cache.ping().await.or_raise(|| ErrorKind::Connect(settings.address.clone()))?;
        tracing::info!("Cache connected");
        Ok(cache)
    }

    async fn run<T: FromRedisValue + Send>(&self, name: &'static str, cmd: Cmd) -> Result<T> {
        let _permit = self.permits.acquire().await.or_raise(|| ErrorKind::Unavailable)?;
        let mut connection = self.connection.clone();
        match tokio::time::timeout(self.timeout, cmd.query_async::<T>(&mut connection)).await {
            Ok(result) => result.or_raise(|| ErrorKind::Command(name)),
            Err(_elapsed) => exn::bail!(ErrorKind::Cancelled),
        }
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run("GET", cmd).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            // Redis rejects `PX 0`; an entry that expires immediately is no entry.
            return Ok(());
        }
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(millis);
        self.run("SET", cmd).await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        let _removed: usize = self.run("DEL", cmd).await?;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(SCAN_BATCH);
            let (next, keys): (u64, Vec<String>) = self.run("SCAN", cmd).await?;
            if !keys.is_empty() {
                let mut cmd = redis::cmd("DEL");
                cmd.arg(&keys);
                removed += self.run::<usize>("DEL", cmd).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        tracing::debug!(pattern, removed, "Deleted matching cache keys");
        Ok(removed)
    }

    async fn flush(&self) -> Result<()> {
        self.run("FLUSHDB", redis::cmd("FLUSHDB")).await
    }

    async fn ping(&self) -> Result<()> {
        let _pong: String = self.run("PING", redis::cmd("PING")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, "redis://localhost:6379/0")]
    #[case(Some(""), "redis://localhost:6379/0")]
    #[case(Some("hunter2"), "redis://:hunter2@localhost:6379/0")]
    #[case(Some("p@ss/w:rd"), "redis://:p%40ss%2Fw%3Ard@localhost:6379/0")]
    fn test_url(#[case] password: Option<&str>, #[case] expected: &str) {
        let settings = RedisSettings {
            password: password.map(str::to_string),
            ..RedisSettings::default()
        };
        assert_eq!(settings.url(), expected);
    }

    #[test]
    fn test_url_selects_database() {
        let settings = RedisSettings {
            address: "cache.internal:6380".into(),
            db: 3,
            ..RedisSettings::default()
        };
        assert_eq!(settings.url(), "redis://cache.internal:6380/3");
    }

    #[test]
    fn test_debug_redacts_password() {
        let settings = RedisSettings {
            password: Some("hunter2".into()),
            ..RedisSettings::default()
        };
        let debug = format!("{settings:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let settings = RedisSettings {
            // Port 1 is reserved; nothing listens there.
            address: "127.0.0.1:1".into(),
            timeout: Duration::from_millis(500),
            ..RedisSettings::default()
        };
        let Err(err) = RedisCache::connect(&settings).await else {
            panic!("connected to a closed port");
        };
        assert!(matches!(&*err, ErrorKind::Connect(address) if address == "127.0.0.1:1"));
    }
}
