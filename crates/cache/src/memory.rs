//! In-memory cache for testing.

use crate::CacheStore;
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory [`CacheStore`] for testing.
///
/// Expiry follows `tokio::time`, so tests running with a paused clock can
/// step past a TTL. It can also be switched off to simulate an unreachable
/// cache.
#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    available: AtomicBool,
    scans: AtomicUsize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            scans: AtomicUsize::new(0),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an unexpired entry exists.
    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.get(key).is_some_and(|e| e.expires_at > Instant::now())
    }

    /// Store raw bytes, bypassing any encoding. Used to plant corrupt
    /// entries.
    pub async fn insert_raw(&self, key: &str, value: impl Into<Vec<u8>>) {
        let entry = Entry {
            value: value.into(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    /// Unexpired keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> =
            entries.iter().filter(|(_, e)| e.expires_at > now).map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys
    }

    /// How many pattern deletes ran.
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        match self.available.load(Ordering::SeqCst) {
            true => Ok(()),
            false => exn::bail!(ErrorKind::Unavailable),
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).or_raise(|| ErrorKind::Command("SCAN"))
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries.get(key).filter(|e| e.expires_at > Instant::now()).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_available()?;
        let entry = Entry {
            value: value.to_vec(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        self.check_available()?;
        self.scans.fetch_add(1, Ordering::SeqCst);
        let matcher = glob_to_regex(pattern)?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !matcher.is_match(key));
        Ok(before - entries.len())
    }

    async fn flush(&self) -> Result<()> {
        self.check_available()?;
        self.entries.write().await.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set("module:acme.users", b"{}", Duration::from_secs(60)).await.unwrap();
        assert!(cache.get("module:acme.users").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("module:acme.users").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_matching_glob() {
        let cache = MemoryCache::new();
        for key in ["file:acme.users:v1:a.proto", "file:acme.users:v1:b/c.proto", "file:acme.users:v10:a.proto"] {
            cache.set(key, b"x", Duration::from_secs(60)).await.unwrap();
        }
        let removed = cache.delete_matching("file:acme.users:v1:*").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.keys().await, ["file:acme.users:v10:a.proto"]);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let cache = MemoryCache::new();
        cache.set_available(false);
        let err = cache.get("module:acme.users").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unavailable));
        assert!(cache.ping().await.is_err());
    }
}
