//! In-memory object store for testing.

use crate::error::{ErrorKind, Result};
use crate::{CHECKSUM_METADATA, ObjectStore, content_hash};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredObject {
    content: Vec<u8>,
    content_type: String,
    metadata: HashMap<String, String>,
}

/// In-memory object store for testing.
///
/// Counts uploads and can be told to start failing them, so callers can
/// check both deduplication and their behavior when an upload fails halfway
/// through a batch.
///
/// # Examples
///
/// ```
/// use protoreg_objects::{MemoryObjectStore, ObjectStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryObjectStore::new("test");
/// let first = store.put_object_with_hash(b"message User {}", "text/plain").await?;
/// let second = store.put_object_with_hash(b"message User {}", "text/plain").await?;
/// assert_eq!(first, second);
/// assert_eq!(store.object_count().await, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: RwLock<HashMap<String, StoredObject>>,
    puts: AtomicUsize,
    /// Uploads beyond this many fail; `usize::MAX` means never.
    put_limit: AtomicUsize,
    available: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
            puts: AtomicUsize::new(0),
            put_limit: AtomicUsize::new(usize::MAX),
            available: AtomicBool::new(true),
        }
    }

    /// Number of distinct objects stored.
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Number of successful uploads, including overwrites.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Let `limit` more uploads succeed, then fail every one after.
    pub fn fail_puts_after(&self, limit: usize) {
        self.put_limit.store(self.put_count().saturating_add(limit), Ordering::SeqCst);
    }

    /// Simulate the bucket going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Metadata attached to a stored object.
    pub async fn metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        self.objects.read().await.get(key).map(|o| o.metadata.clone())
    }

    /// Content type a stored object was uploaded with.
    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().await.get(key).map(|o| o.content_type.clone())
    }

    fn check_available(&self) -> Result<()> {
        match self.available.load(Ordering::SeqCst) {
            true => Ok(()),
            false => exn::bail!(ErrorKind::Unavailable(format!("bucket `{}`", self.bucket))),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(&self, key: &str, content: &[u8], content_type: &str) -> Result<()> {
        self.check_available()?;
        if self.put_count() >= self.put_limit.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Request(format!("put `{key}`")));
        }
        let object = StoredObject {
            content: content.to_vec(),
            content_type: content_type.to_string(),
            metadata: HashMap::from([(CHECKSUM_METADATA.to_string(), content_hash(content))]),
        };
        self.objects.write().await.insert(key.to_string(), object);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        self.check_available()?;
        match self.objects.read().await.get(key) {
            Some(object) => Ok(object.content.clone()),
            None => exn::bail!(ErrorKind::NotFound(key.to_string())),
        }
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn health_check(&self, _timeout: Duration) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dedup_stores_once() {
        let store = MemoryObjectStore::new("test");
        let a = store.put_object_with_hash(b"message User {}", "text/plain").await.unwrap();
        let b = store.put_object_with_hash(b"message User {}", "text/plain").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.object_count().await, 1);
        assert_eq!(store.put_count(), 1);
        let key = store.content_key(&a).unwrap();
        assert_eq!(store.metadata(&key).await.unwrap()[CHECKSUM_METADATA], a);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryObjectStore::new("test");
        store.delete_object("nothing/here").await.unwrap();
        assert!(!store.object_exists("nothing/here").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_puts_after() {
        let store = MemoryObjectStore::new("test");
        store.fail_puts_after(1);
        store.put_object("a", b"1", "text/plain").await.unwrap();
        let err = store.put_object("b", b"2", "text/plain").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
