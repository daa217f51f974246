//! Content-addressable object storage.
//!
//! Blobs are uploaded to a bucket-style object service. Callers that want
//! deduplication go through [`ObjectStore::put_object_with_hash`], which
//! stores each distinct content exactly once under a key derived from its
//! SHA-256 digest:
//!
//! ```text
//! <namespace>/sha256/<first 2 hex chars>/<remaining 62 hex chars>
//! ```
//!
//! The two-character shard spreads objects across many prefixes, which S3
//! and friends partition on.

pub mod error;
#[cfg(any(test, feature = "mock"))]
mod memory;
mod s3;

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
#[cfg(any(test, feature = "mock"))]
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Namespace content-addressed blobs are stored under unless configured
/// otherwise.
pub const DEFAULT_NAMESPACE: &str = "proto-files";
/// Object metadata entry holding the hex SHA-256 of the uploaded bytes.
pub const CHECKSUM_METADATA: &str = "sha256";

/// Hex-encoded SHA-256 digest of `content`.
///
/// # Examples
///
/// ```
/// assert_eq!(
///     protoreg_objects::content_hash(b""),
///     "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
/// );
/// ```
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Sharded key for a content hash.
///
/// # Errors
///
/// Returns [`InvalidKey`](ErrorKind::InvalidKey) unless `hash` is a
/// 64-character lowercase hex string.
pub fn content_key(namespace: &str, hash: &str) -> Result<String> {
    let valid = hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !valid {
        exn::bail!(ErrorKind::InvalidKey(hash.to_string()));
    }
    let (shard, rest) = hash.split_at(2);
    Ok(format!("{}/sha256/{shard}/{rest}", namespace.trim_end_matches('/')))
}

/// A bucket-style blob store.
///
/// Implementations never retry; the caller decides based on
/// [`ErrorKind::is_retryable`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the bucket, for logging only.
    fn bucket(&self) -> &str;

    /// Prefix that content-addressed keys live under.
    fn namespace(&self) -> &str {
        DEFAULT_NAMESPACE
    }

    /// Upload `content` under an explicit key, attaching its SHA-256 as
    /// [`CHECKSUM_METADATA`]. Overwrites any existing object.
    async fn put_object(&self, key: &str, content: &[u8], content_type: &str) -> Result<()>;

    /// Download an object.
    ///
    /// Fails with [`NotFound`](ErrorKind::NotFound) when nothing is stored
    /// under the key, distinct from any other failure.
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    async fn object_exists(&self, key: &str) -> Result<bool>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Verify the bucket is reachable within `timeout`.
    async fn health_check(&self, timeout: Duration) -> Result<()>;

    /// Key that content with the given hash is stored under.
    fn content_key(&self, hash: &str) -> Result<String> {
        content_key(self.namespace(), hash)
    }

    /// Store `content` under its content-addressed key unless it is already
    /// there, and return its hex SHA-256 digest.
    ///
    /// Re-uploading identical bytes costs one existence check.
    async fn put_object_with_hash(&self, content: &[u8], content_type: &str) -> Result<String> {
        let hash = content_hash(content);
        let key = self.content_key(&hash)?;
        if self.object_exists(&key).await? {
            tracing::debug!(%key, "Content already stored, skipping upload");
            return Ok(hash);
        }
        self.put_object(&key, content, content_type).await?;
        tracing::debug!(%key, bytes = content.len(), "Content uploaded");
        Ok(hash)
    }
}

/// Run `fut`, failing with [`ErrorKind::Cancelled`] once `timeout` expires.
pub(crate) async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_elapsed) => exn::bail!(ErrorKind::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_content_key_is_sharded() {
        let hash = content_hash(b"syntax = \"proto3\";");
        let key = content_key(DEFAULT_NAMESPACE, &hash).unwrap();
        assert_eq!(key, format!("proto-files/sha256/{}/{}", &hash[..2], &hash[2..]));
        assert_eq!(key.rsplit('/').next().unwrap().len(), 62);
    }

    #[test]
    fn test_namespace_trailing_slash() {
        let hash = content_hash(b"x");
        assert!(content_key("blobs/", &hash).unwrap().starts_with("blobs/sha256/"));
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("../../../../etc/passwd")]
    #[case("E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855")]
    fn test_invalid_hash_rejected(#[case] hash: &str) {
        let err = content_key(DEFAULT_NAMESPACE, hash).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(_)));
    }

    #[test]
    fn test_identical_content_same_hash() {
        assert_eq!(content_hash(b"message User {}"), content_hash(b"message User {}"));
        assert_ne!(content_hash(b"message User {}"), content_hash(b"message Users {}"));
    }
}
