//! S3-compatible object store.
//!
//! Works against AWS S3 and S3-compatible services (MinIO, Backblaze B2,
//! Tigris, Ceph RGW). Credentials are provided explicitly from
//! configuration.

use crate::error::{ErrorKind, Result};
use crate::{CHECKSUM_METADATA, DEFAULT_NAMESPACE, ObjectStore, content_hash, with_timeout};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse, retry::RetryConfig},
    error::{ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{BucketLocationConstraint, CreateBucketConfiguration},
};
use exn::ResultExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;
/// Region that rejects an explicit location constraint on bucket creation.
const DEFAULT_REGION: &str = "us-east-1";

/// S3-compatible object store.
///
/// # Examples
///
/// ```no_run
/// use protoreg_objects::{ObjectStore, S3ObjectStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = S3ObjectStore::new(
///     "protoreg",
///     "us-east-1",
///     Some("http://localhost:9000".to_string()),
///     "access_key_id",
///     "secret_access_key",
///     true,
/// );
/// store.ensure_bucket().await?;
/// let hash = store.put_object_with_hash(b"syntax = \"proto3\";", "text/plain").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    region: Option<String>,
    namespace: String,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3ObjectStore {
    /// Create a new S3 object store.
    ///
    /// # Arguments
    /// * `bucket` - Bucket name
    /// * `region` - AWS region or provider-specific region
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - Access key ID
    /// * `key_secret` - Secret access key
    /// * `force_path_style` - Use path-style addressing (required by MinIO and most self-hosted services)
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        force_path_style: bool,
    ) -> Self {
        let region = region.into();
        let credentials = Credentials::new(key_id, key_secret, None, None, "protoreg-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.clone()))
            // Callers decide whether to retry from the error kind.
            .retry_config(RetryConfig::disabled())
            .force_path_style(force_path_style);
        // Set custom endpoint for non-AWS services
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        let mut store = Self::from_client(Client::from_conf(config_builder.build()), bucket);
        store.region = Some(region);
        store
    }

    /// Wrap an already configured client.
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        let region = client.config().region().map(|r| r.to_string());
        Self {
            client,
            bucket: bucket.into(),
            region,
            namespace: DEFAULT_NAMESPACE.to_string(),
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        }
    }

    /// Store content-addressed blobs under a different prefix.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::Unavailable("request limiter closed".to_string()))
    }

    /// Some S3-compatible services answer a missing key with a bare 404 and
    /// no error code, so the status is checked as well as the modelled error.
    fn is_missing<E: ProvideErrorMetadata>(err: &SdkError<E, HttpResponse>, modelled: impl FnOnce(&E) -> bool) -> bool {
        if err.as_service_error().is_some_and(modelled) {
            return true;
        }
        let bare_404 = err.raw_response().is_some_and(|r| r.status().as_u16() == 404);
        bare_404 && err.as_service_error().and_then(|e| e.code()).is_none()
    }

    /// Create the bucket if it does not exist yet.
    ///
    /// Idempotent: if another process creates the bucket concurrently, the
    /// resulting "already exists" answer counts as success.
    #[tracing::instrument(skip_all, fields(bucket = %self.bucket))]
    pub async fn ensure_bucket(&self) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            tracing::debug!("Bucket exists");
            return Ok(());
        }
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if let Some(region) = self.region.as_deref().filter(|r| *r != DEFAULT_REGION) {
            let configuration = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build();
            request = request.create_bucket_configuration(configuration);
        }
        match request.send().await {
            Ok(_) => {
                tracing::info!("Bucket created");
                Ok(())
            },
            Err(e)
                if e.as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()) =>
            {
                tracing::debug!("Bucket created concurrently");
                Ok(())
            },
            Err(e) => Err(e).or_raise(|| ErrorKind::Request(format!("create bucket `{}`", self.bucket))),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn put_object(&self, key: &str, content: &[u8], content_type: &str) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .metadata(CHECKSUM_METADATA, content_hash(content))
            .body(ByteStream::from(content.to_vec()))
            .send()
            .await
            .or_raise(|| ErrorKind::Request(format!("put `{key}`")))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output,
            Err(e) if Self::is_missing(&e, |e| e.is_no_such_key()) => exn::bail!(ErrorKind::NotFound(key.to_string())),
            Err(e) => return Err(e).or_raise(|| ErrorKind::Request(format!("get `{key}`"))),
        };
        let body = output.body.collect().await.or_raise(|| ErrorKind::Request(format!("read body of `{key}`")))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let _permit = self.acquire_permit().await?;
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if Self::is_missing(&e, |e| e.is_not_found()) => Ok(false),
            Err(e) => Err(e).or_raise(|| ErrorKind::Request(format!("head `{key}`"))),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        match self.client.delete_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_missing(&e, |e| e.code() == Some("NoSuchKey")) => Ok(()),
            Err(e) => Err(e).or_raise(|| ErrorKind::Request(format!("delete `{key}`"))),
        }
    }

    async fn health_check(&self, timeout: Duration) -> Result<()> {
        with_timeout(timeout, async {
            let _permit = self.acquire_permit().await?;
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .or_raise(|| ErrorKind::Unavailable(format!("bucket `{}`", self.bucket)))?;
            Ok(())
        })
        .await
    }
}
