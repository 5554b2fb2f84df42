//! S3-compatible storage backend using the AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ListingPage, ObjectEntry, ObjectMeta, ObjectStore, PageStream};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use gleaner_core::config::S3Config;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::instrument;

/// Marker included in lazy-credentials initialization errors so they map to
/// actionable config errors instead of generic S3 transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "gleaner-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "gleaner-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// This avoids constructor-time side effects (notably TLS/native-root
/// initialization) in environments where no root certificates are available.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    StorageError::S3(Box::new(err))
}

/// S3-compatible object store.
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend for the given bucket.
    pub async fn new(bucket: &str, region: &str, options: &S3Config) -> StorageResult<Self> {
        if options.access_key_id.is_some() != options.secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()));

        // Explicit credentials when configured, otherwise the ambient chain
        // resolved lazily on first signed request.
        if let (Some(key_id), Some(secret)) = (
            options.access_key_id.clone(),
            options.secret_access_key.clone(),
        ) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "gleaner-config");
            builder = builder.credentials_provider(credentials);
        } else {
            builder = builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(region.to_string()));
        }

        if let Some(endpoint) = &options.endpoint {
            // Handle bare host:port endpoints (e.g., "minio:9000") by prepending http://
            let endpoint_lower = endpoint.to_ascii_lowercase();
            let endpoint_url = if endpoint_lower.starts_with("http://")
                || endpoint_lower.starts_with("https://")
            {
                endpoint.clone()
            } else {
                format!("http://{endpoint}")
            };

            // For explicit HTTP endpoints (local MinIO), use an HTTP-only client
            // so SDK initialization doesn't depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
            builder = builder.endpoint_url(endpoint_url);
        }

        if options.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
        })
    }

    /// Convert an AWS SDK error to StorageError, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err
            && service_err.raw().status().as_u16() == 404
        {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }

    fn convert_timestamp(key: &str, dt: &aws_sdk_s3::primitives::DateTime) -> Option<time::OffsetDateTime> {
        time::OffsetDateTime::from_unix_timestamp(dt.secs())
            .inspect_err(|e| {
                tracing::warn!(
                    key = %key,
                    timestamp = dt.secs(),
                    error = %e,
                    "Failed to convert S3 timestamp, object will be treated as too young"
                );
            })
            .ok()
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err
                    && service_err.raw().status().as_u16() == 404
                {
                    return Ok(false);
                }
                Err(map_s3_operation_error(err))
            }
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0) as u64,
            last_modified: output
                .last_modified()
                .and_then(|dt| Self::convert_timestamp(key, dt)),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // S3 delete_object doesn't error on missing keys, so head-check first
        // to surface NotFound to the caller.
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }

    fn list_pages<'a>(&'a self, prefix: &str, page_size: usize) -> PageStream<'a> {
        let prefix = prefix.to_string();

        let stream = async_stream::try_stream! {
            let mut continuation_token: Option<String> = None;

            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix)
                    .max_keys(page_size.min(i32::MAX as usize) as i32);

                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let output = request.send().await.map_err(map_s3_operation_error)?;

                let mut entries = Vec::new();
                for obj in output.contents() {
                    if let Some(key) = obj.key() {
                        entries.push(ObjectEntry {
                            key: key.to_string(),
                            size: obj.size().unwrap_or(0) as u64,
                            last_modified: obj
                                .last_modified()
                                .and_then(|dt| Self::convert_timestamp(key, dt)),
                        });
                    }
                }

                if !entries.is_empty() {
                    yield ListingPage { entries };
                }

                if output.is_truncated() == Some(true) {
                    continuation_token = output.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }
        };

        Box::pin(stream)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        // A zero-key listing verifies both reachability and bucket access
        // without writing anything to the bucket being collected.
        let probe = async {
            self.client
                .list_objects_v2()
                .bucket(&self.bucket)
                .max_keys(1)
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            Ok(())
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}
