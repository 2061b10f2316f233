use crate::config::BlobStoreConfig;
use crate::error::BlobStoreError;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Object-storage backend returning a public URL per uploaded object. The
/// orchestrator only sees this seam, so tests substitute a mock for the live
/// client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload one object under `{namespace}/{filename}` and return its
    /// public URL.
    async fn upload(
        &self,
        namespace: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BlobStoreError>;
}

/// S3-compatible blob store for image uploads
pub struct S3BlobStore {
    client: S3Client,
    config: BlobStoreConfig,
}

impl S3BlobStore {
    /// Create a new blob store client
    pub async fn new(config: &BlobStoreConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Blob store client initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes), fields(namespace = %namespace, filename = %filename, size_bytes = bytes.len()))]
    async fn upload(
        &self,
        namespace: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BlobStoreError> {
        let key = object_key(namespace, filename);
        let content_type = content_type_for(filename);

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .metadata("folder-name", sanitize_path_component(namespace))
            .send()
            .await
            .map_err(|e| classify_put_error(&key, e))?;

        let url = public_object_url(&self.config, &key);

        debug!(key = %key, url = %url, "object uploaded");

        Ok(url)
    }
}

/// Object key: sanitized namespace plus the original filename. Keys are
/// deterministic, so re-processing a folder overwrites the same objects
/// instead of accumulating duplicates.
pub fn object_key(namespace: &str, filename: &str) -> String {
    format!("{}/{}", sanitize_path_component(namespace), filename)
}

/// Public URL for a stored object: configured base URL, else path-style
/// against the custom endpoint, else the virtual-hosted AWS form.
pub fn public_object_url(config: &BlobStoreConfig, key: &str) -> String {
    if let Some(ref base) = config.public_base_url {
        format!("{}/{}", base.trim_end_matches('/'), key)
    } else if let Some(ref endpoint) = config.endpoint_url {
        format!("{}/{}/{}", endpoint.trim_end_matches('/'), config.bucket, key)
    } else {
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            config.bucket, config.region, key
        )
    }
}

fn classify_put_error(key: &str, err: SdkError<PutObjectError>) -> BlobStoreError {
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::ServiceError(_) | SdkError::ConstructionFailure(_) => BlobStoreError::Rejected {
            key: key.to_string(),
            message,
        },
        // DispatchFailure, TimeoutError, ResponseError
        _ => BlobStoreError::Transport {
            key: key.to_string(),
            message,
        },
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Get content type for an image filename
fn content_type_for(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("tiff") => "image/tiff",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
