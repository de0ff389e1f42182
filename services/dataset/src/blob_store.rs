use crate::config::S3Config;
use crate::error::{DatasetError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Named-object storage holding one archive per dataset
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the file at `local_path` to `key`, overwriting any existing object
    async fn put(&self, key: &str, local_path: &Path) -> Result<()>;

    /// Download `key` into `local_path`; a missing object is `NotFound`
    async fn get(&self, key: &str, local_path: &Path) -> Result<()>;

    /// Delete `key`
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check whether `key` exists
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// S3-backed blob store for dataset archives
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    /// Create a new S3 blob store, creating the bucket when it does not exist
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
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

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "dataset-service-static",
            ));
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        let store = Self {
            client,
            bucket: config.bucket.clone(),
        };

        store.ensure_bucket().await?;

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(store)
    }

    /// Create the bucket if `HeadBucket` reports it missing
    async fn ensure_bucket(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    info!(bucket = %self.bucket, "Bucket missing, creating it");
                    self.client
                        .create_bucket()
                        .bucket(&self.bucket)
                        .send()
                        .await
                        .context("Failed to create bucket")?;
                    Ok(())
                } else {
                    Err(e).context("Failed to check bucket")
                }
            }
        }
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, local_path), fields(key = %key))]
    async fn put(&self, key: &str, local_path: &Path) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| DatasetError::Store(format!("failed to read {}: {}", local_path.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("application/zip")
            .send()
            .await
            .map_err(|e| DatasetError::Store(format!("failed to upload {}: {}", key, e)))?;

        debug!(key = %key, "Archive uploaded");
        Ok(())
    }

    #[instrument(skip(self, local_path), fields(key = %key))]
    async fn get(&self, key: &str, local_path: &Path) -> Result<()> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(DatasetError::NotFound(format!("object {}", key)));
                }
                return Err(DatasetError::Store(format!("failed to download {}: {}", key, e)));
            }
        };

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut reader = output.body.into_async_read();
        let mut file = tokio::fs::File::create(local_path).await?;
        let bytes = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        debug!(key = %key, size_bytes = bytes, "Archive downloaded");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| DatasetError::Store(format!("failed to delete {}: {}", key, e)))?;

        debug!(key = %key, "Archive deleted");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(DatasetError::Store(format!("failed to check {}: {}", key, e)))
                }
            }
        }
    }
}
