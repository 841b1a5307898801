use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, ExpirationStatus, LifecycleExpiration, LifecycleRule,
    LifecycleRuleFilter,
};
use bytes::Bytes;
use tracing::info;

const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Raw artifact storage addressed by key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// S3 / MinIO object storage.
#[derive(Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Installs a bucket lifecycle rule deleting objects under `prefix` once
    /// they are older than `ttl`, rounded up to whole days.
    pub async fn expire_prefix(&self, prefix: &str, ttl: Duration) -> Result<()> {
        let days = expiry_days(ttl);
        let rule = LifecycleRule::builder()
            .id("expire-uploads")
            .filter(LifecycleRuleFilter::builder().prefix(prefix).build())
            .expiration(LifecycleExpiration::builder().days(days).build())
            .status(ExpirationStatus::Enabled)
            .build()
            .context("Invalid lifecycle rule")?;
        let lifecycle = BucketLifecycleConfiguration::builder()
            .rules(rule)
            .build()
            .context("Invalid lifecycle configuration")?;

        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(&self.bucket)
            .lifecycle_configuration(lifecycle)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("S3 lifecycle update failed: {e}"))?;

        info!("Objects under s3://{}/{prefix} expire after {days} day(s)", self.bucket);
        Ok(())
    }
}

/// S3 expiry works in whole days, at least one.
fn expiry_days(ttl: Duration) -> i32 {
    let days = ttl.as_secs().div_ceil(SECONDS_PER_DAY).max(1);
    i32::try_from(days).unwrap_or(i32::MAX)
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("S3 upload failed: {e}"))?;

        info!("Uploaded {size} bytes to s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("S3 download of '{key}' failed: {e}"))?;

        let data = object
            .body
            .collect()
            .await
            .with_context(|| format!("Reading s3://{}/{} failed", self.bucket, key))?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("S3 delete of '{key}' failed: {e}"))?;
        Ok(())
    }
}
