use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, instrument};

use super::BundleStore;

/// Bundle store backed by an S3 bucket.
pub struct S3BundleStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3BundleStore {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    fn s3_key(&self, repository: &str) -> String {
        format!("{}{}.bundle", self.prefix, repository)
    }
}

#[async_trait]
impl BundleStore for S3BundleStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, repository: &str) -> Result<bool> {
        let key = self.s3_key(repository);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err.as_service_error().map_or(false, |e| e.is_not_found()) {
                    Ok(false)
                } else {
                    Err(err).context("S3 HeadObject")
                }
            }
        }
    }

    #[instrument(skip(self, src), fields(bucket = %self.bucket))]
    async fn upload(&self, repository: &str, src: &Path) -> Result<()> {
        let key = self.s3_key(repository);
        let body = ByteStream::from_path(src)
            .await
            .with_context(|| format!("open bundle for upload: {}", src.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .context("S3 PutObject")?;

        debug!(%key, path = %src.display(), "bundle uploaded");
        Ok(())
    }

    #[instrument(skip(self, dest), fields(bucket = %self.bucket))]
    async fn download(&self, repository: &str, dest: &Path) -> Result<()> {
        let key = self.s3_key(repository);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .context("S3 GetObject")?;

        let bytes = resp
            .body
            .collect()
            .await
            .context("read S3 GetObject body")?
            .into_bytes();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create parent dirs for {}", dest.display()))?;
        }
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("write downloaded bundle to {}", dest.display()))?;

        debug!(%key, bytes = bytes.len(), "bundle downloaded");
        Ok(())
    }
}
