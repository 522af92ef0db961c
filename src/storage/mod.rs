//! Durable bundle storage.
//!
//! Materialized bare repos are synchronized to durable storage as git
//! bundles: one bundle per repository, overwritten on every release of a
//! modified lease.  The backend is either S3 or a local directory (single
//! node deployments and tests).

pub mod s3;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

pub use s3::S3BundleStore;

#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Whether a bundle for `repository` exists in durable storage.
    async fn exists(&self, repository: &str) -> Result<bool>;

    /// Upload the bundle file at `src` as the bundle for `repository`,
    /// replacing any previous one.
    async fn upload(&self, repository: &str, src: &Path) -> Result<()>;

    /// Download the bundle for `repository` to `dest`.
    async fn download(&self, repository: &str, dest: &Path) -> Result<()>;
}

/// Filesystem-backed store.  Bundles live under `root` mirroring the
/// `owner/name` repository layout.
pub struct FsBundleStore {
    root: PathBuf,
}

impl FsBundleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bundle_path(&self, repository: &str) -> PathBuf {
        self.root.join(format!("{repository}.bundle"))
    }
}

#[async_trait]
impl BundleStore for FsBundleStore {
    async fn exists(&self, repository: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.bundle_path(repository))
            .await
            .unwrap_or(false))
    }

    async fn upload(&self, repository: &str, src: &Path) -> Result<()> {
        let dest = self.bundle_path(repository);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create bundle dir {}", parent.display()))?;
        }
        tokio::fs::copy(src, &dest)
            .await
            .with_context(|| format!("store bundle at {}", dest.display()))?;
        Ok(())
    }

    async fn download(&self, repository: &str, dest: &Path) -> Result<()> {
        let src = self.bundle_path(repository);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create download dir {}", parent.display()))?;
        }
        tokio::fs::copy(&src, dest)
            .await
            .with_context(|| format!("fetch bundle from {}", src.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_round_trips_a_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBundleStore::new(dir.path().join("bundles"));

        assert!(!store.exists("acme/widgets").await.unwrap());

        let src = dir.path().join("out.bundle");
        tokio::fs::write(&src, b"bundle-bytes").await.unwrap();
        store.upload("acme/widgets", &src).await.unwrap();
        assert!(store.exists("acme/widgets").await.unwrap());

        let dest = dir.path().join("in.bundle");
        store.download("acme/widgets", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"bundle-bytes");
    }

    #[tokio::test]
    async fn upload_overwrites_previous_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBundleStore::new(dir.path().join("bundles"));

        let src = dir.path().join("out.bundle");
        tokio::fs::write(&src, b"v1").await.unwrap();
        store.upload("acme/widgets", &src).await.unwrap();
        tokio::fs::write(&src, b"v2").await.unwrap();
        store.upload("acme/widgets", &src).await.unwrap();

        let dest = dir.path().join("in.bundle");
        store.download("acme/widgets", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"v2");
    }
}
