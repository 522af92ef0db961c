//! Lease acquisition, materialization and sync-back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::LeaseConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::git;
use crate::lease::locks::Coordinator;
use crate::metrics::Metrics;
use crate::storage::BundleStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// Full ownership of the working copy.  Backed by the distributed
    /// per-repository lock; the holder may mutate any ref and syncs back to
    /// blob storage on a modified release.
    Exclusive,
    /// Lookahead access alongside this process's own exclusive holder.  No
    /// distributed lock is taken; holders may only touch refs under
    /// `refs/queue/` and never sync back.
    SharedRead,
}

/// A held lease.  Not persisted anywhere; dropping it without calling
/// [`LeaseManager::release`] leaves the distributed lock to expire by TTL.
#[derive(Debug)]
pub struct RepositoryLease {
    pub repository: String,
    pub path: PathBuf,
    pub mode: LeaseMode,
    holds_lock: bool,
}

pub struct LeaseManager {
    coordinator: Arc<dyn Coordinator>,
    bundles: Arc<dyn BundleStore>,
    repos_root: PathBuf,
    node_id: String,
    lock_ttl: Duration,
    wait_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl LeaseManager {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        bundles: Arc<dyn BundleStore>,
        repos_root: impl Into<PathBuf>,
        node_id: impl Into<String>,
        config: &LeaseConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            coordinator,
            bundles,
            repos_root: repos_root.into(),
            node_id: node_id.into(),
            lock_ttl: Duration::from_secs(config.lock_ttl),
            wait_timeout: Duration::from_secs(config.lock_wait_timeout),
            metrics,
        }
    }

    /// Local path a repository materializes at, whether or not it currently
    /// exists there.
    pub fn repo_path(&self, repository: &str) -> PathBuf {
        self.repos_root.join(repository)
    }

    fn lock_key(repository: &str) -> String {
        format!("lease:{repository}")
    }

    #[instrument(skip(self), fields(node = %self.node_id))]
    pub async fn acquire(
        &self,
        repository: &str,
        mode: LeaseMode,
    ) -> PipelineResult<RepositoryLease> {
        match mode {
            LeaseMode::Exclusive => self.acquire_exclusive(repository).await,
            LeaseMode::SharedRead => self.acquire_shared(repository).await,
        }
    }

    async fn acquire_exclusive(&self, repository: &str) -> PipelineResult<RepositoryLease> {
        let key = Self::lock_key(repository);
        let deadline = Instant::now() + self.wait_timeout;

        loop {
            if self
                .coordinator
                .try_acquire(&key, &self.node_id, self.lock_ttl)
                .await?
            {
                self.metrics.lease_acquisitions.inc();
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.metrics.lease_timeouts.inc();
                return Err(PipelineError::LeaseTimeout(repository.to_string()));
            }
            // The lock freeing up does not grant it to us; re-race above.
            self.metrics.lease_waits.inc();
            self.coordinator.wait_for_release(&key, remaining).await?;
        }

        match self.materialize(repository).await {
            Ok(path) => {
                info!(%repository, path = %path.display(), "exclusive lease acquired");
                Ok(RepositoryLease {
                    repository: repository.to_string(),
                    path,
                    mode: LeaseMode::Exclusive,
                    holds_lock: true,
                })
            }
            Err(e) => {
                if let Err(release_err) = self.coordinator.release(&key, &self.node_id).await {
                    warn!(%repository, error = %release_err, "lock release after failed materialization");
                }
                Err(e)
            }
        }
    }

    async fn acquire_shared(&self, repository: &str) -> PipelineResult<RepositoryLease> {
        let key = Self::lock_key(repository);
        if let Some(owner) = self.coordinator.holder(&key).await? {
            if owner != self.node_id {
                debug!(%repository, %owner, "shared lease refused: exclusively held elsewhere");
                return Err(PipelineError::LeaseTimeout(repository.to_string()));
            }
        }

        let path = self.repo_path(repository);
        if !git::validate_bare_repo(&path).await? {
            return Err(PipelineError::NotFound(format!(
                "repository {repository} is not materialized on this node"
            )));
        }

        debug!(%repository, "shared lease acquired");
        Ok(RepositoryLease {
            repository: repository.to_string(),
            path,
            mode: LeaseMode::SharedRead,
            holds_lock: false,
        })
    }

    /// Ensure a valid local bare repo exists for `repository`, restoring it
    /// from its blob-storage bundle when needed.
    async fn materialize(&self, repository: &str) -> PipelineResult<PathBuf> {
        let path = self.repo_path(repository);
        if git::validate_bare_repo(&path).await? {
            return Ok(path);
        }

        if !self.bundles.exists(repository).await? {
            return Err(PipelineError::NotFound(format!(
                "repository {repository} exists neither locally nor in blob storage"
            )));
        }

        info!(%repository, "materializing repository from bundle");
        git::init_bare_repo(&path).await?;

        let bundle = tempfile::NamedTempFile::new()
            .context("create temp file for bundle download")?;
        self.bundles.download(repository, bundle.path()).await?;
        if let Ok(meta) = tokio::fs::metadata(bundle.path()).await {
            self.metrics.bundle_download_bytes.inc_by(meta.len());
        }
        git::git_bundle_unbundle(bundle.path(), &path).await?;

        Ok(path)
    }

    /// Return a lease.  `modified = true` syncs the repository back to blob
    /// storage before the distributed lock is dropped.
    #[instrument(skip(self, lease), fields(repository = %lease.repository, ?lease.mode))]
    pub async fn release(&self, lease: RepositoryLease, modified: bool) -> PipelineResult<()> {
        if modified {
            match lease.mode {
                LeaseMode::Exclusive => {
                    let bundle = tempfile::NamedTempFile::new()
                        .context("create temp file for bundle upload")?;
                    git::git_bundle_create(&lease.path, bundle.path()).await?;
                    if let Ok(meta) = tokio::fs::metadata(bundle.path()).await {
                        self.metrics.bundle_upload_bytes.inc_by(meta.len());
                    }
                    self.bundles.upload(&lease.repository, bundle.path()).await?;
                    info!(repository = %lease.repository, "repository synced to blob storage");
                }
                LeaseMode::SharedRead => {
                    // Shared holders only write disposable refs/queue/* refs.
                    warn!(
                        repository = %lease.repository,
                        "shared lease released as modified; sync-back refused"
                    );
                }
            }
        }

        if lease.holds_lock {
            self.coordinator
                .release(&Self::lock_key(&lease.repository), &self.node_id)
                .await?;
        }
        Ok(())
    }
}
