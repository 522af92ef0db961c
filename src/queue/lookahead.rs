//! Speculative lookahead merges.
//!
//! After an item is claimed, the next queued items get chained speculative
//! merges: each one is computed on top of the cumulative result of every
//! item ahead of it, anticipating that those will land first.  The
//! resulting commits live on disposable `refs/queue/exec-*` refs so CI can
//! start before the item's turn arrives.
//!
//! Lookahead only pre-computes, never pre-commits: the authoritative queue
//! order is untouched, and every failure here is logged and absorbed.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, info, instrument, warn};

use crate::error::PipelineResult;
use crate::git::{self, MergeTreeOutcome};
use crate::lease::{LeaseManager, LeaseMode, RepositoryLease};
use crate::metrics::Metrics;
use crate::store;

#[async_trait]
pub trait SpeculativeRunner: Send + Sync {
    /// Run one lookahead pass for `repository`.  Must never fail the
    /// caller; all errors are handled internally.
    async fn run(&self, repository: &str);
}

/// Disabled lookahead (depth 0 deployments).
pub struct NoopLookahead;

#[async_trait]
impl SpeculativeRunner for NoopLookahead {
    async fn run(&self, _repository: &str) {}
}

pub struct ChainedLookahead {
    pool: SqlitePool,
    leases: Arc<LeaseManager>,
    depth: usize,
    metrics: Arc<Metrics>,
}

impl ChainedLookahead {
    pub fn new(
        pool: SqlitePool,
        leases: Arc<LeaseManager>,
        depth: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            leases,
            depth,
            metrics,
        }
    }

    async fn run_inner(&self, repository: &str) -> PipelineResult<()> {
        // Shared mode: the main path may still hold its exclusive lease in
        // this process; we only touch refs/queue/* and never sync back.
        let lease = self
            .leases
            .acquire(repository, LeaseMode::SharedRead)
            .await?;
        let result = self.build_chain(&lease, repository).await;
        self.leases.release(lease, false).await?;
        result
    }

    async fn build_chain(
        &self,
        lease: &RepositoryLease,
        repository: &str,
    ) -> PipelineResult<()> {
        let Some(running) = store::queue::running_item(&self.pool, repository).await? else {
            debug!("no running item; nothing to anticipate");
            return Ok(());
        };
        let Some(running_pr) =
            store::queue::pull_request(&self.pool, running.pull_request_id).await?
        else {
            return Ok(());
        };

        // The chain starts at the running item's head and advances through
        // each speculative merge commit.
        let mut chain_tip = match &running.execution_branch {
            Some(branch) => git::git_rev_parse(&lease.path, branch).await?,
            None => {
                git::git_rev_parse(
                    &lease.path,
                    &format!("refs/heads/{}", running_pr.head_branch),
                )
                .await?
            }
        };

        let candidates =
            store::queue::lookahead_candidates(&self.pool, repository, self.depth).await?;
        for item in candidates {
            if let Some(existing) = &item.execution_branch {
                // A prior pass already built this link; reuse it.
                chain_tip = git::git_rev_parse(&lease.path, existing).await?;
                continue;
            }

            let Some(pr) = store::queue::pull_request(&self.pool, item.pull_request_id).await?
            else {
                warn!(item = item.id, "queue item without pull request; chain stopped");
                break;
            };
            let head =
                git::git_rev_parse(&lease.path, &format!("refs/heads/{}", pr.head_branch)).await?;

            match git::git_merge_tree(&lease.path, &chain_tip, &head).await? {
                MergeTreeOutcome::Conflicted => {
                    // The item falls back to a synchronous merge when its
                    // turn comes; later items would inherit the conflict.
                    info!(item = item.id, pr = pr.number, "speculative chain conflict; stopping");
                    self.metrics.lookahead_conflicts_total.inc();
                    break;
                }
                MergeTreeOutcome::Clean(tree) => {
                    let message =
                        format!("Speculative merge of pull request #{}", pr.number);
                    let commit =
                        git::git_commit_tree(&lease.path, &tree, &[&chain_tip, &head], &message)
                            .await?;
                    let exec_ref = format!("refs/queue/exec-{}", item.id);
                    git::git_update_ref(&lease.path, &exec_ref, &commit, None).await?;
                    store::queue::set_execution_branch(&self.pool, item.id, &exec_ref).await?;
                    self.metrics.lookahead_branches_total.inc();
                    debug!(item = item.id, %exec_ref, %commit, "speculative branch written");
                    chain_tip = commit;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl SpeculativeRunner for ChainedLookahead {
    #[instrument(skip(self))]
    async fn run(&self, repository: &str) {
        if self.depth == 0 {
            return;
        }
        if let Err(e) = self.run_inner(repository).await {
            warn!(%repository, error = %e, "lookahead pass abandoned");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
