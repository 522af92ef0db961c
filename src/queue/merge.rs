//! The authoritative integration path for one queue item.
//!
//! Merges are pure object-database operations: a three-way
//! `merge-tree --write-tree` computation, a `commit-tree`, and a
//! compare-and-swap `update-ref` on the protected branch.  No working
//! directory is ever checked out.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, info, instrument, warn};

use crate::error::PipelineResult;
use crate::gate::inspect::GitRepoInspector;
use crate::gate::prereceive::{evaluate, GateDecision, RefUpdate};
use crate::gate::rules::ActorIdentity;
use crate::git::{self, MergeTreeOutcome};
use crate::lease::{LeaseManager, LeaseMode, RepositoryLease};
use crate::metrics::Metrics;
use crate::store;
use crate::store::queue::PullRequest;
use crate::store::QueueItem;

use super::ci::{CiGate, CiVerdict};

/// How an integration attempt ended.  All variants are normal operation;
/// infrastructure failures surface as errors instead.
#[derive(Debug, Clone)]
pub enum IntegrationOutcome {
    Merged { commit: String },
    Conflict(String),
    CiFailed(String),
    PolicyRejected(String),
}

#[async_trait]
pub trait MergeExecutor: Send + Sync {
    async fn integrate(
        &self,
        item: &QueueItem,
        pr: &PullRequest,
    ) -> PipelineResult<IntegrationOutcome>;
}

enum Speculation {
    /// CI passed for the speculative branch; reuse its merged tree.
    Verified(String),
    /// CI failed for the speculative branch.
    Failed,
}

pub struct GitMergeExecutor {
    leases: Arc<LeaseManager>,
    ci: Arc<dyn CiGate>,
    pool: SqlitePool,
    system_user: String,
    metrics: Arc<Metrics>,
}

impl GitMergeExecutor {
    pub fn new(
        leases: Arc<LeaseManager>,
        ci: Arc<dyn CiGate>,
        pool: SqlitePool,
        system_user: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            leases,
            ci,
            pool,
            system_user: system_user.into(),
            metrics,
        }
    }

    /// Check the speculative branch's actual CI verdict.  The branch
    /// existing is not enough; only a `Passed` verdict lets its tree be
    /// reused.
    async fn consume_speculation(
        &self,
        lease: &RepositoryLease,
        repository: &str,
        branch: &str,
    ) -> PipelineResult<Speculation> {
        let verdict = match self.ci.verdict(repository, branch).await? {
            CiVerdict::Pending => self.ci.await_verdict(repository, branch).await?,
            v => v,
        };
        match verdict {
            CiVerdict::Passed => {
                let tree = git::git_rev_parse(&lease.path, &format!("{branch}^{{tree}}")).await?;
                Ok(Speculation::Verified(tree))
            }
            _ => Ok(Speculation::Failed),
        }
    }

    async fn integrate_locked(
        &self,
        lease: &RepositoryLease,
        item: &QueueItem,
        pr: &PullRequest,
    ) -> PipelineResult<IntegrationOutcome> {
        let base_ref = format!("refs/heads/{}", pr.base_branch);
        let base_tip = git::git_rev_parse(&lease.path, &base_ref).await?;
        let head_tip =
            git::git_rev_parse(&lease.path, &format!("refs/heads/{}", pr.head_branch)).await?;
        let exec_ref = format!("refs/queue/exec-{}", item.id);

        // A speculative result skips the merge recomputation and the CI
        // wait, but only with a verified passing verdict.  Lookup errors
        // fall back to the synchronous path.
        let mut verified_tree: Option<String> = None;
        let mut ci_verified = false;
        if let Some(branch) = &item.execution_branch {
            match self.consume_speculation(lease, &item.repository, branch).await {
                Ok(Speculation::Verified(tree)) => {
                    debug!(%branch, "reusing speculative merge result");
                    self.metrics.lookahead_hits_total.inc();
                    verified_tree = Some(tree);
                    ci_verified = true;
                }
                Ok(Speculation::Failed) => {
                    return Ok(IntegrationOutcome::CiFailed(format!(
                        "CI failed for speculative branch {branch}"
                    )));
                }
                Err(e) => {
                    warn!(%branch, error = %e, "speculative verdict unavailable; merging synchronously");
                }
            }
        }

        let tree = match verified_tree {
            Some(tree) => tree,
            None => match git::git_merge_tree(&lease.path, &base_tip, &head_tip).await? {
                MergeTreeOutcome::Conflicted => {
                    return Ok(IntegrationOutcome::Conflict(format!(
                        "merging '{}' into '{}' produces conflicts",
                        pr.head_branch, pr.base_branch
                    )));
                }
                MergeTreeOutcome::Clean(tree) => tree,
            },
        };

        let message = format!(
            "Merge pull request #{} from {}",
            pr.number, pr.head_branch
        );
        let commit =
            git::git_commit_tree(&lease.path, &tree, &[&base_tip, &head_tip], &message).await?;

        // Without a verified speculative result the merge commit still has
        // to pass CI before it may land.
        if !ci_verified {
            git::git_update_ref(&lease.path, &exec_ref, &commit, None).await?;
            match self.ci.await_verdict(&item.repository, &exec_ref).await? {
                CiVerdict::Passed => {}
                _ => {
                    return Ok(IntegrationOutcome::CiFailed(format!(
                        "CI failed for merge of pull request #{}",
                        pr.number
                    )));
                }
            }
        }

        // Every lease-holding write passes the same pre-receive checks
        // human pushes do, as a system actor.
        let protection = store::rules::load_protection_rules(&self.pool, &item.repository).await?;
        let path_rules = store::rules::load_path_rules(&self.pool, &item.repository).await?;
        let actor = ActorIdentity {
            username: Some(self.system_user.clone()),
            user_id: None,
            team_ids: Vec::new(),
            system: true,
        };
        let update = RefUpdate {
            refname: base_ref.clone(),
            old_rev: base_tip.clone(),
            new_rev: commit.clone(),
        };
        let inspector = GitRepoInspector::new(&lease.path);
        if let GateDecision::Reject { reason } =
            evaluate(&update, &actor, &protection, &path_rules, &inspector).await
        {
            return Ok(IntegrationOutcome::PolicyRejected(reason));
        }

        // Compare-and-swap on the base tip we merged against.
        git::git_update_ref(&lease.path, &base_ref, &commit, Some(&base_tip)).await?;
        git::git_delete_ref(&lease.path, &exec_ref).await?;

        info!(repository = %item.repository, pr = pr.number, %commit, "pull request merged");
        Ok(IntegrationOutcome::Merged { commit })
    }
}

#[async_trait]
impl MergeExecutor for GitMergeExecutor {
    #[instrument(skip_all, fields(repository = %item.repository, item = item.id))]
    async fn integrate(
        &self,
        item: &QueueItem,
        pr: &PullRequest,
    ) -> PipelineResult<IntegrationOutcome> {
        let lease = self
            .leases
            .acquire(&item.repository, LeaseMode::Exclusive)
            .await?;

        let result = self.integrate_locked(&lease, item, pr).await;

        let modified = matches!(result, Ok(IntegrationOutcome::Merged { .. }));
        if let Err(e) = self.leases.release(lease, modified).await {
            warn!(repository = %item.repository, error = %e, "lease release failed");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
