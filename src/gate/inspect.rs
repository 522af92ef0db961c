//! Read-only repository queries used by the gate.
//!
//! The gate never mutates a repository and must be callable without holding
//! a lease, so its git access is isolated behind this trait.  The
//! production implementation shells out to git against the materialized
//! bare repo; tests use stubs.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::PipelineResult;
use crate::git;

#[async_trait]
pub trait RepoInspector: Send + Sync {
    /// Whether `old` is a git ancestor of `new` (fast-forward check).
    async fn is_ancestor(&self, old: &str, new: &str) -> PipelineResult<bool>;

    /// File paths changed between `baseline` and `new`.  `None` baseline
    /// means "diff against the empty tree" (the repository's very first
    /// branch is being created).
    async fn changed_paths(&self, baseline: Option<&str>, new: &str)
        -> PipelineResult<Vec<String>>;

    /// Tip commit of the default branch, if the repository has one.
    async fn default_branch_tip(&self) -> PipelineResult<Option<String>>;
}

/// Inspector backed by the system git binary against a local bare repo.
pub struct GitRepoInspector {
    repo_path: PathBuf,
}

impl GitRepoInspector {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }
}

#[async_trait]
impl RepoInspector for GitRepoInspector {
    async fn is_ancestor(&self, old: &str, new: &str) -> PipelineResult<bool> {
        git::git_is_ancestor(&self.repo_path, old, new).await
    }

    async fn changed_paths(
        &self,
        baseline: Option<&str>,
        new: &str,
    ) -> PipelineResult<Vec<String>> {
        let base = baseline.unwrap_or(git::EMPTY_TREE_OID);
        git::git_diff_paths(&self.repo_path, base, new).await
    }

    async fn default_branch_tip(&self) -> PipelineResult<Option<String>> {
        let Some(branch) = git::git_symbolic_ref_head(&self.repo_path).await? else {
            return Ok(None);
        };
        match git::git_rev_parse(&self.repo_path, &format!("refs/heads/{branch}")).await {
            Ok(tip) => Ok(Some(tip)),
            // Unborn HEAD: symref exists but the branch has no commits yet.
            Err(crate::error::PipelineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
