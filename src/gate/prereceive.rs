//! The pre-receive decision function.
//!
//! Given one inbound ref update plus the repository's stored rules and the
//! resolved actor identity, decide accept or reject before the update is
//! allowed to land.  Rejections carry the specific violated rule so the
//! author can self-correct without contacting an administrator.
//!
//! Failure discipline: if a verification (ancestry, diff) cannot be
//! performed, the gate rejects.  An unverified update is never accepted.

use tracing::{debug, instrument, warn};

use crate::git::ZERO_OID;

use super::inspect::RepoInspector;
use super::rules::{
    check_path_permissions, find_matching_rule, ActorIdentity, BranchProtectionRule,
    PathPermissionRule,
};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One inbound ref update, as reported by the git server hook.
#[derive(Debug, Clone)]
pub struct RefUpdate {
    pub refname: String,
    pub old_rev: String,
    pub new_rev: String,
}

impl RefUpdate {
    pub fn is_creation(&self) -> bool {
        self.old_rev == ZERO_OID
    }

    pub fn is_deletion(&self) -> bool {
        self.new_rev == ZERO_OID
    }

    /// The branch name when this update targets `refs/heads/*`.
    pub fn branch(&self) -> Option<&str> {
        self.refname.strip_prefix("refs/heads/")
    }
}

/// Outcome of the gate.  Rejection reasons are surfaced verbatim to the
/// pushing client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    Reject { reason: String },
}

impl GateDecision {
    fn reject(reason: impl Into<String>) -> Self {
        GateDecision::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, GateDecision::Accept)
    }
}

// ---------------------------------------------------------------------------
// Decision function
// ---------------------------------------------------------------------------

/// Evaluate one ref update against the repository's protection and path
/// permission rules.
///
/// Branch-protection constraints (requires-PR, force-push) apply only when
/// a rule matches the branch; path permission rules apply to every branch
/// update whenever any exist for the repository.
#[instrument(skip_all, fields(refname = %update.refname, pusher = ?actor.username))]
pub async fn evaluate(
    update: &RefUpdate,
    actor: &ActorIdentity,
    protection_rules: &[BranchProtectionRule],
    path_rules: &[PathPermissionRule],
    inspector: &dyn RepoInspector,
) -> GateDecision {
    // Non-branch refs (tags, notes, queue refs) are not this gate's concern.
    let Some(branch) = update.branch() else {
        debug!("non-branch ref; accepted");
        return GateDecision::Accept;
    };

    if let Some(rule) = find_matching_rule(protection_rules, branch) {
        debug!(pattern = %rule.pattern, "protection rule matched");

        if rule.requires_pr && !actor.system {
            if update.is_deletion() {
                return GateDecision::reject(format!(
                    "deleting protected branch '{branch}' is not allowed"
                ));
            }
            // The only legitimate way to advance a PR-required branch is the
            // merge queue's internal update path, which runs as a system
            // actor.  End-user pushes never qualify.
            return GateDecision::reject(format!(
                "branch '{branch}' requires a Pull Request; direct pushes are not allowed"
            ));
        }

        if !rule.allow_force_pushes && !update.is_creation() && !update.is_deletion() {
            match inspector.is_ancestor(&update.old_rev, &update.new_rev).await {
                Ok(true) => {}
                Ok(false) => {
                    return GateDecision::reject(format!(
                        "force push to '{branch}' is not allowed (non-fast-forward update)"
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "ancestry check failed; rejecting (fail closed)");
                    return GateDecision::reject(format!(
                        "unable to verify fast-forward for '{branch}'; update rejected"
                    ));
                }
            }
        }
    }

    if !path_rules.is_empty() && !actor.system {
        if actor.is_anonymous() {
            return GateDecision::reject(
                "anonymous pushes are not allowed to a repository with path permissions",
            );
        }

        // Deletions change no files; nothing further to check.
        if update.is_deletion() {
            return GateDecision::Accept;
        }

        let baseline = if update.is_creation() {
            // New branch: diff against the default branch tip, or against
            // the empty tree when the default branch itself is being born.
            match inspector.default_branch_tip().await {
                Ok(tip) => tip,
                Err(e) => {
                    warn!(error = %e, "default branch lookup failed; rejecting (fail closed)");
                    return GateDecision::reject(
                        "unable to determine diff baseline; update rejected",
                    );
                }
            }
        } else {
            Some(update.old_rev.clone())
        };

        let changed = match inspector
            .changed_paths(baseline.as_deref(), &update.new_rev)
            .await
        {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "diff computation failed; rejecting (fail closed)");
                return GateDecision::reject(
                    "unable to compute changed paths; update rejected",
                );
            }
        };

        if let Err(offending) = check_path_permissions(path_rules, actor, &changed) {
            let who = actor.username.as_deref().unwrap_or("anonymous");
            return GateDecision::reject(format!(
                "user '{who}' does not have write permission for path '{offending}'"
            ));
        }
    }

    debug!("accepted");
    GateDecision::Accept
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
