//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary for
//! the actual work.  Exit statuses are mapped onto the pipeline error
//! taxonomy: an unexpected status is a [`PipelineError::ToolchainFailure`]
//! so that callers fail closed instead of assuming the operation was safe.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{PipelineError, PipelineResult};

/// The all-zero object id: "ref does not exist".  Creation when it appears
/// as the old revision, deletion when it appears as the new revision.
pub const ZERO_OID: &str = "0000000000000000000000000000000000000000";

/// The well-known id of git's empty tree, used as the diff baseline when a
/// repository's very first branch is being created.
pub const EMPTY_TREE_OID: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run `git -C <repo> <args…>` and return (status_code, stdout, stderr).
///
/// Spawn failures (git missing, fork error) are toolchain failures; a
/// non-zero exit is returned to the caller for interpretation because
/// several git subcommands use the exit code as a boolean.
async fn run_git(repo_path: &Path, args: &[&str]) -> PipelineResult<(i32, String, String)> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo_path);
    for a in args {
        cmd.arg(a);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .map_err(|e| PipelineError::ToolchainFailure(format!("failed to spawn git: {e}")))?;

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Ok((code, stdout, stderr))
}

fn toolchain(op: &str, code: i32, stderr: &str) -> PipelineError {
    PipelineError::ToolchainFailure(format!("git {op} failed (status {code}): {}", stderr.trim()))
}

// ---------------------------------------------------------------------------
// rev-parse
// ---------------------------------------------------------------------------

/// Resolve `rev` to a full object id inside a bare repo.
#[instrument(fields(repo = %repo_path.display(), %rev))]
pub async fn git_rev_parse(repo_path: &Path, rev: &str) -> PipelineResult<String> {
    let (code, stdout, stderr) = run_git(repo_path, &["rev-parse", "--verify", rev]).await?;
    if code != 0 {
        return Err(PipelineError::NotFound(format!(
            "revision {rev} not found: {}",
            stderr.trim()
        )));
    }
    Ok(stdout.trim().to_string())
}

// ---------------------------------------------------------------------------
// merge-base --is-ancestor
// ---------------------------------------------------------------------------

/// Return whether `old` is an ancestor of `new` (i.e. the update is a
/// fast-forward).  Exit 0 means ancestor, exit 1 means not an ancestor; any
/// other status is a toolchain failure the caller must treat as "unverified".
#[instrument(fields(repo = %repo_path.display(), %old, %new))]
pub async fn git_is_ancestor(repo_path: &Path, old: &str, new: &str) -> PipelineResult<bool> {
    let (code, _stdout, stderr) =
        run_git(repo_path, &["merge-base", "--is-ancestor", old, new]).await?;
    match code {
        0 => Ok(true),
        1 => Ok(false),
        c => Err(toolchain("merge-base --is-ancestor", c, &stderr)),
    }
}

// ---------------------------------------------------------------------------
// diff --name-only
// ---------------------------------------------------------------------------

/// List the file paths changed between `base` and `new`.
///
/// `base` may be [`EMPTY_TREE_OID`] when diffing a repository's first
/// commit.
#[instrument(fields(repo = %repo_path.display(), %base, %new))]
pub async fn git_diff_paths(
    repo_path: &Path,
    base: &str,
    new: &str,
) -> PipelineResult<Vec<String>> {
    let (code, stdout, stderr) = run_git(repo_path, &["diff", "--name-only", base, new]).await?;
    if code != 0 {
        return Err(toolchain("diff --name-only", code, &stderr));
    }
    let paths = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    debug!(changed = paths.len(), "diff computed");
    Ok(paths)
}

// ---------------------------------------------------------------------------
// symbolic-ref (default branch)
// ---------------------------------------------------------------------------

/// Return the short name of the default branch (`HEAD` symref target), or
/// `None` when HEAD is unborn or detached.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_symbolic_ref_head(repo_path: &Path) -> PipelineResult<Option<String>> {
    let (code, stdout, _stderr) =
        run_git(repo_path, &["symbolic-ref", "--short", "-q", "HEAD"]).await?;
    if code != 0 {
        return Ok(None);
    }
    let name = stdout.trim();
    if name.is_empty() {
        Ok(None)
    } else {
        Ok(Some(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// merge-tree
// ---------------------------------------------------------------------------

/// Result of a `git merge-tree --write-tree` computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeTreeOutcome {
    /// The merge is clean; the value is the resulting tree object id.
    Clean(String),
    /// The merge has content or tree conflicts.
    Conflicted,
}

/// Compute a real three-way merge of `base` and `head` without touching any
/// working directory.  Exit 0 means a clean merge (stdout starts with the
/// tree oid), exit 1 means conflicts.
#[instrument(fields(repo = %repo_path.display(), %base, %head))]
pub async fn git_merge_tree(
    repo_path: &Path,
    base: &str,
    head: &str,
) -> PipelineResult<MergeTreeOutcome> {
    let (code, stdout, stderr) =
        run_git(repo_path, &["merge-tree", "--write-tree", base, head]).await?;
    match code {
        0 => {
            let tree = parse_merge_tree_oid(&stdout).ok_or_else(|| {
                PipelineError::ToolchainFailure(format!(
                    "merge-tree produced no tree oid: {stdout:?}"
                ))
            })?;
            debug!(%tree, "merge-tree clean");
            Ok(MergeTreeOutcome::Clean(tree))
        }
        1 => {
            debug!("merge-tree conflicted");
            Ok(MergeTreeOutcome::Conflicted)
        }
        c => Err(toolchain("merge-tree", c, &stderr)),
    }
}

/// The first line of `merge-tree --write-tree` output is the tree oid.
fn parse_merge_tree_oid(stdout: &str) -> Option<String> {
    let first = stdout.lines().next()?.trim();
    if first.len() >= 40 && first.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(first.to_string())
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// commit-tree
// ---------------------------------------------------------------------------

/// Create a commit object for `tree` with the given parents and message.
/// Returns the new commit id.
#[instrument(skip(message), fields(repo = %repo_path.display(), %tree))]
pub async fn git_commit_tree(
    repo_path: &Path,
    tree: &str,
    parents: &[&str],
    message: &str,
) -> PipelineResult<String> {
    let mut args = vec!["commit-tree".to_string(), tree.to_string()];
    for p in parents {
        args.push("-p".to_string());
        args.push((*p).to_string());
    }
    args.push("-m".to_string());
    args.push(message.to_string());

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let (code, stdout, stderr) = run_git(repo_path, &arg_refs).await?;
    if code != 0 {
        return Err(toolchain("commit-tree", code, &stderr));
    }
    Ok(stdout.trim().to_string())
}

// ---------------------------------------------------------------------------
// update-ref
// ---------------------------------------------------------------------------

/// Point `refname` at `new_oid`.  When `expected_old` is given the update is
/// a compare-and-swap: git refuses it if the ref moved in the meantime.
#[instrument(fields(repo = %repo_path.display(), %refname, %new_oid))]
pub async fn git_update_ref(
    repo_path: &Path,
    refname: &str,
    new_oid: &str,
    expected_old: Option<&str>,
) -> PipelineResult<()> {
    let mut args = vec!["update-ref", refname, new_oid];
    if let Some(old) = expected_old {
        args.push(old);
    }
    let (code, _stdout, stderr) = run_git(repo_path, &args).await?;
    if code != 0 {
        return Err(toolchain("update-ref", code, &stderr));
    }
    debug!("ref updated");
    Ok(())
}

/// Delete `refname`.  Deleting an absent ref is not an error for callers
/// cleaning up disposable speculative branches.
#[instrument(fields(repo = %repo_path.display(), %refname))]
pub async fn git_delete_ref(repo_path: &Path, refname: &str) -> PipelineResult<()> {
    let (code, _stdout, stderr) = run_git(repo_path, &["update-ref", "-d", refname]).await?;
    if code != 0 && !stderr.contains("unable to resolve") {
        return Err(toolchain("update-ref -d", code, &stderr));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Bundles (blob storage sync)
// ---------------------------------------------------------------------------

/// Run `git bundle create <output> --all` inside a bare repo.  The bundle
/// is the durable-storage representation of the whole repository.
#[instrument(fields(repo = %repo_path.display(), output = %output.display()))]
pub async fn git_bundle_create(repo_path: &Path, output: &Path) -> PipelineResult<()> {
    let output_str = output.to_string_lossy();
    let (code, _stdout, stderr) =
        run_git(repo_path, &["bundle", "create", &output_str, "--all"]).await?;
    if code != 0 {
        return Err(toolchain("bundle create", code, &stderr));
    }
    debug!("bundle created");
    Ok(())
}

/// Run `git bundle unbundle <bundle_path>` inside a bare repo, then fix up
/// refs: unbundle imports objects but ref updates come via `fetch`.
#[instrument(fields(bundle = %bundle_path.display(), repo = %repo_path.display()))]
pub async fn git_bundle_unbundle(bundle_path: &Path, repo_path: &Path) -> PipelineResult<()> {
    let bundle_str = bundle_path.to_string_lossy();
    let (code, _stdout, stderr) = run_git(
        repo_path,
        &["fetch", "--force", &bundle_str, "+refs/*:refs/*"],
    )
    .await?;
    if code != 0 {
        return Err(toolchain("fetch from bundle", code, &stderr));
    }
    debug!("bundle applied");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_tree_oid_parses_clean_output() {
        let stdout = "3f786850e387550fdab836ed7e6dc881de23001b\n";
        assert_eq!(
            parse_merge_tree_oid(stdout).as_deref(),
            Some("3f786850e387550fdab836ed7e6dc881de23001b")
        );
    }

    #[test]
    fn merge_tree_oid_rejects_garbage() {
        assert_eq!(parse_merge_tree_oid(""), None);
        assert_eq!(parse_merge_tree_oid("not-a-sha\n"), None);
    }

    #[test]
    fn zero_oid_is_forty_zeros() {
        assert_eq!(ZERO_OID.len(), 40);
        assert!(ZERO_OID.chars().all(|c| c == '0'));
    }
}
