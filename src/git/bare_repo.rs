//! Bare Git repository lifecycle management.
//!
//! Helpers for initialising, validating and sizing the bare repositories
//! the lease manager materializes on local disk.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Initialise a new bare Git repository at `path`.
///
/// Creates the directory (and any missing parents) and runs
/// `git init --bare`.  If the directory already contains a valid bare repo
/// (i.e. has a `HEAD` file), this is a no-op.
#[instrument(fields(path = %path.display()))]
pub async fn init_bare_repo(path: &Path) -> Result<()> {
    if path.exists() && path.join("HEAD").is_file() {
        debug!("bare repo already exists; skipping init");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    let output = Command::new("git")
        .arg("init")
        .arg("--bare")
        .arg(path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check whether `path` looks like a valid bare Git repository.
///
/// A bare repo must be a directory that contains a `HEAD` file.  This is a
/// lightweight heuristic, not a full integrity check.
#[instrument(fields(path = %path.display()))]
pub async fn validate_bare_repo(path: &Path) -> Result<bool> {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    if !is_dir {
        debug!("path does not exist or is not a directory");
        return Ok(false);
    }

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);

    if !head_exists {
        debug!("HEAD file not found; not a valid bare repo");
        return Ok(false);
    }

    Ok(true)
}

// ---------------------------------------------------------------------------
// Size
// ---------------------------------------------------------------------------

/// Synchronous recursive directory size computation.
///
/// Symlinks are not followed; only regular file sizes are counted.  Callers
/// run this inside `spawn_blocking`.
pub(crate) fn dir_size_sync(dir: &Path) -> Result<u64> {
    let mut total: u64 = 0;

    if !dir.exists() {
        return Ok(0);
    }

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(err) => {
                warn!(
                    path = %current.display(),
                    error = %err,
                    "failed to read directory during size computation"
                );
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };

            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }

    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validate_nonexistent_path() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("no-such-repo.git");
        assert!(!validate_bare_repo(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn validate_dir_with_head_file() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo.git");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        assert!(validate_bare_repo(&repo).await.unwrap());
    }

    #[test]
    fn dir_size_sync_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "aaa").unwrap(); // 3
        std::fs::write(sub.join("b.txt"), "bbbbb").unwrap(); // 5
        assert_eq!(dir_size_sync(tmp.path()).unwrap(), 8);
    }
}
