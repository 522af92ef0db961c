//! Fixture helpers building real repositories for tests.
//!
//! Everything here shells out to the plumbing commands (`hash-object`,
//! `mktree`, `commit-tree`) so branch histories can be written without a
//! working tree.  Test-only; all failures panic.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Run `git -C <repo> <args…>`, optionally feeding stdin, and return
/// trimmed stdout.
pub(crate) async fn git(repo: &Path, args: &[&str], stdin: Option<&str>) -> String {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo).args(args);
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().expect("spawn git");
    if let Some(input) = stdin {
        let mut handle = child.stdin.take().expect("stdin handle");
        handle
            .write_all(input.as_bytes())
            .await
            .expect("write git stdin");
    }
    let output = child.wait_with_output().await.expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Initialise a bare repository with a committer identity configured, so
/// `commit-tree` works without any global git config.
pub(crate) async fn init_fixture_repo(path: &Path) {
    std::fs::create_dir_all(path).expect("create repo dir");
    git(path, &["init", "--bare", "--initial-branch=main", "."], None).await;
    git(path, &["config", "user.name", "fixture"], None).await;
    git(path, &["config", "user.email", "fixture@example.invalid"], None).await;
}

/// Commit `files` as a full snapshot on `branch` and return the commit id.
///
/// The tree contains exactly the files given; carry ancestor files over
/// explicitly when a branch is meant to leave them untouched.
pub(crate) async fn commit_snapshot(
    repo: &Path,
    branch: &str,
    files: &[(&str, &str)],
    parent: Option<&str>,
) -> String {
    let mut tree_lines = String::new();
    for (name, contents) in files {
        let blob = git(repo, &["hash-object", "-w", "--stdin"], Some(contents)).await;
        tree_lines.push_str(&format!("100644 blob {blob}\t{name}\n"));
    }
    let tree = git(repo, &["mktree"], Some(&tree_lines)).await;

    let mut args = vec!["commit-tree".to_string(), tree];
    if let Some(p) = parent {
        args.push("-p".to_string());
        args.push(p.to_string());
    }
    args.push("-m".to_string());
    args.push(format!("snapshot on {branch}"));
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let commit = git(repo, &arg_refs, None).await;

    git(
        repo,
        &["update-ref", &format!("refs/heads/{branch}"), &commit],
        None,
    )
    .await;
    commit
}
