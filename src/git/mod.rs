//! Git command wrappers and bare repository management.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.  The pipeline treats git as a trusted oracle:
//! merge-tree computation, ancestry checks and diffs happen here, pack
//! encoding and object internals stay inside git itself.

pub mod bare_repo;
pub mod commands;
#[cfg(test)]
pub(crate) mod testutil;

pub use bare_repo::{init_bare_repo, validate_bare_repo};
pub use commands::{
    git_bundle_create, git_bundle_unbundle, git_commit_tree, git_delete_ref, git_diff_paths,
    git_is_ancestor, git_merge_tree, git_rev_parse, git_symbolic_ref_head, git_update_ref,
    MergeTreeOutcome, EMPTY_TREE_OID, ZERO_OID,
};
