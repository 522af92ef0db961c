//! Pre-receive policy gate.
//!
//! Decides accept-or-reject for every inbound ref update before it is
//! allowed to land: branch protection (requires-PR, force-push), and
//! path-level write permissions.  The decision function itself is pure; the
//! only repository access is read-only (ancestry, diff) and goes through
//! the [`inspect::RepoInspector`] seam.

pub mod inspect;
pub mod prereceive;
pub mod rules;

pub use inspect::{GitRepoInspector, RepoInspector};
pub use prereceive::{evaluate, GateDecision, RefUpdate};
pub use rules::{ActorIdentity, BranchProtectionRule, PathPermissionRule};
