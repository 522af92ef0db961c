//! Domain error taxonomy for the merge integrity pipeline.
//!
//! Infrastructure plumbing uses `anyhow`; the errors that carry meaning for
//! callers (the gate, the lease manager, the scheduler) use this enum so the
//! HTTP layer and the drain loop can react to each case specifically.
//!
//! Policy rejections and merge conflicts are not errors here: both are
//! expected operation, carried as values instead
//! ([`GateDecision::Reject`](crate::gate::GateDecision) and
//! [`IntegrationOutcome`](crate::queue::IntegrationOutcome)).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Repository, pull request, branch or lease target does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The git subprocess failed or produced unparseable output.  Callers
    /// must fail closed rather than assume the operation was safe.
    #[error("git toolchain failure: {0}")]
    ToolchainFailure(String),

    /// The distributed repository lock could not be obtained before the
    /// configured wait timeout.
    #[error("lease timeout for repository {0}")]
    LeaseTimeout(String),

    /// Infrastructure failure (store, coordination, blob storage).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
