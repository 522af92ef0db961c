//! CI verdict seam.
//!
//! The pipeline never talks to a CI system directly: it writes speculative
//! merge branches and asks this trait for their verdicts.  A speculative
//! branch is only trusted once its verdict comes back `Passed`; the mere
//! existence of the branch proves nothing.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiVerdict {
    Passed,
    Failed,
    Pending,
}

#[async_trait]
pub trait CiGate: Send + Sync {
    /// Current verdict for `branch` in `repository`, without waiting.
    async fn verdict(&self, repository: &str, branch: &str) -> Result<CiVerdict>;

    /// Block until a terminal verdict is available.  Implementations bound
    /// the wait themselves; a bound that expires yields `Failed`.
    async fn await_verdict(&self, repository: &str, branch: &str) -> Result<CiVerdict>;
}

/// Fixed-delay stand-in for deployments with no CI integration wired up:
/// every build "runs" for the configured delay and passes.
pub struct SimulatedCi {
    delay: Duration,
}

impl SimulatedCi {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl CiGate for SimulatedCi {
    async fn verdict(&self, repository: &str, branch: &str) -> Result<CiVerdict> {
        debug!(%repository, %branch, "simulated CI verdict: passed");
        Ok(CiVerdict::Passed)
    }

    async fn await_verdict(&self, repository: &str, branch: &str) -> Result<CiVerdict> {
        debug!(%repository, %branch, delay = ?self.delay, "simulated CI run");
        tokio::time::sleep(self.delay).await;
        Ok(CiVerdict::Passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn simulated_ci_passes_after_delay() {
        let ci = SimulatedCi::new(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let verdict = ci.await_verdict("acme/widgets", "refs/queue/exec-1").await.unwrap();
        assert_eq!(verdict, CiVerdict::Passed);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
