//! The per-repository drain loop.
//!
//! Serialization is layered: an in-process guard makes concurrent drain
//! invocations for the same repository no-ops, and the store-level
//! `queued -> running` compare-and-swap serializes across service
//! instances.  Item-level failures are absorbed into a terminal `failed`
//! status; the loop itself never crashes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::{MergeLabels, MergeOutcomeLabel, Metrics};
use crate::store;
use crate::store::{QueueItem, QueueStatus};

use super::lookahead::SpeculativeRunner;
use super::merge::{IntegrationOutcome, MergeExecutor};

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Drain guard
// ---------------------------------------------------------------------------

/// In-process re-entrancy guard: at most one drain per repository at a
/// time inside this service instance.
struct DrainGuard<'a> {
    draining: &'a Mutex<HashSet<String>>,
    repository: String,
}

impl<'a> DrainGuard<'a> {
    fn enter(draining: &'a Mutex<HashSet<String>>, repository: &str) -> Option<Self> {
        let mut set = draining.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(repository.to_string()) {
            return None;
        }
        Some(Self {
            draining,
            repository: repository.to_string(),
        })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.draining.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.repository);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    pool: SqlitePool,
    executor: Arc<dyn MergeExecutor>,
    lookahead: Arc<dyn SpeculativeRunner>,
    metrics: Arc<Metrics>,
    staleness_secs: u64,
    draining: Mutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        executor: Arc<dyn MergeExecutor>,
        lookahead: Arc<dyn SpeculativeRunner>,
        metrics: Arc<Metrics>,
        staleness_secs: u64,
    ) -> Self {
        Self {
            pool,
            executor,
            lookahead,
            metrics,
            staleness_secs,
            draining: Mutex::new(HashSet::new()),
        }
    }

    /// Drain the queue for one repository: reclaim stale work, then claim
    /// and process items FIFO until the queue is empty or another item is
    /// legitimately running.  Re-entrant calls are no-ops.
    #[instrument(skip(self))]
    pub async fn drain(&self, repository: &str) -> Result<()> {
        let Some(_guard) = DrainGuard::enter(&self.draining, repository) else {
            debug!("drain already in progress; skipping");
            return Ok(());
        };

        loop {
            let now = unix_now();

            let reclaimed =
                store::queue::reclaim_stale(&self.pool, repository, self.staleness_secs, now)
                    .await?;
            if reclaimed > 0 {
                warn!(reclaimed, "stale running items force-failed");
                self.metrics.stale_reclaimed_total.inc_by(reclaimed);
                // Their chained speculative results assumed they would land.
                store::queue::clear_execution_branches(&self.pool, repository).await?;
            }

            // The claim refuses while a fresh running item exists, whether
            // ours or another instance's.
            let Some(item) = store::queue::claim_next(&self.pool, repository, now).await? else {
                break;
            };
            info!(item = item.id, attempt = item.attempt_count, "queue item claimed");

            let runner = self.lookahead.clone();
            let repo = repository.to_string();
            tokio::spawn(async move {
                runner.run(&repo).await;
            });

            self.process_item(&item).await;
        }

        if let Ok(depth) = store::queue::total_queued(&self.pool).await {
            self.metrics.queue_depth.set(depth);
        }
        Ok(())
    }

    /// Sweep every repository with queued or running work.  Run
    /// periodically so stale items are reclaimed even without enqueue
    /// traffic.
    pub async fn sweep(&self) {
        let repositories = match store::queue::repositories_with_work(&self.pool).await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "sweep: repository listing failed");
                return;
            }
        };
        for repository in repositories {
            if let Err(e) = self.drain(&repository).await {
                error!(%repository, error = %e, "sweep: drain failed");
            }
        }
    }

    /// Periodic sweep loop; runs until the process shuts down.
    pub async fn sweep_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// Process one claimed item.  Never propagates an error: the item
    /// always lands in a terminal status.
    async fn process_item(&self, item: &QueueItem) {
        let pr = match store::queue::pull_request(&self.pool, item.pull_request_id).await {
            Ok(Some(pr)) => pr,
            Ok(None) => {
                warn!(item = item.id, "pull request missing; failing item");
                self.fail_item(item, MergeOutcomeLabel::Error).await;
                return;
            }
            Err(e) => {
                error!(item = item.id, error = %e, "pull request lookup failed");
                self.fail_item(item, MergeOutcomeLabel::Error).await;
                return;
            }
        };

        let started = std::time::Instant::now();
        let result = self.executor.integrate(item, &pr).await;
        self.metrics
            .merge_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(IntegrationOutcome::Merged { commit }) => {
                info!(item = item.id, pr = pr.number, %commit, "item merged");
                if let Err(e) =
                    store::queue::mark_pull_request_merged(&self.pool, pr.id).await
                {
                    error!(item = item.id, error = %e, "pull request status update failed");
                }
                if let Err(e) =
                    store::queue::complete(&self.pool, item.id, QueueStatus::Merged, unix_now())
                        .await
                {
                    error!(item = item.id, error = %e, "completion update failed");
                }
                self.metrics
                    .merges_total
                    .get_or_create(&MergeLabels {
                        outcome: MergeOutcomeLabel::Merged,
                    })
                    .inc();
            }
            Ok(IntegrationOutcome::Conflict(reason)) => {
                info!(item = item.id, %reason, "item failed: merge conflict");
                self.fail_item(item, MergeOutcomeLabel::Conflict).await;
            }
            Ok(IntegrationOutcome::CiFailed(reason)) => {
                info!(item = item.id, %reason, "item failed: CI");
                self.fail_item(item, MergeOutcomeLabel::CiFailed).await;
            }
            Ok(IntegrationOutcome::PolicyRejected(reason)) => {
                warn!(item = item.id, %reason, "item failed: policy gate rejection");
                self.fail_item(item, MergeOutcomeLabel::Error).await;
            }
            Err(e) => {
                error!(item = item.id, error = %e, "integration error; failing item");
                self.fail_item(item, MergeOutcomeLabel::Error).await;
            }
        }
    }

    async fn fail_item(&self, item: &QueueItem, outcome: MergeOutcomeLabel) {
        if let Err(e) =
            store::queue::complete(&self.pool, item.id, QueueStatus::Failed, unix_now()).await
        {
            error!(item = item.id, error = %e, "failure update failed");
        }
        // Speculative results behind this item assumed it would land.
        match store::queue::clear_execution_branches(&self.pool, &item.repository).await {
            Ok(cleared) if cleared > 0 => {
                debug!(cleared, "speculative results invalidated");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "speculative invalidation failed");
            }
        }
        self.metrics
            .merges_total
            .get_or_create(&MergeLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::PipelineResult;
    use crate::metrics::MetricsRegistry;
    use crate::queue::lookahead::NoopLookahead;
    use crate::store::connect_in_memory;
    use crate::store::queue::PullRequest;

    /// Executor stub: records what it saw, answers from a canned script
    /// keyed by pull request number.
    #[derive(Default)]
    struct ScriptedExecutor {
        outcomes: Mutex<std::collections::HashMap<i64, IntegrationOutcome>>,
        seen: Mutex<Vec<(i64, Option<String>)>>,
    }

    impl ScriptedExecutor {
        fn merge_all() -> Self {
            Self::default()
        }

        fn with_outcome(self, pr_number: i64, outcome: IntegrationOutcome) -> Self {
            self.outcomes
                .lock()
                .unwrap()
                .insert(pr_number, outcome);
            self
        }

        fn seen(&self) -> Vec<(i64, Option<String>)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MergeExecutor for ScriptedExecutor {
        async fn integrate(
            &self,
            item: &QueueItem,
            pr: &PullRequest,
        ) -> PipelineResult<IntegrationOutcome> {
            self.seen
                .lock()
                .unwrap()
                .push((pr.number, item.execution_branch.clone()));
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .get(&pr.number)
                .cloned()
                .unwrap_or(IntegrationOutcome::Merged {
                    commit: format!("commit-for-pr-{}", pr.number),
                });
            Ok(outcome)
        }
    }

    async fn seed_pr(pool: &SqlitePool, repo: &str, number: i64) -> i64 {
        sqlx::query(
            "INSERT INTO pull_requests (repository, number, base_branch, head_branch, status)
             VALUES (?, ?, 'main', ?, 'open')",
        )
        .bind(repo)
        .bind(number)
        .bind(format!("feature/{number}"))
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    fn scheduler_with(pool: SqlitePool, executor: Arc<ScriptedExecutor>) -> Scheduler {
        Scheduler::new(
            pool,
            executor,
            Arc::new(NoopLookahead),
            MetricsRegistry::new().metrics,
            600,
        )
    }

    #[tokio::test]
    async fn drain_processes_items_fifo() {
        let pool = connect_in_memory().await.unwrap();
        for n in 1..=3 {
            let pr = seed_pr(&pool, "acme/widgets", n).await;
            store::queue::enqueue(&pool, "acme/widgets", pr, 100 + n).await.unwrap();
        }
        let executor = Arc::new(ScriptedExecutor::merge_all());
        let scheduler = scheduler_with(pool.clone(), executor.clone());

        scheduler.drain("acme/widgets").await.unwrap();

        let order: Vec<i64> = executor.seen().iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![1, 2, 3]);
        for item in store::queue::list_items(&pool, "acme/widgets").await.unwrap() {
            assert_eq!(item.status, QueueStatus::Merged);
        }
    }

    #[tokio::test]
    async fn merged_item_marks_pull_request_merged() {
        let pool = connect_in_memory().await.unwrap();
        let pr = seed_pr(&pool, "acme/widgets", 1).await;
        store::queue::enqueue(&pool, "acme/widgets", pr, 100).await.unwrap();
        let executor = Arc::new(ScriptedExecutor::merge_all());
        let scheduler = scheduler_with(pool.clone(), executor);

        scheduler.drain("acme/widgets").await.unwrap();

        let merged = store::queue::pull_request(&pool, pr).await.unwrap().unwrap();
        assert_eq!(merged.status, "merged");
    }

    // Speculative results are consumed on the item's drain turn.
    #[tokio::test]
    async fn precomputed_execution_branch_reaches_the_executor() {
        let pool = connect_in_memory().await.unwrap();
        let mut ids = Vec::new();
        for n in 1..=3 {
            let pr = seed_pr(&pool, "acme/widgets", n).await;
            ids.push(store::queue::enqueue(&pool, "acme/widgets", pr, 100 + n).await.unwrap());
        }
        store::queue::set_execution_branch(&pool, ids[1], "refs/queue/exec-2")
            .await
            .unwrap();
        store::queue::set_execution_branch(&pool, ids[2], "refs/queue/exec-3")
            .await
            .unwrap();

        let executor = Arc::new(ScriptedExecutor::merge_all());
        let scheduler = scheduler_with(pool, executor.clone());
        scheduler.drain("acme/widgets").await.unwrap();

        let seen = executor.seen();
        assert_eq!(seen[0], (1, None));
        assert_eq!(seen[1], (2, Some("refs/queue/exec-2".to_string())));
        assert_eq!(seen[2], (3, Some("refs/queue/exec-3".to_string())));
    }

    // A stale running item is reclaimed and the next item proceeds.
    #[tokio::test]
    async fn stale_running_item_reclaimed_then_queue_continues() {
        let pool = connect_in_memory().await.unwrap();
        let pr1 = seed_pr(&pool, "acme/widgets", 1).await;
        let pr2 = seed_pr(&pool, "acme/widgets", 2).await;
        let stale = store::queue::enqueue(&pool, "acme/widgets", pr1, 100).await.unwrap();
        store::queue::enqueue(&pool, "acme/widgets", pr2, 200).await.unwrap();

        // Simulate an instance that claimed the first item and died 11
        // minutes ago.
        let eleven_minutes_ago = unix_now() - 660;
        sqlx::query(
            "UPDATE merge_queue_items SET status = 'running', started_at = ? WHERE id = ?",
        )
        .bind(eleven_minutes_ago)
        .bind(stale)
        .execute(&pool)
        .await
        .unwrap();

        let executor = Arc::new(ScriptedExecutor::merge_all());
        let scheduler = scheduler_with(pool.clone(), executor.clone());
        scheduler.drain("acme/widgets").await.unwrap();

        let items = store::queue::list_items(&pool, "acme/widgets").await.unwrap();
        assert_eq!(items[0].status, QueueStatus::Failed);
        assert_eq!(items[1].status, QueueStatus::Merged);
        assert_eq!(executor.seen(), vec![(2, None)]);
    }

    #[tokio::test]
    async fn fresh_running_item_stops_the_drain() {
        let pool = connect_in_memory().await.unwrap();
        let pr1 = seed_pr(&pool, "acme/widgets", 1).await;
        let pr2 = seed_pr(&pool, "acme/widgets", 2).await;
        store::queue::enqueue(&pool, "acme/widgets", pr1, 100).await.unwrap();
        store::queue::enqueue(&pool, "acme/widgets", pr2, 200).await.unwrap();
        // Another instance is legitimately mid-flight.
        store::queue::claim_next(&pool, "acme/widgets", unix_now()).await.unwrap().unwrap();

        let executor = Arc::new(ScriptedExecutor::merge_all());
        let scheduler = scheduler_with(pool, executor.clone());
        scheduler.drain("acme/widgets").await.unwrap();

        assert!(executor.seen().is_empty());
    }

    #[tokio::test]
    async fn conflict_fails_item_and_invalidates_chain_behind_it() {
        let pool = connect_in_memory().await.unwrap();
        let pr1 = seed_pr(&pool, "acme/widgets", 1).await;
        let pr2 = seed_pr(&pool, "acme/widgets", 2).await;
        store::queue::enqueue(&pool, "acme/widgets", pr1, 100).await.unwrap();
        let second = store::queue::enqueue(&pool, "acme/widgets", pr2, 200).await.unwrap();
        store::queue::set_execution_branch(&pool, second, "refs/queue/exec-2")
            .await
            .unwrap();

        let executor = Arc::new(
            ScriptedExecutor::merge_all()
                .with_outcome(1, IntegrationOutcome::Conflict("boom".into())),
        );
        let scheduler = scheduler_with(pool.clone(), executor.clone());
        scheduler.drain("acme/widgets").await.unwrap();

        let items = store::queue::list_items(&pool, "acme/widgets").await.unwrap();
        assert_eq!(items[0].status, QueueStatus::Failed);
        assert_eq!(items[1].status, QueueStatus::Merged);
        // The second item's speculative result was built on the failed
        // item's landing and must not survive it.
        assert_eq!(executor.seen()[1], (2, None));
    }

    #[test]
    fn drain_guard_is_exclusive_per_repository() {
        let draining = Mutex::new(HashSet::new());
        let first = DrainGuard::enter(&draining, "acme/widgets");
        assert!(first.is_some());
        assert!(DrainGuard::enter(&draining, "acme/widgets").is_none());
        assert!(DrainGuard::enter(&draining, "acme/gadgets").is_some());
        drop(first);
        assert!(DrainGuard::enter(&draining, "acme/widgets").is_some());
    }
}
