//! Typed queries over `merge_queue_items` and `pull_requests`.
//!
//! All state transitions are single-statement conditional updates so that
//! concurrent drain invocations (in this process or another instance)
//! cannot interleave a read-check-then-write sequence: the affected-row
//! count of each update is the authoritative answer to "did I win".

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    Running,
    Merged,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Running => "running",
            QueueStatus::Merged => "merged",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(QueueStatus::Queued),
            "running" => Some(QueueStatus::Running),
            "merged" => Some(QueueStatus::Merged),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Merged | QueueStatus::Failed)
    }
}

/// One pending integration request.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub repository: String,
    pub pull_request_id: i64,
    pub status: QueueStatus,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub attempt_count: i64,
    pub last_attempt_at: Option<i64>,
    pub execution_branch: Option<String>,
}

/// The pull request a queue item integrates (read-only interface to the
/// forge's own data).
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub id: i64,
    pub repository: String,
    pub number: i64,
    pub base_branch: String,
    pub head_branch: String,
    pub status: String,
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<QueueItem> {
    let status_str: String = row.get("status");
    let status = QueueStatus::parse(&status_str)
        .with_context(|| format!("unknown queue status in store: {status_str}"))?;
    Ok(QueueItem {
        id: row.get("id"),
        repository: row.get("repository"),
        pull_request_id: row.get("pull_request_id"),
        status,
        queued_at: row.get("queued_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        attempt_count: row.get("attempt_count"),
        last_attempt_at: row.get("last_attempt_at"),
        execution_branch: row.get("execution_branch"),
    })
}

// ---------------------------------------------------------------------------
// Enqueue / lookup
// ---------------------------------------------------------------------------

/// Insert a new queued item and return its id.
pub async fn enqueue(
    pool: &SqlitePool,
    repository: &str,
    pull_request_id: i64,
    now: i64,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO merge_queue_items (repository, pull_request_id, status, queued_at)
         VALUES (?, ?, 'queued', ?)",
    )
    .bind(repository)
    .bind(pull_request_id)
    .bind(now)
    .execute(pool)
    .await
    .context("enqueue insert failed")?;
    Ok(result.last_insert_rowid())
}

/// The currently running item for a repository, if any.
pub async fn running_item(pool: &SqlitePool, repository: &str) -> Result<Option<QueueItem>> {
    let row = sqlx::query(
        "SELECT * FROM merge_queue_items WHERE repository = ? AND status = 'running' LIMIT 1",
    )
    .bind(repository)
    .fetch_optional(pool)
    .await
    .context("running item query failed")?;
    row.as_ref().map(item_from_row).transpose()
}

pub async fn item_by_id(pool: &SqlitePool, id: i64) -> Result<Option<QueueItem>> {
    let row = sqlx::query("SELECT * FROM merge_queue_items WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("item lookup failed")?;
    row.as_ref().map(item_from_row).transpose()
}

/// All items for a repository in queue order (operator listing).
pub async fn list_items(pool: &SqlitePool, repository: &str) -> Result<Vec<QueueItem>> {
    let rows = sqlx::query(
        "SELECT * FROM merge_queue_items WHERE repository = ? ORDER BY queued_at, id",
    )
    .bind(repository)
    .fetch_all(pool)
    .await
    .context("queue listing failed")?;
    rows.iter().map(item_from_row).collect()
}

/// Repositories that currently have queued or running work, for the
/// background drain sweep.
pub async fn repositories_with_work(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT DISTINCT repository FROM merge_queue_items
         WHERE status IN ('queued', 'running')",
    )
    .fetch_all(pool)
    .await
    .context("work listing failed")?;
    Ok(rows.iter().map(|r| r.get("repository")).collect())
}

/// Count of queued items across every repository (queue depth gauge).
pub async fn total_queued(pool: &SqlitePool) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM merge_queue_items WHERE status = 'queued'")
        .fetch_one(pool)
        .await
        .context("depth query failed")?;
    Ok(row.get("n"))
}

// ---------------------------------------------------------------------------
// State transitions
// ---------------------------------------------------------------------------

/// Force any running item older than `staleness_secs` to failed.
///
/// Returns the number of reclaimed items.  The conditional update makes the
/// transition exactly-once even when drains run concurrently: only one
/// caller observes a non-zero affected-row count per stale item.
pub async fn reclaim_stale(
    pool: &SqlitePool,
    repository: &str,
    staleness_secs: u64,
    now: i64,
) -> Result<u64> {
    let cutoff = now - staleness_secs as i64;
    let result = sqlx::query(
        "UPDATE merge_queue_items
         SET status = 'failed', completed_at = ?
         WHERE repository = ? AND status = 'running' AND started_at < ?",
    )
    .bind(now)
    .bind(repository)
    .bind(cutoff)
    .execute(pool)
    .await
    .context("stale reclamation failed")?;
    Ok(result.rows_affected())
}

/// Atomically claim the oldest queued item for `repository`.
///
/// The `queued -> running` compare-and-swap is guarded by a NOT EXISTS
/// subquery on a running sibling, so at most one item per repository can
/// hold `running` no matter how many schedulers race.  Returns the claimed
/// item, or `None` when the queue is empty or another item is running.
pub async fn claim_next(pool: &SqlitePool, repository: &str, now: i64) -> Result<Option<QueueItem>> {
    let result = sqlx::query(
        "UPDATE merge_queue_items
         SET status = 'running',
             started_at = ?,
             attempt_count = attempt_count + 1,
             last_attempt_at = ?
         WHERE id = (
                 SELECT id FROM merge_queue_items
                 WHERE repository = ? AND status = 'queued'
                 ORDER BY queued_at, id
                 LIMIT 1
             )
           AND status = 'queued'
           AND NOT EXISTS (
                 SELECT 1 FROM merge_queue_items
                 WHERE repository = ? AND status = 'running'
             )",
    )
    .bind(now)
    .bind(now)
    .bind(repository)
    .bind(repository)
    .execute(pool)
    .await
    .context("claim update failed")?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    running_item(pool, repository).await
}

/// Transition a running item to a terminal status.
pub async fn complete(
    pool: &SqlitePool,
    item_id: i64,
    status: QueueStatus,
    now: i64,
) -> Result<()> {
    debug_assert!(status.is_terminal());
    sqlx::query(
        "UPDATE merge_queue_items
         SET status = ?, completed_at = ?
         WHERE id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(item_id)
    .execute(pool)
    .await
    .context("completion update failed")?;
    Ok(())
}

/// Record the speculative merge branch for an item.
pub async fn set_execution_branch(pool: &SqlitePool, item_id: i64, branch: &str) -> Result<()> {
    sqlx::query("UPDATE merge_queue_items SET execution_branch = ? WHERE id = ?")
        .bind(branch)
        .bind(item_id)
        .execute(pool)
        .await
        .context("execution branch update failed")?;
    Ok(())
}

/// Clear speculative results for every still-queued item of a repository.
/// Called when an item fails: the chained speculative merges behind it
/// assumed it would land.
pub async fn clear_execution_branches(pool: &SqlitePool, repository: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE merge_queue_items
         SET execution_branch = NULL
         WHERE repository = ? AND status = 'queued' AND execution_branch IS NOT NULL",
    )
    .bind(repository)
    .execute(pool)
    .await
    .context("execution branch invalidation failed")?;
    Ok(result.rows_affected())
}

/// The next `limit` queued items behind the running one, FIFO.
pub async fn lookahead_candidates(
    pool: &SqlitePool,
    repository: &str,
    limit: usize,
) -> Result<Vec<QueueItem>> {
    let rows = sqlx::query(
        "SELECT * FROM merge_queue_items
         WHERE repository = ? AND status = 'queued'
         ORDER BY queued_at, id
         LIMIT ?",
    )
    .bind(repository)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    .context("lookahead candidate query failed")?;
    rows.iter().map(item_from_row).collect()
}

// ---------------------------------------------------------------------------
// Pull requests
// ---------------------------------------------------------------------------

pub async fn pull_request(pool: &SqlitePool, id: i64) -> Result<Option<PullRequest>> {
    let row = sqlx::query("SELECT * FROM pull_requests WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("pull request lookup failed")?;
    Ok(row.map(|r| PullRequest {
        id: r.get("id"),
        repository: r.get("repository"),
        number: r.get("number"),
        base_branch: r.get("base_branch"),
        head_branch: r.get("head_branch"),
        status: r.get("status"),
    }))
}

pub async fn mark_pull_request_merged(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE pull_requests SET status = 'merged' WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("pull request merge update failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connect_in_memory;

    async fn seed_pr(pool: &SqlitePool, repo: &str, number: i64) -> i64 {
        let result = sqlx::query(
            "INSERT INTO pull_requests (repository, number, base_branch, head_branch, status)
             VALUES (?, ?, 'main', ?, 'open')",
        )
        .bind(repo)
        .bind(number)
        .bind(format!("feature/{number}"))
        .execute(pool)
        .await
        .unwrap();
        result.last_insert_rowid()
    }

    #[tokio::test]
    async fn claim_is_fifo_by_queue_time() {
        let pool = connect_in_memory().await.unwrap();
        let pr1 = seed_pr(&pool, "acme/widgets", 1).await;
        let pr2 = seed_pr(&pool, "acme/widgets", 2).await;
        let first = enqueue(&pool, "acme/widgets", pr1, 100).await.unwrap();
        let _second = enqueue(&pool, "acme/widgets", pr2, 200).await.unwrap();

        let claimed = claim_next(&pool, "acme/widgets", 300).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, QueueStatus::Running);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.started_at, Some(300));
    }

    #[tokio::test]
    async fn claim_refuses_while_another_item_runs() {
        let pool = connect_in_memory().await.unwrap();
        let pr1 = seed_pr(&pool, "acme/widgets", 1).await;
        let pr2 = seed_pr(&pool, "acme/widgets", 2).await;
        enqueue(&pool, "acme/widgets", pr1, 100).await.unwrap();
        enqueue(&pool, "acme/widgets", pr2, 200).await.unwrap();

        let first = claim_next(&pool, "acme/widgets", 300).await.unwrap();
        assert!(first.is_some());
        let second = claim_next(&pool, "acme/widgets", 301).await.unwrap();
        assert!(second.is_none(), "claim must refuse while an item is running");
    }

    #[tokio::test]
    async fn repositories_are_independent() {
        let pool = connect_in_memory().await.unwrap();
        let pr_a = seed_pr(&pool, "acme/widgets", 1).await;
        let pr_b = seed_pr(&pool, "acme/gadgets", 1).await;
        enqueue(&pool, "acme/widgets", pr_a, 100).await.unwrap();
        enqueue(&pool, "acme/gadgets", pr_b, 100).await.unwrap();

        assert!(claim_next(&pool, "acme/widgets", 200).await.unwrap().is_some());
        assert!(claim_next(&pool, "acme/gadgets", 200).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_running_item_reclaimed_exactly_once() {
        let pool = connect_in_memory().await.unwrap();
        let pr = seed_pr(&pool, "acme/widgets", 1).await;
        enqueue(&pool, "acme/widgets", pr, 100).await.unwrap();
        let item = claim_next(&pool, "acme/widgets", 1000).await.unwrap().unwrap();

        // 11 minutes later with a 10 minute threshold.
        let now = 1000 + 660;
        let first = reclaim_stale(&pool, "acme/widgets", 600, now).await.unwrap();
        let second = reclaim_stale(&pool, "acme/widgets", 600, now).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0, "reclamation must be exactly-once");

        let reclaimed = item_by_id(&pool, item.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, QueueStatus::Failed);
    }

    #[tokio::test]
    async fn fresh_running_item_is_not_reclaimed() {
        let pool = connect_in_memory().await.unwrap();
        let pr = seed_pr(&pool, "acme/widgets", 1).await;
        enqueue(&pool, "acme/widgets", pr, 100).await.unwrap();
        claim_next(&pool, "acme/widgets", 1000).await.unwrap().unwrap();

        let reclaimed = reclaim_stale(&pool, "acme/widgets", 600, 1300).await.unwrap();
        assert_eq!(reclaimed, 0);
    }

    #[tokio::test]
    async fn completion_frees_the_queue() {
        let pool = connect_in_memory().await.unwrap();
        let pr1 = seed_pr(&pool, "acme/widgets", 1).await;
        let pr2 = seed_pr(&pool, "acme/widgets", 2).await;
        enqueue(&pool, "acme/widgets", pr1, 100).await.unwrap();
        enqueue(&pool, "acme/widgets", pr2, 200).await.unwrap();

        let first = claim_next(&pool, "acme/widgets", 300).await.unwrap().unwrap();
        complete(&pool, first.id, QueueStatus::Merged, 400).await.unwrap();

        let second = claim_next(&pool, "acme/widgets", 500).await.unwrap().unwrap();
        assert_eq!(second.pull_request_id, pr2);
    }

    #[tokio::test]
    async fn failure_clears_speculative_results_behind() {
        let pool = connect_in_memory().await.unwrap();
        let pr1 = seed_pr(&pool, "acme/widgets", 1).await;
        let pr2 = seed_pr(&pool, "acme/widgets", 2).await;
        enqueue(&pool, "acme/widgets", pr1, 100).await.unwrap();
        let behind = enqueue(&pool, "acme/widgets", pr2, 200).await.unwrap();

        let running = claim_next(&pool, "acme/widgets", 300).await.unwrap().unwrap();
        set_execution_branch(&pool, behind, "queue/exec-2").await.unwrap();

        complete(&pool, running.id, QueueStatus::Failed, 400).await.unwrap();
        let cleared = clear_execution_branches(&pool, "acme/widgets").await.unwrap();
        assert_eq!(cleared, 1);

        let item = item_by_id(&pool, behind).await.unwrap().unwrap();
        assert!(item.execution_branch.is_none());
    }

    #[tokio::test]
    async fn attempt_count_only_increases() {
        let pool = connect_in_memory().await.unwrap();
        let pr = seed_pr(&pool, "acme/widgets", 1).await;
        let id = enqueue(&pool, "acme/widgets", pr, 100).await.unwrap();

        let first = claim_next(&pool, "acme/widgets", 200).await.unwrap().unwrap();
        assert_eq!(first.attempt_count, 1);
        complete(&pool, id, QueueStatus::Failed, 300).await.unwrap();

        // External re-enqueue decision: reset the row to queued.
        sqlx::query("UPDATE merge_queue_items SET status = 'queued' WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        let second = claim_next(&pool, "acme/widgets", 400).await.unwrap().unwrap();
        assert_eq!(second.attempt_count, 2);
    }
}
