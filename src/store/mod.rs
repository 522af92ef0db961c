//! Typed access to the relational store.
//!
//! The store itself is an external collaborator: the forge's CRUD layer
//! owns users, pull requests and rule administration.  This module only
//! opens the pool, applies the schema idempotently, and exposes the typed
//! queries the pipeline needs (queue items, rules, actors, pull requests).

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod queue;
pub mod rules;

pub use queue::{QueueItem, QueueStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS merge_queue_items (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    repository       TEXT    NOT NULL,
    pull_request_id  INTEGER NOT NULL,
    status           TEXT    NOT NULL DEFAULT 'queued',
    queued_at        INTEGER NOT NULL,
    started_at       INTEGER,
    completed_at     INTEGER,
    attempt_count    INTEGER NOT NULL DEFAULT 0,
    last_attempt_at  INTEGER,
    execution_branch TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_repo_status
    ON merge_queue_items (repository, status);

CREATE TABLE IF NOT EXISTS pull_requests (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    repository  TEXT    NOT NULL,
    number      INTEGER NOT NULL,
    base_branch TEXT    NOT NULL,
    head_branch TEXT    NOT NULL,
    status      TEXT    NOT NULL DEFAULT 'open'
);

CREATE TABLE IF NOT EXISTS branch_protection_rules (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    repository         TEXT    NOT NULL,
    pattern            TEXT    NOT NULL,
    requires_pr        INTEGER NOT NULL DEFAULT 0,
    allow_force_pushes INTEGER NOT NULL DEFAULT 1,
    active             INTEGER NOT NULL DEFAULT 1,
    position           INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS path_permission_rules (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    repository   TEXT    NOT NULL,
    path_pattern TEXT    NOT NULL,
    user_id      INTEGER,
    team_id      INTEGER,
    CHECK ((user_id IS NULL) != (team_id IS NULL))
);

CREATE TABLE IF NOT EXISTS users (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS team_members (
    team_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    PRIMARY KEY (team_id, user_id)
);
"#;

/// Open (creating if missing) the SQLite database at `path` and apply the
/// schema.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open store at {path}"))?;

    apply_schema(&pool).await?;
    Ok(pool)
}

/// In-memory store for tests.  A single connection keeps every query on
/// the same in-memory database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("failed to open in-memory store")?;
    apply_schema(&pool).await?;
    Ok(pool)
}

async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("schema statement failed: {statement}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_applies_cleanly() {
        let pool = connect_in_memory().await.unwrap();
        // Idempotent: applying twice must not error.
        apply_schema(&pool).await.unwrap();
    }
}
