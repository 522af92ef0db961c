//! Rule and actor queries.
//!
//! Rule administration belongs to the forge's CRUD layer; the pipeline only
//! reads.  The insert helpers below exist for tests and local seeding.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::gate::rules::{ActorIdentity, BranchProtectionRule, PathPermissionRule};

/// Protection rules for a repository, in storage order.
pub async fn load_protection_rules(
    pool: &SqlitePool,
    repository: &str,
) -> Result<Vec<BranchProtectionRule>> {
    let rows = sqlx::query(
        "SELECT pattern, requires_pr, allow_force_pushes, active, position
         FROM branch_protection_rules
         WHERE repository = ?
         ORDER BY position, id",
    )
    .bind(repository)
    .fetch_all(pool)
    .await
    .context("protection rule query failed")?;

    Ok(rows
        .iter()
        .map(|r| BranchProtectionRule {
            pattern: r.get("pattern"),
            requires_pr: r.get::<i64, _>("requires_pr") != 0,
            allow_force_pushes: r.get::<i64, _>("allow_force_pushes") != 0,
            active: r.get::<i64, _>("active") != 0,
            position: r.get("position"),
        })
        .collect())
}

pub async fn load_path_rules(
    pool: &SqlitePool,
    repository: &str,
) -> Result<Vec<PathPermissionRule>> {
    let rows = sqlx::query(
        "SELECT path_pattern, user_id, team_id
         FROM path_permission_rules
         WHERE repository = ?
         ORDER BY id",
    )
    .bind(repository)
    .fetch_all(pool)
    .await
    .context("path rule query failed")?;

    Ok(rows
        .iter()
        .map(|r| PathPermissionRule {
            path_pattern: r.get("path_pattern"),
            user_id: r.get("user_id"),
            team_id: r.get("team_id"),
        })
        .collect())
}

/// Resolve a push username to a full identity (user id plus team
/// memberships).  An unknown username resolves to the anonymous identity;
/// the gate decides what anonymous actors may do.
pub async fn resolve_actor(
    pool: &SqlitePool,
    username: &str,
    system_pushers: &[String],
) -> Result<ActorIdentity> {
    let system = system_pushers.iter().any(|s| s == username);

    let Some(row) = sqlx::query("SELECT id FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await
        .context("user lookup failed")?
    else {
        return Ok(ActorIdentity {
            username: None,
            user_id: None,
            team_ids: Vec::new(),
            system,
        });
    };
    let user_id: i64 = row.get("id");

    let team_rows = sqlx::query("SELECT team_id FROM team_members WHERE user_id = ?")
        .bind(user_id)
        .fetch_all(pool)
        .await
        .context("team membership lookup failed")?;

    Ok(ActorIdentity {
        username: Some(username.to_string()),
        user_id: Some(user_id),
        team_ids: team_rows.iter().map(|r| r.get("team_id")).collect(),
        system,
    })
}

// ---------------------------------------------------------------------------
// Seeding helpers
// ---------------------------------------------------------------------------

pub async fn insert_protection_rule(
    pool: &SqlitePool,
    repository: &str,
    rule: &BranchProtectionRule,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO branch_protection_rules
             (repository, pattern, requires_pr, allow_force_pushes, active, position)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(repository)
    .bind(&rule.pattern)
    .bind(rule.requires_pr as i64)
    .bind(rule.allow_force_pushes as i64)
    .bind(rule.active as i64)
    .bind(rule.position)
    .execute(pool)
    .await
    .context("protection rule insert failed")?;
    Ok(result.last_insert_rowid())
}

pub async fn insert_path_rule(
    pool: &SqlitePool,
    repository: &str,
    rule: &PathPermissionRule,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO path_permission_rules (repository, path_pattern, user_id, team_id)
         VALUES (?, ?, ?, ?)",
    )
    .bind(repository)
    .bind(&rule.path_pattern)
    .bind(rule.user_id)
    .bind(rule.team_id)
    .execute(pool)
    .await
    .context("path rule insert failed")?;
    Ok(result.last_insert_rowid())
}

pub async fn insert_user(pool: &SqlitePool, username: &str) -> Result<i64> {
    let result = sqlx::query("INSERT INTO users (username) VALUES (?)")
        .bind(username)
        .execute(pool)
        .await
        .context("user insert failed")?;
    Ok(result.last_insert_rowid())
}

pub async fn add_team_member(pool: &SqlitePool, team_id: i64, user_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO team_members (team_id, user_id) VALUES (?, ?)")
        .bind(team_id)
        .bind(user_id)
        .execute(pool)
        .await
        .context("team member insert failed")?;
    Ok(())
}
