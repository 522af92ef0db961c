//! Health aggregation for `GET /healthz`.

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::process::Command;

use crate::git::bare_repo::dir_size_sync;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub coordination: CheckResult,
    pub git: CheckResult,
    pub disk: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn healthy_with(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_store(pool: &SqlitePool) -> CheckResult {
    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("store query failed: {e}")),
    }
}

async fn check_coordination(coordinator: &dyn crate::lease::Coordinator) -> CheckResult {
    // A read of a never-held probe key exercises the backend round trip.
    match coordinator.holder("healthz:probe").await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("coordination probe failed: {e}")),
    }
}

async fn check_git() -> CheckResult {
    match Command::new("git").arg("--version").output().await {
        Ok(out) if out.status.success() => {
            CheckResult::healthy_with(String::from_utf8_lossy(&out.stdout).trim().to_string())
        }
        Ok(out) => CheckResult::unhealthy(format!("git --version exited with {}", out.status)),
        Err(e) => CheckResult::unhealthy(format!("git binary unavailable: {e}")),
    }
}

async fn check_disk(path: String, max_bytes: u64) -> CheckResult {
    let result =
        tokio::task::spawn_blocking(move || dir_size_sync(std::path::Path::new(&path))).await;
    match result {
        Ok(Ok(used)) if used > max_bytes => CheckResult::unhealthy(format!(
            "working copy usage {used} bytes exceeds max_bytes {max_bytes}"
        )),
        Ok(Ok(used)) => CheckResult::healthy_with(format!("used {used} / {max_bytes} max")),
        Ok(Err(e)) => CheckResult::unhealthy(format!("disk check failed: {e}")),
        Err(e) => CheckResult::unhealthy(format!("disk check task failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // The store, coordination and git are all required for every
    // operation; disk is a soft ceiling.
    if !checks.store.ok || !checks.coordination.ok || !checks.git.ok {
        HealthStatus::Unhealthy
    } else if !checks.disk.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

/// Run every check and aggregate.  Degraded still reports HTTP 200; only
/// Unhealthy yields a 503 from the handler.
pub async fn check_health(state: &AppState) -> HealthReport {
    let (store, coordination, git, disk) = tokio::join!(
        check_store(&state.pool),
        check_coordination(state.coordinator.as_ref()),
        check_git(),
        check_disk(
            state.config.storage.local.path.clone(),
            state.config.storage.local.max_bytes,
        ),
    );

    let checks = HealthChecks {
        store,
        coordination,
        git,
        disk,
    };
    let status = aggregate_status(&checks);
    HealthReport { status, checks }
}
