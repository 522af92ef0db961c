//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `POST /:owner/:repo/pre-receive`  - Policy gate for one ref update
//! - `POST /:owner/:repo/queue`        - Enqueue a pull request
//! - `POST /:owner/:repo/queue/drain`  - Explicit drain trigger
//! - `GET  /:owner/:repo/queue`        - Queue listing for operators
//! - `GET  /healthz`                   - Health check
//! - `GET  /metrics`                   - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{error, info, instrument, warn};

use crate::gate::prereceive::{evaluate, GateDecision, RefUpdate};
use crate::gate::rules::ActorIdentity;
use crate::gate::GitRepoInspector;
use crate::git;
use crate::metrics::{Decision, DecisionLabels};
use crate::store;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{owner}/{repo}/pre-receive", post(handle_pre_receive))
        .route("/{owner}/{repo}/queue", post(handle_enqueue))
        .route("/{owner}/{repo}/queue", get(handle_queue_list))
        .route("/{owner}/{repo}/queue/drain", post(handle_drain))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PreReceiveRequest {
    refname: String,
    oldrev: String,
    newrev: String,
    pusher: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    pull_request_id: i64,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    id: i64,
}

#[derive(Debug, Serialize)]
struct QueueItemView {
    id: i64,
    pull_request_id: i64,
    status: &'static str,
    queued_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    attempt_count: i64,
    execution_branch: Option<String>,
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Verify the HMAC-SHA256 body signature in `X-Gate-Signature`.
fn verify_signature(secret: &str, headers: &HeaderMap, body: &Bytes) -> anyhow::Result<()> {
    let sig_header = headers
        .get("X-Gate-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow::anyhow!("missing X-Gate-Signature header"))?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| anyhow::anyhow!("X-Gate-Signature does not start with sha256="))?;

    let sig_bytes =
        hex::decode(sig_hex).map_err(|e| anyhow::anyhow!("invalid hex in signature: {e}"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("HMAC key error: {e}"))?;
    mac.update(body);

    mac.verify_slice(&sig_bytes)
        .map_err(|_| anyhow::anyhow!("HMAC signature mismatch"))?;

    Ok(())
}

fn check_request_signature(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(), AppError> {
    let secret = std::env::var(&state.config.gate.secret_env)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("gate secret env var not set")))?;
    verify_signature(&secret, headers, body).map_err(|e| {
        warn!(error = %e, "request signature verification failed");
        AppError::Unauthorized("invalid signature".to_string())
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /:owner/:repo/pre-receive`
///
/// Evaluate one inbound ref update against the repository's rules.  200 on
/// accept, 403 with the specific violated rule on reject.
#[instrument(skip(state, headers, body), fields(%owner, %repo))]
async fn handle_pre_receive(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    check_request_signature(&state, &headers, &body)?;

    let request: PreReceiveRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid request body: {e}")))?;

    let repository = format!("{owner}/{repo}");
    let repo_path = state.leases.repo_path(&repository);
    if !git::validate_bare_repo(&repo_path).await.unwrap_or(false) {
        return Err(AppError::NotFound(format!(
            "repository {repository} is not materialized on this node"
        )));
    }

    let actor = match request.pusher.as_deref() {
        None | Some("anonymous") | Some("") => ActorIdentity::anonymous(),
        Some(username) => {
            store::rules::resolve_actor(&state.pool, username, &state.config.gate.system_pushers)
                .await?
        }
    };

    let protection = store::rules::load_protection_rules(&state.pool, &repository).await?;
    let path_rules = store::rules::load_path_rules(&state.pool, &repository).await?;

    let update = RefUpdate {
        refname: request.refname,
        old_rev: request.oldrev,
        new_rev: request.newrev,
    };
    let inspector = GitRepoInspector::new(repo_path);
    let decision = evaluate(&update, &actor, &protection, &path_rules, &inspector).await;

    match decision {
        GateDecision::Accept => {
            state
                .metrics
                .metrics
                .gate_decisions
                .get_or_create(&DecisionLabels {
                    decision: Decision::Accept,
                })
                .inc();
            Ok(StatusCode::OK.into_response())
        }
        GateDecision::Reject { reason } => {
            info!(%reason, "ref update rejected");
            state
                .metrics
                .metrics
                .gate_decisions
                .get_or_create(&DecisionLabels {
                    decision: Decision::Reject,
                })
                .inc();
            Ok((StatusCode::FORBIDDEN, reason).into_response())
        }
    }
}

/// `POST /:owner/:repo/queue`
///
/// Insert a queue item for an approved pull request and kick off a drain.
#[instrument(skip(state, headers, body), fields(%owner, %repo))]
async fn handle_enqueue(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    check_request_signature(&state, &headers, &body)?;

    let request: EnqueueRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid request body: {e}")))?;

    let repository = format!("{owner}/{repo}");
    let pr = store::queue::pull_request(&state.pool, request.pull_request_id)
        .await?
        .filter(|pr| pr.repository == repository)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "pull request {} not found in {repository}",
                request.pull_request_id
            ))
        })?;

    let now = chrono::Utc::now().timestamp();
    let id = store::queue::enqueue(&state.pool, &repository, pr.id, now).await?;
    info!(item = id, pr = pr.number, "queue item enqueued");

    spawn_drain(&state, repository);
    Ok((StatusCode::OK, Json(EnqueueResponse { id })).into_response())
}

/// `POST /:owner/:repo/queue/drain`
#[instrument(skip(state, headers, body), fields(%owner, %repo))]
async fn handle_drain(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    check_request_signature(&state, &headers, &body)?;
    spawn_drain(&state, format!("{owner}/{repo}"));
    Ok(StatusCode::ACCEPTED.into_response())
}

fn spawn_drain(state: &AppState, repository: String) {
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = scheduler.drain(&repository).await {
            error!(%repository, error = %e, "drain failed");
        }
    });
}

/// `GET /:owner/:repo/queue`
///
/// Signed like every other repo-scoped route; for a GET the signature
/// covers the (empty) body.
async fn handle_queue_list(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    check_request_signature(&state, &headers, &body)?;

    let repository = format!("{owner}/{repo}");
    let items = store::queue::list_items(&state.pool, &repository).await?;
    let view: Vec<QueueItemView> = items
        .into_iter()
        .map(|i| QueueItemView {
            id: i.id,
            pull_request_id: i.pull_request_id,
            status: i.status.as_str(),
            queued_at: i.queued_at,
            started_at: i.started_at,
            completed_at: i.completed_at,
            attempt_count: i.attempt_count,
            execution_branch: i.execution_branch,
        })
        .collect();
    Ok(Json(view).into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let report = crate::health::check_health(&state).await;
    let status = if report.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;
    Ok((
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// HTTP-facing error type mapping failures onto status codes.
#[derive(Debug)]
pub enum AppError {
    /// The caller's request signature is missing or wrong.
    Unauthorized(String),
    /// The request body could not be understood.
    BadRequest(String),
    /// The referenced repository or pull request does not exist here.
    NotFound(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lease::{Coordinator, LeaseManager, LocalCoordinator};
    use crate::metrics::MetricsRegistry;
    use crate::queue::{GitMergeExecutor, NoopLookahead, Scheduler, SimulatedCi};
    use crate::storage::FsBundleStore;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    /// Full application state against an in-memory store; no repository is
    /// materialized and no background task runs.
    async fn test_state(secret_env: &str) -> Arc<AppState> {
        let yaml = format!(
            r#"
server:
  http_listen: "127.0.0.1:0"
gate:
  secret_env: "{secret_env}"
store:
  path: ":memory:"
storage:
  local:
    path: "/tmp/forgegate-test-repos"
  bundle_dir: "/tmp/forgegate-test-bundles"
"#
        );
        let config: crate::config::Config = serde_yaml::from_str(&yaml).unwrap();
        let config = Arc::new(config);

        let pool = crate::store::connect_in_memory().await.unwrap();
        let metrics = MetricsRegistry::new();
        let coordinator: Arc<dyn Coordinator> = Arc::new(LocalCoordinator::new());
        let leases = Arc::new(LeaseManager::new(
            coordinator.clone(),
            Arc::new(FsBundleStore::new("/tmp/forgegate-test-bundles")),
            "/tmp/forgegate-test-repos",
            "node-test",
            &config.lease,
            metrics.metrics.clone(),
        ));
        let executor = Arc::new(GitMergeExecutor::new(
            leases.clone(),
            Arc::new(SimulatedCi::new(Duration::ZERO)),
            pool.clone(),
            "forgegate-system",
            metrics.metrics.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            pool.clone(),
            executor,
            Arc::new(NoopLookahead),
            metrics.metrics.clone(),
            600,
        ));

        Arc::new(AppState {
            config,
            pool,
            leases,
            scheduler,
            coordinator,
            metrics,
            node_id: "node-test".to_string(),
        })
    }

    #[test]
    fn valid_signature_verifies() {
        let body = Bytes::from_static(b"{\"refname\":\"refs/heads/main\"}");
        let mut headers = HeaderMap::new();
        headers.insert("X-Gate-Signature", sign("s3cret", &body).parse().unwrap());
        assert!(verify_signature("s3cret", &headers, &body).is_ok());
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = Bytes::from_static(b"{}");
        let mut headers = HeaderMap::new();
        headers.insert("X-Gate-Signature", sign("other", &body).parse().unwrap());
        assert!(verify_signature("s3cret", &headers, &body).is_err());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let body = Bytes::from_static(b"{\"pull_request_id\":1}");
        let mut headers = HeaderMap::new();
        headers.insert("X-Gate-Signature", sign("s3cret", &body).parse().unwrap());
        let tampered = Bytes::from_static(b"{\"pull_request_id\":2}");
        assert!(verify_signature("s3cret", &headers, &tampered).is_err());
    }

    #[test]
    fn missing_header_fails_verification() {
        let body = Bytes::from_static(b"{}");
        assert!(verify_signature("s3cret", &HeaderMap::new(), &body).is_err());
    }

    #[tokio::test]
    async fn unsigned_queue_listing_is_rejected() {
        std::env::set_var("GATE_SECRET_LIST_UNSIGNED", "s3cret");
        let state = test_state("GATE_SECRET_LIST_UNSIGNED").await;

        let result = handle_queue_list(
            State(state),
            Path(("acme".to_string(), "widgets".to_string())),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;

        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn signed_queue_listing_succeeds() {
        std::env::set_var("GATE_SECRET_LIST_SIGNED", "s3cret");
        let state = test_state("GATE_SECRET_LIST_SIGNED").await;

        let mut headers = HeaderMap::new();
        headers.insert("X-Gate-Signature", sign("s3cret", b"").parse().unwrap());

        let response = handle_queue_list(
            State(state),
            Path(("acme".to_string(), "widgets".to_string())),
            headers,
            Bytes::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
