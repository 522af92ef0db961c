mod config;
mod error;
mod gate;
mod git;
mod health;
mod http;
mod lease;
mod metrics;
mod queue;
mod storage;
mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fred::interfaces::ClientLike;
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use sqlx::SqlitePool;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, CoordinationMode, StorageBackend};
use crate::lease::{Coordinator, KeydbCoordinator, LeaseManager, LocalCoordinator};
use crate::metrics::MetricsRegistry;
use crate::queue::{
    ChainedLookahead, CiGate, GitMergeExecutor, NoopLookahead, Scheduler, SimulatedCi,
    SpeculativeRunner,
};
use crate::storage::{BundleStore, FsBundleStore, S3BundleStore};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "forgegate", about = "Merge queue, repository leases and pre-receive policy")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/forgegate/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub leases: Arc<LeaseManager>,
    pub scheduler: Arc<Scheduler>,
    pub coordinator: Arc<dyn Coordinator>,
    pub metrics: MetricsRegistry,
    pub node_id: String,
}

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

/// Stable-enough unique id for this process, used as the distributed lock
/// owner.  Prefers an operator-assigned id, falls back to
/// `<hostname>-<random-8-chars>` so two processes on one host stay
/// distinct.
fn node_id() -> String {
    std::env::var("FORGEGATE_NODE_ID").unwrap_or_else(|_| {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        format!("{hostname}-{suffix}")
    })
}

// ---------------------------------------------------------------------------
// KeyDB pool setup
// ---------------------------------------------------------------------------

fn parse_host_port(endpoint: &str) -> Result<(String, u16)> {
    let mut parts = endpoint.splitn(2, ':');
    let host = parts.next().unwrap_or_default().to_string();
    anyhow::ensure!(!host.is_empty(), "empty KeyDB host");
    let port = match parts.next() {
        Some(p) => p.parse::<u16>().context("invalid KeyDB port")?,
        None => 6379,
    };
    Ok((host, port))
}

async fn build_keydb_pool(config: &Config) -> Result<fred::clients::Pool> {
    let auth_token = std::env::var(&config.coordination.keydb_auth_token_env).ok();

    let endpoint = config
        .coordination
        .keydb_endpoint
        .as_deref()
        .context("coordination.keydb_endpoint is not set")?
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;
    let server_config = ServerConfig::new_centralized(host, port);

    let mut fred_config = FredConfig {
        server: server_config,
        ..FredConfig::default()
    };

    if config.coordination.keydb_tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(ref token) = auth_token {
        fred_config.password = Some(token.clone());
    }

    let mut builder = fred::types::Builder::from_config(fred_config);
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder.build_pool(3)?;
    pool.init().await.context("failed to connect to KeyDB")?;

    tracing::info!("KeyDB pool initialised");
    Ok(pool)
}

// ---------------------------------------------------------------------------
// S3 client setup
// ---------------------------------------------------------------------------

async fn build_s3_client(config: &config::S3StorageConfig) -> Result<aws_sdk_s3::Client> {
    let mut aws_config_loader =
        aws_config::from_env().region(aws_config::Region::new(config.region.clone()));

    if config.use_fips {
        aws_config_loader = aws_config_loader.use_fips(true);
    }

    let aws_config = aws_config_loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let client = aws_sdk_s3::Client::from_conf(s3_config);
    tracing::info!(
        bucket = %config.bucket,
        region = %config.region,
        fips = config.use_fips,
        "S3 client initialised"
    );
    Ok(client)
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting forgegate");

    // ---- Ensure local working-copy directory exists ----
    tokio::fs::create_dir_all(&config.storage.local.path)
        .await
        .with_context(|| {
            format!(
                "failed to create working-copy dir: {}",
                config.storage.local.path
            )
        })?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Relational store ----
    let pool = store::connect(&config.store.path).await?;

    // ---- Coordination ----
    let coordinator: Arc<dyn Coordinator> = match config.coordination.mode {
        CoordinationMode::Keydb => {
            Arc::new(KeydbCoordinator::new(build_keydb_pool(&config).await?))
        }
        CoordinationMode::Local => Arc::new(LocalCoordinator::new()),
    };

    // ---- Blob storage ----
    let bundles: Arc<dyn BundleStore> = match config.storage.backend {
        StorageBackend::S3 => {
            let s3_config = config
                .storage
                .s3
                .as_ref()
                .context("storage.s3 section is not set")?;
            Arc::new(S3BundleStore::new(
                build_s3_client(s3_config).await?,
                s3_config.bucket.clone(),
                s3_config.prefix.clone(),
            ))
        }
        StorageBackend::Local => {
            let dir = config
                .storage
                .bundle_dir
                .clone()
                .context("storage.bundle_dir is not set")?;
            Arc::new(FsBundleStore::new(dir))
        }
    };

    // ---- Node ID ----
    let node_id = node_id();
    tracing::info!(%node_id, "node identity established");

    // ---- Pipeline components ----
    let leases = Arc::new(LeaseManager::new(
        coordinator.clone(),
        bundles,
        config.storage.local.path.clone(),
        node_id.clone(),
        &config.lease,
        metrics.metrics.clone(),
    ));

    let ci: Arc<dyn CiGate> = Arc::new(SimulatedCi::new(Duration::from_secs(
        config.queue.simulated_ci_delay,
    )));

    let system_user = config
        .gate
        .system_pushers
        .first()
        .cloned()
        .unwrap_or_else(|| "forgegate-system".to_string());

    let executor = Arc::new(GitMergeExecutor::new(
        leases.clone(),
        ci,
        pool.clone(),
        system_user,
        metrics.metrics.clone(),
    ));

    let lookahead: Arc<dyn SpeculativeRunner> = if config.queue.lookahead_depth == 0 {
        Arc::new(NoopLookahead)
    } else {
        Arc::new(ChainedLookahead::new(
            pool.clone(),
            leases.clone(),
            config.queue.lookahead_depth,
            metrics.metrics.clone(),
        ))
    };

    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        executor,
        lookahead,
        metrics.metrics.clone(),
        config.queue.staleness_secs,
    ));

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        pool,
        leases,
        scheduler: scheduler.clone(),
        coordinator,
        metrics,
        node_id,
    };

    // ---- Background sweep ----
    let sweep_handle = tokio::spawn({
        let s = Arc::clone(&scheduler);
        let interval = Duration::from_secs(config.queue.drain_interval);
        async move { s.sweep_loop(interval).await }
    });

    // ---- HTTP server (foreground; returns on shutdown signal) ----
    let result = run_http_server(state).await;

    sweep_handle.abort();
    tracing::info!("forgegate stopped");
    result
}
