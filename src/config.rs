use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub gate: GateConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub storage: StorageConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8070`).
    pub http_listen: String,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    /// Name of the environment variable that holds the shared secret used
    /// to sign pre-receive and queue requests.
    #[serde(default = "default_gate_secret_env")]
    pub secret_env: String,
    /// Pusher identities treated as system-originated.  Updates from these
    /// actors bypass the requires-PR check (the scheduler's internal merge
    /// path pushes under one of these names).
    #[serde(default = "default_system_pushers")]
    pub system_pushers: Vec<String>,
}

fn default_gate_secret_env() -> String {
    "FORGEGATE_SECRET".to_string()
}

fn default_system_pushers() -> Vec<String> {
    vec!["forgegate-system".to_string()]
}

// ---------------------------------------------------------------------------
// Relational store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub path: String,
}

// ---------------------------------------------------------------------------
// Coordination (distributed repo locks)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub mode: CoordinationMode,
    /// KeyDB connection string (e.g. `rediss://keydb.local:6380`), required
    /// when `mode` is `keydb`.
    #[serde(default)]
    pub keydb_endpoint: Option<String>,
    /// Enable TLS for the KeyDB connection.
    #[serde(default = "bool_true")]
    pub keydb_tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub keydb_auth_token_env: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            mode: CoordinationMode::Local,
            keydb_endpoint: None,
            keydb_tls: true,
            keydb_auth_token_env: default_keydb_auth_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationMode {
    /// Single-node deployment: locks live in process memory.
    #[default]
    Local,
    /// Multi-node deployment: locks live in KeyDB.
    Keydb,
}

fn bool_true() -> bool {
    true
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Lease manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseConfig {
    /// TTL (seconds) of the distributed repository lock.  A crashed holder
    /// is reclaimed when this expires.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: u64,
    /// How long (seconds) an acquire will wait for the lock before giving
    /// up with a lease timeout.
    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lock_ttl: default_lock_ttl(),
            lock_wait_timeout: default_lock_wait_timeout(),
        }
    }
}

fn default_lock_ttl() -> u64 {
    120
}

fn default_lock_wait_timeout() -> u64 {
    90
}

// ---------------------------------------------------------------------------
// Merge queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// A running item older than this (seconds) is presumed crashed and
    /// force-transitioned to failed on the next drain pass.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    /// How many queued items behind the running one get speculative
    /// lookahead merges.
    #[serde(default = "default_lookahead_depth")]
    pub lookahead_depth: usize,
    /// Interval (seconds) of the background drain sweep.
    #[serde(default = "default_drain_interval")]
    pub drain_interval: u64,
    /// Fixed delay (seconds) of the simulated CI gate used when no external
    /// CI integration is wired in.
    #[serde(default = "default_simulated_ci_delay")]
    pub simulated_ci_delay: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            staleness_secs: default_staleness_secs(),
            lookahead_depth: default_lookahead_depth(),
            drain_interval: default_drain_interval(),
            simulated_ci_delay: default_simulated_ci_delay(),
        }
    }
}

fn default_staleness_secs() -> u64 {
    600
}

fn default_lookahead_depth() -> usize {
    2
}

fn default_drain_interval() -> u64 {
    30
}

fn default_simulated_ci_delay() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Storage (local working copies + blob backend)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub local: LocalStorageConfig,
    #[serde(default)]
    pub backend: StorageBackend,
    /// Required when `backend` is `s3`.
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
    /// Directory for the filesystem bundle store, required when `backend`
    /// is `local`.
    #[serde(default)]
    pub bundle_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for materialized bare repos.
    pub path: String,
    /// Soft ceiling for local working-copy usage in bytes, reported by the
    /// health endpoint.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_bytes() -> u64 {
    100_000_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    pub region: String,
    /// Use the FIPS endpoints for S3 operations.
    #[serde(default)]
    pub use_fips: bool,
}

fn default_s3_prefix() -> String {
    "forgegate/".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.queue.staleness_secs > 0,
        "queue.staleness_secs must be positive"
    );
    anyhow::ensure!(
        config.queue.lookahead_depth <= 8,
        "queue.lookahead_depth must be 8 or less"
    );
    anyhow::ensure!(config.lease.lock_ttl > 0, "lease.lock_ttl must be positive");
    match config.storage.backend {
        StorageBackend::S3 => anyhow::ensure!(
            config.storage.s3.is_some(),
            "storage.s3 section is required when storage.backend is s3"
        ),
        StorageBackend::Local => anyhow::ensure!(
            config.storage.bundle_dir.is_some(),
            "storage.bundle_dir is required when storage.backend is local"
        ),
    }
    match config.coordination.mode {
        CoordinationMode::Keydb => anyhow::ensure!(
            config.coordination.keydb_endpoint.is_some(),
            "coordination.keydb_endpoint is required when coordination.mode is keydb"
        ),
        CoordinationMode::Local => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
server:
  http_listen: "127.0.0.1:8070"
gate: {}
store:
  path: "/var/lib/forgegate/forgegate.db"
storage:
  local:
    path: "/var/cache/forgegate/repos"
  bundle_dir: "/var/cache/forgegate/bundles"
"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.queue.staleness_secs, 600);
        assert_eq!(config.queue.lookahead_depth, 2);
        assert_eq!(config.lease.lock_ttl, 120);
        assert_eq!(config.coordination.mode, CoordinationMode::Local);
        assert_eq!(config.storage.backend, StorageBackend::Local);
        assert_eq!(config.gate.system_pushers, vec!["forgegate-system"]);
    }

    #[test]
    fn s3_backend_requires_s3_section() {
        let yaml = r#"
server:
  http_listen: "127.0.0.1:8070"
gate: {}
store:
  path: "db.sqlite"
storage:
  local:
    path: "/repos"
  backend: s3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn keydb_mode_requires_endpoint() {
        let yaml = r#"
server:
  http_listen: "127.0.0.1:8070"
gate: {}
store:
  path: "db.sqlite"
coordination:
  mode: keydb
storage:
  local:
    path: "/repos"
  bundle_dir: "/bundles"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }
}
