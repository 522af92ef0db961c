//! Distributed and local repository lock coordinators.
//!
//! The KeyDB implementation uses SET NX EX for acquisition and a Lua
//! check-and-delete script for release, so a crashed holder is reclaimed by
//! TTL expiry and a release never deletes another node's lock.  The local
//! implementation keeps the same TTL semantics in process memory for
//! single-node deployments and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::interfaces::{KeysInterface, LuaInterface};
use tokio::time::Instant;
use tracing::{debug, warn};

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Try to take the lock `key` for `owner` with the given TTL.  Returns
    /// `false` when another owner already holds it.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release `key` if (and only if) it is still held by `owner`.
    async fn release(&self, key: &str, owner: &str) -> Result<()>;

    /// Wait until `key` is free or `timeout` elapses.  Returns `true` when
    /// the lock became free in time.
    async fn wait_for_release(&self, key: &str, timeout: Duration) -> Result<bool>;

    /// Current holder of `key`, if any.
    async fn holder(&self, key: &str) -> Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// KeyDB
// ---------------------------------------------------------------------------

pub struct KeydbCoordinator {
    pool: fred::clients::Pool,
}

impl KeydbCoordinator {
    pub fn new(pool: fred::clients::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Coordinator for KeydbCoordinator {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let value = format!("{owner}:{}", chrono::Utc::now().timestamp());
        let result: Option<String> = self
            .pool
            .set(
                key,
                value.as_str(),
                Some(fred::types::Expiration::EX(ttl.as_secs() as i64)),
                Some(fred::types::SetOptions::NX),
                false,
            )
            .await?;
        // SET … NX returns "OK" when the key was set, nil otherwise.
        let acquired = result.is_some();
        debug!(%key, %owner, acquired, "try_acquire");
        Ok(acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let script = r#"
            local val = redis.call('GET', KEYS[1])
            if val and string.find(val, ARGV[1] .. ":", 1, true) == 1 then
                redis.call('DEL', KEYS[1])
                redis.call('PUBLISH', KEYS[1] .. ':notify', 'released')
                return 1
            end
            return 0
        "#;
        let released: i64 = self
            .pool
            .eval(script, vec![key.to_string()], vec![owner.to_string()])
            .await
            .context("lock release script failed")?;
        if released == 1 {
            debug!(%key, %owner, "lock released");
        } else {
            warn!(%key, %owner, "lock release: key missing or owned by another node");
        }
        Ok(())
    }

    async fn wait_for_release(&self, key: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(250);

        let exists: bool = self.pool.exists(key).await?;
        if !exists {
            return Ok(true);
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            tokio::time::sleep(poll_interval.min(remaining)).await;

            let exists: bool = self.pool.exists(key).await?;
            if !exists {
                debug!(%key, "wait_for_release: lock released");
                return Ok(true);
            }
        }

        warn!(%key, ?timeout, "wait_for_release: timed out");
        Ok(false)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.pool.get(key).await?;
        Ok(value.and_then(|v| v.split(':').next().map(str::to_string)))
    }
}

// ---------------------------------------------------------------------------
// Local (single node)
// ---------------------------------------------------------------------------

/// In-process coordinator with the same TTL semantics as the KeyDB one.
/// Expired entries are reclaimed lazily on the next acquire or lookup.
#[derive(Default)]
pub struct LocalCoordinator {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_holder(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((_, expiry)) if *expiry <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((owner, _)) => Some(owner.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some((_, expiry)) = entries.get(key) {
            if *expiry > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((held_by, _)) = entries.get(key) {
            if held_by == owner {
                entries.remove(key);
            } else {
                warn!(%key, %owner, "lock release: owned by another holder");
            }
        }
        Ok(())
    }

    async fn wait_for_release(&self, key: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(25);
        loop {
            if self.live_holder(key).is_none() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_holder(key))
    }
}
