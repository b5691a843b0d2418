use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{RunLockConfig, TransportConfig};
use crate::message::Phase;

/// Unique identifier of one lock acquisition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LockOwner(pub Uuid);

impl Default for LockOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl LockOwner {
    /// Create a new owner id using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of a held lock. Refresh and release only succeed for the owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub owner: LockOwner,
    pub ttl: Duration,
    pub acquired_at: DateTime<Utc>,
}

impl LockToken {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            owner: LockOwner::new(),
            ttl,
            acquired_at: Utc::now(),
        }
    }
}

/// Named, expiring, non-blocking locks.
///
/// Locks are advisory: they coordinate cooperating workers and expire on
/// their own when a holder disappears.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire `key` without waiting. `None` when another owner holds it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<LockToken>>;

    /// Extend the lock by its TTL. `false` when the token no longer owns it.
    async fn refresh(&self, token: &LockToken) -> anyhow::Result<bool>;

    /// Release the lock if the token still owns it.
    async fn release(&self, token: &LockToken) -> anyhow::Result<bool>;

    /// Whether any owner currently holds an unexpired lock on `key`.
    async fn is_held(&self, key: &str) -> anyhow::Result<bool>;

    /// Remove the lock regardless of owner.
    async fn force_release(&self, key: &str) -> anyhow::Result<bool>;

    /// Keys of all unexpired locks starting with `prefix`.
    async fn held_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Clone, Debug)]
struct HeldLock {
    owner: LockOwner,
    expires_at: DateTime<Utc>,
}

/// Process-local lock service.
#[derive(Clone, Default)]
pub struct InMemoryLockService {
    locks: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<LockToken>> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        if let Some(held) = locks.get(key) {
            if held.expires_at > now {
                return Ok(None);
            }
        }
        let token = LockToken::new(key, ttl);
        locks.insert(
            key.to_string(),
            HeldLock {
                owner: token.owner,
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn refresh(&self, token: &LockToken) -> anyhow::Result<bool> {
        let mut locks = self.locks.lock();
        match locks.get_mut(&token.key) {
            Some(held) if held.owner == token.owner => {
                held.expires_at = Utc::now() + token.ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, token: &LockToken) -> anyhow::Result<bool> {
        let mut locks = self.locks.lock();
        match locks.get(&token.key) {
            Some(held) if held.owner == token.owner => {
                locks.remove(&token.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_held(&self, key: &str) -> anyhow::Result<bool> {
        let now = Utc::now();
        Ok(self
            .locks
            .lock()
            .get(key)
            .is_some_and(|held| held.expires_at > now))
    }

    async fn force_release(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.locks.lock().remove(key).is_some())
    }

    async fn held_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .locks
            .lock()
            .iter()
            .filter(|(key, held)| key.starts_with(prefix) && held.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Partition locks keyed by environment id.
#[derive(Clone)]
pub struct PartitionLocks {
    service: Arc<dyn LockService>,
    key_prefix: String,
    ttl: Duration,
    config: TransportConfig,
}

impl PartitionLocks {
    pub fn new(service: Arc<dyn LockService>, config: &TransportConfig) -> Self {
        Self {
            service,
            key_prefix: config.lock_key_prefix.clone(),
            ttl: config.lock_ttl(),
            config: config.clone(),
        }
    }

    /// `partition_processing_7` for `env_7`; unmanaged partitions use their name.
    pub fn key_for(&self, queue_name: &str) -> String {
        match self.config.partition_id(queue_name) {
            Some(id) => self.key_for_environment(id),
            None => format!("{}{}", self.key_prefix, queue_name),
        }
    }

    pub fn key_for_environment(&self, environment_id: i64) -> String {
        format!("{}{}", self.key_prefix, environment_id)
    }

    pub async fn try_lock(&self, queue_name: &str) -> anyhow::Result<Option<LockToken>> {
        self.service.try_acquire(&self.key_for(queue_name), self.ttl).await
    }

    pub async fn refresh(&self, token: &LockToken) -> anyhow::Result<bool> {
        self.service.refresh(token).await
    }

    pub async fn release(&self, token: &LockToken) -> anyhow::Result<bool> {
        self.service.release(token).await
    }

    pub fn service(&self) -> &Arc<dyn LockService> {
        &self.service
    }
}

/// Which partition locks to clear.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClearScope {
    Environments(Vec<i64>),
    All,
}

/// Outcome of [`clear_partition_locks`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClearReport {
    /// Keys that were held when inspected.
    pub held: Vec<String>,
    /// Keys actually removed. Always empty on a dry run.
    pub released: Vec<String>,
    pub dry_run: bool,
}

/// Force-release partition locks left behind by crashed workers.
pub async fn clear_partition_locks(
    locks: &PartitionLocks,
    scope: ClearScope,
    dry_run: bool,
) -> anyhow::Result<ClearReport> {
    let held = match scope {
        ClearScope::All => locks.service.held_keys(&locks.key_prefix).await?,
        ClearScope::Environments(ids) => {
            let mut held = Vec::new();
            for id in ids {
                let key = locks.key_for_environment(id);
                if locks.service.is_held(&key).await? {
                    held.push(key);
                } else {
                    tracing::debug!(environment_id = id, "partition lock not held");
                }
            }
            held
        }
    };

    let mut report = ClearReport {
        held,
        released: Vec::new(),
        dry_run,
    };
    if dry_run {
        return Ok(report);
    }
    for key in &report.held {
        if locks.service.force_release(key).await? {
            tracing::warn!(lock_key = %key, "force-released partition lock");
            report.released.push(key.clone());
        }
    }
    Ok(report)
}

/// Run locks keyed by run id, with per-phase TTL.
#[derive(Clone)]
pub struct RunLocks {
    service: Arc<dyn LockService>,
    config: RunLockConfig,
}

impl RunLocks {
    pub fn new(service: Arc<dyn LockService>, config: RunLockConfig) -> Self {
        Self { service, config }
    }

    pub fn key_for(&self, run_id: i64) -> String {
        format!("{}{}", self.config.key_prefix, run_id)
    }

    pub async fn try_lock(&self, run_id: i64, phase: Phase) -> anyhow::Result<Option<LockToken>> {
        self.service
            .try_acquire(&self.key_for(run_id), self.config.ttl_for(phase))
            .await
    }

    pub async fn refresh(&self, token: &LockToken) -> anyhow::Result<bool> {
        self.service.refresh(token).await
    }

    pub async fn release(&self, token: &LockToken) -> anyhow::Result<bool> {
        self.service.release(token).await
    }
}

/// Capability handed to long-running work so it can keep its claim alive.
#[async_trait]
pub trait LockRefresher: Send + Sync {
    /// Extend every lock guarding the current work.
    async fn refresh(&self) -> anyhow::Result<()>;

    /// Signal liveness to the transport so the message is not redelivered.
    async fn heartbeat(&self) -> anyhow::Result<()>;
}
