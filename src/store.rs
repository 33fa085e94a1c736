//! Storage collaborators: the in-process cache tier plus the narrow traits
//! the host implements for its distributed store and durable KV.
//!
//! The library never talks to a driver directly. When a [`DistributedStore`]
//! is configured it is the authoritative tier (rate limiting runs its atomic
//! script there); otherwise state lives in the [`MemoryCache`], optionally
//! mirrored to a [`KvStore`] for durability.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::{error::AuthError, ttl::now_unix_seconds};

/// Map a collaborator failure onto the library error.
pub(crate) fn store_failed(err: anyhow::Error) -> AuthError {
    AuthError::internal("STORE_FAILED", err.to_string())
}

/// Distributed store able to run an atomic server-side script (e.g. Redis).
#[async_trait]
pub trait DistributedStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<i64>) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Evaluate `script` atomically with `keys`/`args`, returning its result.
    async fn eval(&self, script: &str, keys: &[String], args: &[String])
    -> anyhow::Result<String>;
}

/// Durable key-value mirror behind the local cache.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<i64>) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process cache tier with TTL entries and per-key locks.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let now = now_unix_seconds();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired entries are dropped lazily on read.
        self.entries.write().await.remove(key);
        None
    }

    pub async fn set(&self, key: &str, value: impl Into<String>, ttl_seconds: Option<i64>) {
        let expires_at = ttl_seconds.map(|ttl| now_unix_seconds() + ttl);
        self.set_until(key, value, expires_at).await;
    }

    /// Set with an absolute expiry, used to preserve an existing window.
    pub async fn set_until(
        &self,
        key: &str,
        value: impl Into<String>,
        expires_at: Option<i64>,
    ) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.into(),
                expires_at,
            },
        );
    }

    pub async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.locks.lock().await.clear();
    }

    /// Acquire the per-key mutex guarding read-modify-write sequences.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        mutex.lock_owned().await
    }
}

/// The storage tiers handed to the guards and engines.
///
/// A configured `distributed` handle is the storage-tier selector: engines
/// use it exclusively and skip the local/KV pair.
#[derive(Clone, Default)]
pub struct Stores {
    pub local: Arc<MemoryCache>,
    pub distributed: Option<Arc<dyn DistributedStore>>,
    pub kv: Option<Arc<dyn KvStore>>,
}

impl Stores {
    /// Local in-process tier only.
    #[must_use]
    pub fn local_only() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_distributed(mut self, store: Arc<dyn DistributedStore>) -> Self {
        self.distributed = Some(store);
        self
    }

    #[must_use]
    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }
}
