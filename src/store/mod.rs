//! Keyed store abstraction
//!
//! Every piece of security state that must survive a single request (refresh token
//! records, MFA credentials, CSRF nonces, sessions, accounts) lives behind
//! [`KeyedStore`]. Read-decide-write sequences go through
//! [`KeyedStore::conditional_update`], which backends must apply atomically.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Store backend errors (infrastructure-level, retryable)
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait KeyedStore: Send + Sync + 'static {
    /// Read a live (non-expired) value
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Unconditionally write a value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remove a key, returning whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Replace the value at `key` with `new_value` only if a live value exists
    /// and `predicate` holds for it. The check and the write are indivisible:
    /// of two racing callers with the same predicate, at most one observes `true`.
    /// The existing expiry is preserved.
    async fn conditional_update(
        &self,
        key: &str,
        predicate: &(dyn for<'v> Fn(&'v Value) -> bool + Send + Sync),
        new_value: Value,
    ) -> StoreResult<bool>;

    /// List live keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Drop entries whose TTL elapsed; returns the number removed
    async fn purge_expired(&self) -> StoreResult<u64>;
}

/// Typed facade over a [`KeyedStore`] backend
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KeyedStore>,
}

impl Store {
    pub fn new(backend: Arc<dyn KeyedStore>) -> Self {
        Self { backend }
    }

    /// In-memory store, used by tests and single-node deployments
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.backend.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.backend.set(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.backend.delete(key).await
    }

    /// Typed conditional update. A stored value that no longer deserializes as `T`
    /// never satisfies the predicate.
    pub async fn update_if<T, F>(&self, key: &str, predicate: F, new_value: &T) -> StoreResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&T) -> bool + Send + Sync,
    {
        let new_value = serde_json::to_value(new_value)?;
        let check = move |current: &Value| {
            serde_json::from_value::<T>(current.clone())
                .map(|typed| predicate(&typed))
                .unwrap_or(false)
        };
        self.backend.conditional_update(key, &check, new_value).await
    }

    pub async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.backend.keys(prefix).await
    }

    pub async fn purge_expired(&self) -> StoreResult<u64> {
        self.backend.purge_expired().await
    }
}
