//! Broadcast key-value store shared by the two peers of a room.
//!
//! Collections are addressed by slash separated paths (`call-signals/abc`),
//! entries by `collection/key`. Subscribers receive the full contents of a
//! collection every time it changes, never a diff.

pub mod memory;
pub mod redis_store;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Full contents of a collection, keyed by entry id. Appended ids sort in
/// insertion order.
pub type Snapshot = BTreeMap<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store subscription closed")]
    Disconnected,
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Redis(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        StoreError::Redis(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait BroadcastStore: Send + Sync {
    /// Replace the entry at `path` wholesale.
    async fn write(&self, path: &str, value: Value) -> StoreResult<()>;

    /// Add a new entry under the collection at `path` and return its id.
    async fn append(&self, path: &str, value: Value) -> StoreResult<String>;

    /// Remove the entry at `path`. Removing a missing entry is not an error.
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Watch the collection at `path`. The receiver always holds the current
    /// contents.
    async fn subscribe(&self, path: &str) -> StoreResult<watch::Receiver<Snapshot>>;

    /// Register `path` for removal when this client disconnects.
    async fn on_disconnect_remove(&self, path: &str) -> StoreResult<()>;

    /// Disconnect this client, firing every registered removal.
    async fn disconnect(&self) -> StoreResult<()>;

    async fn health_check(&self) -> StoreResult<bool>;
}

/// Splits `rooms/abc/users/u1` into (`rooms/abc/users`, `u1`).
pub fn split_entry_path(path: &str) -> StoreResult<(&str, &str)> {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((collection, key)) if !collection.is_empty() && !key.is_empty() => {
            Ok((collection, key))
        }
        _ => Err(StoreError::InvalidPath(path.to_string())),
    }
}

pub fn entry_path(collection: &str, key: &str) -> String {
    format!("{}/{}", collection.trim_matches('/'), key)
}
