//! Coordination store client: distributed locks with expiry, ephemeral
//! session blobs, and cross-instance publish/subscribe. The redis backend is
//! the production one; the in-memory backend serves tests and single-node
//! deployments through the same trait.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCoordination;
pub use self::redis::RedisCoordination;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("coordination connection failed: {0}")]
    Connection(String),

    #[error("coordination backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Key for the per-user ephemeral session blob.
pub fn session_key(user_id: &str) -> String {
    format!("session:{}", user_id)
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// SET key owner PX ttl NX. Returns whether the lock was acquired.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Owner-scoped release: the key is deleted only if its stored value
    /// still equals `owner`, evaluated atomically, so a stale holder cannot
    /// release a newer acquisition.
    async fn unlock(&self, key: &str, owner: &str) -> Result<()>;

    /// SETEX-style write of an expiring blob.
    async fn put_session(&self, key: &str, blob: &str, ttl: Duration) -> Result<()>;

    async fn get_session(&self, key: &str) -> Result<Option<String>>;

    async fn drop_session(&self, key: &str) -> Result<()>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. Payloads are delivered on the returned
    /// receiver until it is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;

    async fn healthy(&self) -> bool;
}
