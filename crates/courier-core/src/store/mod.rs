//! Durable key/value storage with expiry.
//!
//! The offline queue and the presence store only need a handful of
//! operations: append to a list, read a list, delete, and set/get a single
//! record. Every write carries a TTL that is reset on each write.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`DurableStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Unavailable(format!("{:#}", e))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A key/value store with list values and per-key expiry.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Append `value` to the list at `key` and reset its TTL.
    ///
    /// Returns the list length after the push.
    async fn push_back(&self, key: &str, value: String, ttl: Duration) -> StoreResult<usize>;

    /// All values of the list at `key`, oldest first.
    async fn range(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Length of the list at `key`.
    async fn len(&self, key: &str) -> StoreResult<usize>;

    /// Remove the `count` oldest items of the list at `key`.
    ///
    /// Items appended after they were read stay in place. Returns how many
    /// items were removed.
    async fn trim_front(&self, key: &str, count: usize) -> StoreResult<usize>;

    /// Remove `key` (list or record). Returns whether anything was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Store a single record at `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    /// Read the record at `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Drop everything that has expired. Returns the number of keys removed.
    async fn purge_expired(&self) -> StoreResult<usize>;
}

/// A store whose every operation fails, for exercising error paths.
#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
#[async_trait]
impl DurableStore for FailingStore {
    async fn push_back(&self, _: &str, _: String, _: Duration) -> StoreResult<usize> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn range(&self, _: &str) -> StoreResult<Vec<String>> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn len(&self, _: &str) -> StoreResult<usize> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn trim_front(&self, _: &str, _: usize) -> StoreResult<usize> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn delete(&self, _: &str) -> StoreResult<bool> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn set(&self, _: &str, _: String, _: Duration) -> StoreResult<()> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn get(&self, _: &str) -> StoreResult<Option<String>> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        Err(StoreError::Unavailable("down".into()))
    }
}
