//! In-process store backend.

use super::{DurableStore, StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
enum Value {
    List(Vec<String>),
    Record(String),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A [`DurableStore`] that lives in process memory.
///
/// Expiry uses `tokio::time::Instant`, so tests can drive it with paused
/// time. Expired keys are treated as absent on read and removed lazily or by
/// [`DurableStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, expired or not.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Remove `key` if it has expired.
    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }

    fn corrupt(key: &str, expected: &str) -> StoreError {
        StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("expected a {}", expected),
        }
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn push_back(&self, key: &str, value: String, ttl: Duration) -> StoreResult<usize> {
        self.evict_if_expired(key);
        let now = Instant::now();

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(Vec::new()),
            expires_at: now + ttl,
        });
        entry.expires_at = now + ttl;

        match &mut entry.value {
            Value::List(items) => {
                items.push(value);
                trace!(key = %key, len = items.len(), "Pushed to list");
                Ok(items.len())
            }
            Value::Record(_) => Err(Self::corrupt(key, "list")),
        }
    }

    async fn range(&self, key: &str) -> StoreResult<Vec<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::List(items) => Ok(items.clone()),
                Value::Record(_) => Err(Self::corrupt(key, "list")),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::List(items) => Ok(items.len()),
                Value::Record(_) => Err(Self::corrupt(key, "list")),
            },
            None => Ok(0),
        }
    }

    async fn trim_front(&self, key: &str, count: usize) -> StoreResult<usize> {
        self.evict_if_expired(key);
        let removed = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                Value::List(items) => {
                    let n = count.min(items.len());
                    items.drain(..n);
                    n
                }
                Value::Record(_) => return Err(Self::corrupt(key, "list")),
            },
            None => 0,
        };
        self.entries
            .remove_if(key, |_, entry| matches!(&entry.value, Value::List(items) if items.is_empty()));
        Ok(removed)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(matches!(self.entries.remove(key), Some((_, entry)) if !entry.is_expired(now)))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Record(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Record(value) => Ok(Some(value.clone())),
                Value::List(_) => Err(Self::corrupt(key, "record")),
            },
            None => Ok(None),
        }
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_list_push_and_range() {
        let store = MemoryStore::new();

        assert_eq!(store.push_back("q", "a".into(), HOUR).await.unwrap(), 1);
        assert_eq!(store.push_back("q", "b".into(), HOUR).await.unwrap(), 2);
        assert_eq!(store.range("q").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.len("q").await.unwrap(), 2);

        assert!(store.delete("q").await.unwrap());
        assert!(!store.delete("q").await.unwrap());
        assert!(store.range("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trim_front_keeps_later_items() {
        let store = MemoryStore::new();
        for value in ["a", "b", "c"] {
            store.push_back("q", value.into(), HOUR).await.unwrap();
        }

        assert_eq!(store.trim_front("q", 2).await.unwrap(), 2);
        assert_eq!(store.range("q").await.unwrap(), vec!["c"]);

        assert_eq!(store.trim_front("q", 5).await.unwrap(), 1);
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.trim_front("missing", 1).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_resets_ttl() {
        let store = MemoryStore::new();

        store.push_back("q", "a".into(), HOUR).await.unwrap();
        tokio::time::advance(Duration::from_secs(3000)).await;
        store.push_back("q", "b".into(), HOUR).await.unwrap();
        tokio::time::advance(Duration::from_secs(3000)).await;

        // first TTL elapsed, second has not
        assert_eq!(store.len("q").await.unwrap(), 2);

        tokio::time::advance(HOUR).await;
        assert_eq!(store.len("q").await.unwrap(), 0);
        assert_eq!(store.push_back("q", "c".into(), HOUR).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expiry_and_purge() {
        let store = MemoryStore::new();

        store.set("short", "1".into(), Duration::from_secs(10)).await.unwrap();
        store.set("long", "2".into(), HOUR).await.unwrap();
        assert_eq!(store.get("short").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("short").await.unwrap(), None);

        store.set("short2", "3".into(), Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_corrupt() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), HOUR).await.unwrap();

        assert!(matches!(
            store.push_back("k", "x".into(), HOUR).await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
