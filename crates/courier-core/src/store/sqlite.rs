//! SQLite store backend.
//!
//! Lists live in `kv_lists` (one row per item, ordered by an autoincrement
//! sequence) with their TTL in `kv_list_expiry`. Single records live in
//! `kv_records`. Expiry uses wall-clock milliseconds so several processes
//! sharing the file agree on it.

use super::{DurableStore, StoreError, StoreResult};
use crate::db::{Database, OptionalExt};
use async_trait::async_trait;
use courier_protocol::unix_millis;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;

/// A [`DurableStore`] backed by the shared [`Database`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

fn expires_at(ttl: Duration) -> i64 {
    (unix_millis() + ttl.as_millis() as u64) as i64
}

/// Drop the list at `key` if its TTL has passed.
fn evict_list_if_expired(conn: &Connection, key: &str, now: i64) -> anyhow::Result<()> {
    let expired: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM kv_list_expiry WHERE key = ?1 AND expires_at <= ?2",
            rusqlite::params![key, now],
            |row| row.get(0),
        )
        .optional()?;
    if expired.is_some() {
        conn.execute("DELETE FROM kv_lists WHERE key = ?1", [key])?;
        conn.execute("DELETE FROM kv_list_expiry WHERE key = ?1", [key])?;
    }
    Ok(())
}

fn list_len(conn: &Connection, key: &str) -> anyhow::Result<usize> {
    let len: i64 = conn.query_row("SELECT COUNT(*) FROM kv_lists WHERE key = ?1", [key], |row| {
        row.get(0)
    })?;
    Ok(len as usize)
}

impl SqliteStore {
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn push_back(&self, key: &str, value: String, ttl: Duration) -> StoreResult<usize> {
        let key = key.to_string();
        self.blocking(move |db| {
            db.transaction(|tx| {
                evict_list_if_expired(tx, &key, unix_millis() as i64)?;
                tx.execute(
                    "INSERT INTO kv_lists (key, value) VALUES (?1, ?2)",
                    [&key, &value],
                )?;
                tx.execute(
                    "INSERT INTO kv_list_expiry (key, expires_at) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
                    rusqlite::params![key, expires_at(ttl)],
                )?;
                list_len(tx, &key)
            })
        })
        .await
    }

    async fn range(&self, key: &str) -> StoreResult<Vec<String>> {
        let key = key.to_string();
        self.blocking(move |db| {
            db.transaction(|tx| {
                evict_list_if_expired(tx, &key, unix_millis() as i64)?;
                let mut stmt = tx.prepare("SELECT value FROM kv_lists WHERE key = ?1 ORDER BY seq")?;
                let values = stmt
                    .query_map([&key], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(values)
            })
        })
        .await
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        let key = key.to_string();
        self.blocking(move |db| {
            db.transaction(|tx| {
                evict_list_if_expired(tx, &key, unix_millis() as i64)?;
                list_len(tx, &key)
            })
        })
        .await
    }

    async fn trim_front(&self, key: &str, count: usize) -> StoreResult<usize> {
        let key = key.to_string();
        self.blocking(move |db| {
            db.transaction(|tx| {
                evict_list_if_expired(tx, &key, unix_millis() as i64)?;
                let removed = tx.execute(
                    "DELETE FROM kv_lists WHERE seq IN
                        (SELECT seq FROM kv_lists WHERE key = ?1 ORDER BY seq LIMIT ?2)",
                    rusqlite::params![key, count as i64],
                )?;
                if list_len(tx, &key)? == 0 {
                    tx.execute("DELETE FROM kv_list_expiry WHERE key = ?1", [&key])?;
                }
                Ok(removed)
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        self.blocking(move |db| {
            db.transaction(|tx| {
                let now = unix_millis() as i64;
                evict_list_if_expired(tx, &key, now)?;
                let items = tx.execute("DELETE FROM kv_lists WHERE key = ?1", [&key])?;
                tx.execute("DELETE FROM kv_list_expiry WHERE key = ?1", [&key])?;
                let records = tx.execute(
                    "DELETE FROM kv_records WHERE key = ?1 AND expires_at > ?2",
                    rusqlite::params![key, now],
                )?;
                tx.execute("DELETE FROM kv_records WHERE key = ?1", [&key])?;
                Ok(items + records > 0)
            })
        })
        .await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        let key = key.to_string();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO kv_records (key, value, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                    expires_at = excluded.expires_at",
                    rusqlite::params![key, value, expires_at(ttl)],
                )?;
                Ok(())
            })
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM kv_records WHERE key = ?1 AND expires_at > ?2",
                    rusqlite::params![key, unix_millis() as i64],
                    |row| row.get(0),
                )
                .optional()
            })
        })
        .await
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        self.blocking(|db| {
            db.transaction(|tx| {
                let now = unix_millis() as i64;
                tx.execute(
                    "DELETE FROM kv_lists WHERE key IN
                        (SELECT key FROM kv_list_expiry WHERE expires_at <= ?1)",
                    [now],
                )?;
                let lists = tx.execute("DELETE FROM kv_list_expiry WHERE expires_at <= ?1", [now])?;
                let records = tx.execute("DELETE FROM kv_records WHERE expires_at <= ?1", [now])?;
                Ok(lists + records)
            })
        })
        .await
    }
}
