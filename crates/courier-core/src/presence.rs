//! User presence.
//!
//! Each user's status is stored under `user_status:{id}` with a short TTL.
//! A user whose record has lapsed, or was never written, reads as offline.
//! Reads never fail: an unreachable store also yields the offline record.

use crate::store::DurableStore;
use courier_protocol::{PresenceRecord, PresenceStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a presence record stays valid without being refreshed.
pub const PRESENCE_TTL: Duration = Duration::from_secs(5 * 60);

#[must_use]
pub fn presence_key(user_id: &str) -> String {
    format!("user_status:{}", user_id)
}

/// Presence records kept in a [`DurableStore`].
#[derive(Clone)]
pub struct PresenceStore {
    store: Arc<dyn DurableStore>,
    ttl: Duration,
}

impl PresenceStore {
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            ttl: PRESENCE_TTL,
        }
    }

    /// Override the record TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Record `status` for the user, stamped with the current time.
    ///
    /// Returns the record that was written (or would have been, if the store
    /// is down), so callers can broadcast it.
    pub async fn set_status(&self, user_id: &str, status: PresenceStatus) -> PresenceRecord {
        let record = PresenceRecord::now(user_id, status);

        match serde_json::to_string(&record) {
            Ok(value) => match self.store.set(&presence_key(user_id), value, self.ttl).await {
                Ok(()) => debug!(user = %user_id, status = %status, "Presence updated"),
                Err(e) => warn!(user = %user_id, error = %e, "Failed to store presence"),
            },
            Err(e) => warn!(user = %user_id, error = %e, "Failed to serialize presence"),
        }

        record
    }

    /// Current presence of the user.
    pub async fn get_status(&self, user_id: &str) -> PresenceRecord {
        match self.store.get(&presence_key(user_id)).await {
            Ok(Some(value)) => match serde_json::from_str(&value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Discarding undecodable presence");
                    PresenceRecord::offline(user_id)
                }
            },
            Ok(None) => PresenceRecord::offline(user_id),
            Err(e) => {
                warn!(user = %user_id, error = %e, "Failed to read presence");
                PresenceRecord::offline(user_id)
            }
        }
    }
}
