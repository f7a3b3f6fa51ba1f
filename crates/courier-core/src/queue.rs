//! Offline delivery queue.
//!
//! Messages for a recipient with no live connection are appended to a
//! per-user list and replayed on their next connect. Notifications use a
//! separate list with a shorter TTL.
//!
//! Failures of the backing store never reach the caller: they are logged and
//! the operation degrades to a no-op (or an empty result).

use crate::store::DurableStore;
use courier_protocol::{unix_millis, Message, Notification, QueuedMessage, QueuedNotification};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long queued messages survive without a new write.
pub const MESSAGE_QUEUE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long queued notifications survive without a new write.
pub const NOTIFICATION_QUEUE_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[must_use]
pub fn message_queue_key(user_id: &str) -> String {
    format!("message_queue:{}", user_id)
}

#[must_use]
pub fn notification_queue_key(user_id: &str) -> String {
    format!("notification_queue:{}", user_id)
}

/// Items read from a queue, plus what is needed to remove exactly them.
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    receipt: Receipt,
}

impl<T> Batch<T> {
    #[must_use]
    pub fn into_parts(self) -> (Vec<T>, Receipt) {
        (self.items, self.receipt)
    }
}

/// Identifies the head of a queue that was read, for [`OfflineDeliveryQueue::acknowledge`].
///
/// `entries` counts stored entries, including any that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    key: String,
    entries: usize,
}

impl Receipt {
    #[must_use]
    pub fn entries(&self) -> usize {
        self.entries
    }
}

/// Per-user FIFO of undelivered messages and notifications.
#[derive(Clone)]
pub struct OfflineDeliveryQueue {
    store: Arc<dyn DurableStore>,
}

impl OfflineDeliveryQueue {
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Append a message to the recipient's queue and reset its TTL.
    pub async fn enqueue(&self, recipient_id: &str, message: &Message) {
        let queued = QueuedMessage::from_message(message, unix_millis());
        self.push(&message_queue_key(recipient_id), &queued, MESSAGE_QUEUE_TTL)
            .await;
    }

    /// Append a notification to the user's queue and reset its TTL.
    pub async fn enqueue_notification(&self, user_id: &str, notification: Notification) {
        let queued = QueuedNotification {
            notification,
            queued_at: Some(unix_millis()),
        };
        self.push(&notification_queue_key(user_id), &queued, NOTIFICATION_QUEUE_TTL)
            .await;
    }

    /// Everything queued for the recipient, oldest first. Does not clear.
    pub async fn drain(&self, recipient_id: &str) -> Vec<QueuedMessage> {
        self.take(recipient_id).await.items
    }

    pub async fn drain_notifications(&self, user_id: &str) -> Vec<QueuedNotification> {
        self.take_notifications(user_id).await.items
    }

    /// Like [`drain`](Self::drain), with a receipt for removing exactly
    /// what was read once it has been delivered.
    pub async fn take(&self, recipient_id: &str) -> Batch<QueuedMessage> {
        self.read(message_queue_key(recipient_id)).await
    }

    pub async fn take_notifications(&self, user_id: &str) -> Batch<QueuedNotification> {
        self.read(notification_queue_key(user_id)).await
    }

    /// Remove the entries a receipt covers. Entries queued after the read
    /// are kept.
    pub async fn acknowledge(&self, receipt: &Receipt) {
        if receipt.entries == 0 {
            return;
        }
        match self.store.trim_front(&receipt.key, receipt.entries).await {
            Ok(removed) => debug!(key = %receipt.key, removed, "Acknowledged queue entries"),
            Err(e) => warn!(key = %receipt.key, error = %e, "Failed to acknowledge queue entries"),
        }
    }

    pub async fn clear(&self, recipient_id: &str) {
        self.delete(&message_queue_key(recipient_id)).await;
    }

    pub async fn clear_notifications(&self, user_id: &str) {
        self.delete(&notification_queue_key(user_id)).await;
    }

    /// Number of queued messages. Reports 0 when the store is unreachable.
    pub async fn count(&self, recipient_id: &str) -> usize {
        self.len(&message_queue_key(recipient_id)).await
    }

    pub async fn notification_count(&self, user_id: &str) -> usize {
        self.len(&notification_queue_key(user_id)).await
    }

    async fn push<T: serde::Serialize>(&self, key: &str, item: &T, ttl: Duration) {
        let value = match serde_json::to_string(item) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize queue item");
                return;
            }
        };

        match self.store.push_back(key, value, ttl).await {
            Ok(len) => debug!(key = %key, len, "Queued for offline delivery"),
            Err(e) => warn!(key = %key, error = %e, "Failed to enqueue"),
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: String) -> Batch<T> {
        let values = match self.store.range(&key).await {
            Ok(values) => values,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read queue");
                Vec::new()
            }
        };

        let items = values
            .iter()
            .filter_map(|value| match serde_json::from_str(value) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable queue entry");
                    None
                }
            })
            .collect();

        Batch {
            items,
            receipt: Receipt {
                entries: values.len(),
                key,
            },
        }
    }

    async fn delete(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(key = %key, error = %e, "Failed to clear queue");
        }
    }

    async fn len(&self, key: &str) -> usize {
        self.store.len(key).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "Failed to count queue");
            0
        })
    }
}
