//! Typing indicators.
//!
//! Tracks which users are typing in which conversation and emits
//! `user_typing` events to the conversation room on every transition. Each
//! typing user has one idle timer; a repeated start aborts and reschedules it.
//!
//! ```text
//!               start (emit true)
//!  not_typing ───────────────────▶ typing ◀─┐
//!      ▲                             │      │ start (timer restarted)
//!      └─────────────────────────────┘──────┘
//!        stop / stop_all / idle timeout (emit false)
//! ```

use crate::registry::ConnectionId;
use crate::room::conversation_room;
use crate::router::PubSub;
use courier_protocol::{ConversationId, ServerEvent, UserId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Idle time after which a typing user is considered stopped.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(10);

struct TypingEntry {
    connection: ConnectionId,
    generation: u64,
    timer: JoinHandle<()>,
}

struct Inner {
    pubsub: Arc<dyn PubSub>,
    conversations: DashMap<ConversationId, HashMap<UserId, TypingEntry>>,
    generation: AtomicU64,
    timeout: Duration,
}

impl Inner {
    /// Remove the user's entry. With `generation`, only if it still matches.
    fn take(&self, conversation_id: &str, user_id: &str, generation: Option<u64>) -> Option<TypingEntry> {
        let entry = {
            let mut users = self.conversations.get_mut(conversation_id)?;
            if let Some(expected) = generation {
                if users.get(user_id).map(|e| e.generation) != Some(expected) {
                    return None;
                }
            }
            users.remove(user_id)?
        };
        self.conversations
            .remove_if(conversation_id, |_, users| users.is_empty());
        Some(entry)
    }

    fn emit(&self, conversation_id: &str, user_id: &str, is_typing: bool, exclude: &ConnectionId) {
        let delivered = self.pubsub.publish(
            &conversation_room(conversation_id),
            ServerEvent::typing(conversation_id, user_id, is_typing),
            Some(exclude),
        );
        trace!(
            conversation = %conversation_id,
            user = %user_id,
            is_typing,
            delivered,
            "Typing indicator sent"
        );
    }

    fn expire(&self, conversation_id: &str, user_id: &str, generation: u64) {
        if let Some(entry) = self.take(conversation_id, user_id, Some(generation)) {
            debug!(conversation = %conversation_id, user = %user_id, "Typing timed out");
            self.emit(conversation_id, user_id, false, &entry.connection);
        }
    }
}

/// Per-conversation typing state with idle expiry.
///
/// Cloning is cheap and clones share state. Timer tasks only hold a weak
/// reference, so dropping every clone ends them.
#[derive(Clone)]
pub struct TypingCoordinator {
    inner: Arc<Inner>,
}

impl TypingCoordinator {
    #[must_use]
    pub fn new(pubsub: Arc<dyn PubSub>) -> Self {
        Self::with_timeout(pubsub, TYPING_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(pubsub: Arc<dyn PubSub>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pubsub,
                conversations: DashMap::new(),
                generation: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    fn schedule(&self, conversation_id: &str, user_id: &str, generation: u64) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(&conversation_id, &user_id, generation);
            }
        })
    }

    /// Mark the user as typing from `connection`.
    ///
    /// Emits `user_typing{is_typing: true}` only on the transition; a
    /// repeated start just restarts the idle timer. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self, conversation_id: &str, user_id: &str, connection: &ConnectionId) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timer = self.schedule(conversation_id, user_id, generation);

        let started = {
            let mut users = self
                .inner
                .conversations
                .entry(conversation_id.to_string())
                .or_default();
            match users.get_mut(user_id) {
                Some(entry) => {
                    entry.timer.abort();
                    entry.timer = timer;
                    entry.generation = generation;
                    entry.connection = connection.clone();
                    false
                }
                None => {
                    users.insert(
                        user_id.to_string(),
                        TypingEntry {
                            connection: connection.clone(),
                            generation,
                            timer,
                        },
                    );
                    true
                }
            }
        };

        if started {
            debug!(conversation = %conversation_id, user = %user_id, "Typing started");
            self.inner.emit(conversation_id, user_id, true, connection);
        }
    }

    /// Mark the user as no longer typing. Returns `false` if they were not.
    pub fn stop(&self, conversation_id: &str, user_id: &str) -> bool {
        self.finish(conversation_id, user_id, None)
    }

    fn finish(&self, conversation_id: &str, user_id: &str, generation: Option<u64>) -> bool {
        match self.inner.take(conversation_id, user_id, generation) {
            Some(entry) => {
                entry.timer.abort();
                debug!(conversation = %conversation_id, user = %user_id, "Typing stopped");
                self.inner.emit(conversation_id, user_id, false, &entry.connection);
                true
            }
            None => false,
        }
    }

    /// Stop the user in every conversation. Returns how many were stopped.
    pub fn stop_all_for_user(&self, user_id: &str) -> usize {
        let conversations: Vec<ConversationId> = self
            .inner
            .conversations
            .iter()
            .filter(|entry| entry.value().contains_key(user_id))
            .map(|entry| entry.key().clone())
            .collect();

        conversations
            .iter()
            .filter(|conversation_id| self.stop(conversation_id, user_id))
            .count()
    }

    /// Stop the user wherever they are typing from `connection`.
    ///
    /// Indicators started from another connection of the same user are left
    /// running. Returns how many were stopped.
    pub fn stop_all_for_connection(&self, user_id: &str, connection: &ConnectionId) -> usize {
        let owned: Vec<(ConversationId, u64)> = self
            .inner
            .conversations
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .get(user_id)
                    .filter(|typing| &typing.connection == connection)
                    .map(|typing| (entry.key().clone(), typing.generation))
            })
            .collect();

        owned
            .iter()
            .filter(|(conversation_id, generation)| {
                self.finish(conversation_id, user_id, Some(*generation))
            })
            .count()
    }

    /// Users currently typing in the conversation, sorted.
    #[must_use]
    pub fn typing_users(&self, conversation_id: &str) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .inner
            .conversations
            .get(conversation_id)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    #[must_use]
    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.inner
            .conversations
            .get(conversation_id)
            .is_some_and(|users| users.contains_key(user_id))
    }

    /// Cancel every timer and forget all state without emitting anything.
    pub fn shutdown(&self) {
        let mut cancelled = 0;
        self.inner.conversations.retain(|_, users| {
            for (_, entry) in users.drain() {
                entry.timer.abort();
                cancelled += 1;
            }
            false
        });
        debug!(cancelled, "Typing coordinator shut down");
    }
}
