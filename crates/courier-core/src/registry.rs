//! Process-local map of users to their live connection.
//!
//! A user has at most one routed connection: the most recent `register`
//! wins. `unregister` only removes the entry if it still points at the
//! connection being torn down, so a slow disconnect cannot evict a newer
//! connection.

use courier_protocol::UserId;
use dashmap::DashMap;
use std::borrow::Borrow;
use std::fmt;
use tracing::debug;

/// Unique identifier for a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// userId → connectionId routing table.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<UserId, ConnectionId>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `user_id` to `connection`, returning the connection it replaced.
    pub fn register(&self, user_id: &str, connection: ConnectionId) -> Option<ConnectionId> {
        let previous = self.entries.insert(user_id.to_string(), connection.clone());
        match &previous {
            Some(old) => debug!(
                user = %user_id,
                connection = %connection,
                replaced = %old,
                "Registry: connection replaced"
            ),
            None => debug!(user = %user_id, connection = %connection, "Registry: registered"),
        }
        previous
    }

    /// Remove the route for `user_id` if it still points at `connection`.
    ///
    /// Returns `true` if the entry was removed.
    pub fn unregister(&self, user_id: &str, connection: &ConnectionId) -> bool {
        let removed = self
            .entries
            .remove_if(user_id, |_, current| current == connection)
            .is_some();

        if removed {
            debug!(user = %user_id, connection = %connection, "Registry: unregistered");
        } else {
            debug!(
                user = %user_id,
                connection = %connection,
                "Registry: stale unregister ignored"
            );
        }
        removed
    }

    /// Look up the live connection of a user.
    #[must_use]
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        self.entries.get(user_id).map(|c| c.value().clone())
    }

    /// Check whether a user has a live connection in this process.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Snapshot of the users with a live connection.
    #[must_use]
    pub fn list_online(&self) -> Vec<UserId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of routed users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no user is routed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every route.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
