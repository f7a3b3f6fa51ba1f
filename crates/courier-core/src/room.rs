//! Room abstraction for Courier.
//!
//! Rooms are named broadcast groups. Every user has a personal room, every
//! conversation has a room, and all connections share the presence room.

use crate::registry::ConnectionId;
use std::collections::HashSet;
use tracing::debug;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Room every authenticated connection joins for presence broadcasts.
pub const PRESENCE_ROOM: &str = "presence";

/// Personal room of a user.
#[must_use]
pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Room of a conversation.
#[must_use]
pub fn conversation_room(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}")
}

/// Validate a room name.
///
/// Any Unicode is allowed except control characters, so rooms built from
/// user and conversation ids keep working for non-ASCII ids.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// A room and its member connections.
#[derive(Debug)]
pub struct Room {
    name: String,
    members: HashSet<ConnectionId>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: HashSet::new(),
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member. Returns `true` if it was not already a member.
    pub fn join(&mut self, member: &ConnectionId) -> bool {
        let added = self.members.insert(member.clone());
        if added {
            debug!(room = %self.name, connection = %member, "Connection joined room");
        }
        added
    }

    /// Remove a member. Returns `true` if it was a member.
    pub fn leave(&mut self, member: &str) -> bool {
        let removed = self.members.remove(member);
        if removed {
            debug!(room = %self.name, connection = %member, "Connection left room");
        }
        removed
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn is_member(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    /// Number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Iterate over the members.
    pub fn members(&self) -> impl Iterator<Item = &ConnectionId> {
        self.members.iter()
    }

    /// Whether the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_join_leave() {
        let mut room = Room::new("conversation:c1");
        let conn: ConnectionId = "conn-1".into();

        assert!(room.join(&conn));
        assert!(!room.join(&conn));
        assert!(room.is_member("conn-1"));
        assert_eq!(room.member_count(), 1);

        assert!(room.leave("conn-1"));
        assert!(!room.leave("conn-1"));
        assert!(room.is_empty());
    }

    #[test]
    fn test_room_name_validation() {
        assert!(validate_room_name(&user_room("alice")).is_ok());
        assert!(validate_room_name(&conversation_room("c1")).is_ok());
        assert!(validate_room_name(PRESENCE_ROOM).is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("$system").is_err());
        assert!(validate_room_name("bad\nname").is_err());
        assert!(validate_room_name("bad\u{85}name").is_err());
        assert!(validate_room_name(&user_room("josé")).is_ok());
        assert!(validate_room_name(&user_room("李雷")).is_ok());

        let long_name = "a".repeat(MAX_ROOM_NAME_LENGTH + 1);
        assert!(validate_room_name(&long_name).is_err());
    }
}
