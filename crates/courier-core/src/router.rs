//! Room router for Courier.
//!
//! The router owns every room and every member's outbound sink, and fans
//! events out to room members. It implements [`PubSub`], the
//! transport-agnostic join/leave/publish interface the rest of the core
//! talks to.

use crate::registry::ConnectionId;
use crate::room::{validate_room_name, Room};
use courier_protocol::ServerEvent;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// An event on its way to a connection. Shared between all recipients.
pub type Outbound = Arc<ServerEvent>;

/// Outbound sink of a single connection.
pub type MemberSink = mpsc::UnboundedSender<Outbound>;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The connection has no attached sink.
    #[error("Unknown connection: {0}")]
    UnknownMember(String),

    /// Not a member of the room.
    #[error("Not a member of room: {0}")]
    NotMember(String),

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached")]
    MaxRoomsReached,

    /// Maximum rooms per connection reached.
    #[error("Maximum memberships reached")]
    MaxMembershipsReached,
}

/// Generic pub/sub interface over logical rooms.
///
/// Authorization is the caller's job; implementations only route.
pub trait PubSub: Send + Sync {
    /// Add `member` to `room`. Returns `true` if it was not already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid or limits are exceeded.
    fn join(&self, member: &ConnectionId, room: &str) -> Result<bool, RouterError>;

    /// Remove `member` from `room`.
    ///
    /// # Errors
    ///
    /// Returns an error if `member` is not in `room`.
    fn leave(&self, member: &ConnectionId, room: &str) -> Result<(), RouterError>;

    /// Publish `event` to every member of `room` except `exclude`.
    ///
    /// Returns the number of members the event was handed to. Publishing to
    /// an empty or unknown room is a no-op.
    fn publish(&self, room: &str, event: ServerEvent, exclude: Option<&ConnectionId>) -> usize;

    /// Push `event` to a single member. Returns `false` if it is gone.
    fn send_to(&self, member: &ConnectionId, event: ServerEvent) -> bool;
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum rooms per connection.
    pub max_rooms_per_member: usize,
    /// Whether to delete rooms when their last member leaves.
    pub auto_delete_empty_rooms: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_rooms: 100_000,
            max_rooms_per_member: 256,
            auto_delete_empty_rooms: true,
        }
    }
}

/// The central room router.
pub struct RoomRouter {
    /// Rooms indexed by name.
    rooms: DashMap<String, Room>,
    /// Connection memberships (connection -> set of room names).
    memberships: DashMap<ConnectionId, DashSet<String>>,
    /// Outbound sinks of attached connections.
    sinks: DashMap<ConnectionId, MemberSink>,
    /// Configuration.
    config: RouterConfig,
}

impl RoomRouter {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating room router with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            sinks: DashMap::new(),
            config,
        }
    }

    /// Attach a connection's outbound sink. Replaces any previous sink.
    pub fn attach(&self, member: ConnectionId, sink: MemberSink) {
        debug!(connection = %member, "Attached connection");
        self.sinks.insert(member, sink);
    }

    /// Detach a connection and remove it from every room.
    ///
    /// Returns the rooms it was in.
    pub fn detach(&self, member: &ConnectionId) -> Vec<String> {
        self.sinks.remove(member);
        let rooms = self.leave_all(member);
        debug!(connection = %member, rooms = rooms.len(), "Detached connection");
        rooms
    }

    /// Remove a connection from every room it joined.
    pub fn leave_all(&self, member: &ConnectionId) -> Vec<String> {
        let Some((_, rooms)) = self.memberships.remove(member) else {
            return Vec::new();
        };

        let names: Vec<String> = rooms.into_iter().collect();
        for name in &names {
            self.remove_from_room(member, name);
        }
        names
    }

    fn remove_from_room(&self, member: &ConnectionId, room_name: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_name) {
            room.leave(member.as_str());

            if self.config.auto_delete_empty_rooms && room.is_empty() {
                drop(room);
                self.rooms.remove_if(room_name, |_, r| r.is_empty());
                debug!(room = %room_name, "Deleted empty room");
            }
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            room_count: self.rooms.len(),
            connection_count: self.sinks.len(),
            total_memberships: self.memberships.iter().map(|m| m.len()).sum(),
        }
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Check whether a connection is in a room.
    #[must_use]
    pub fn is_member(&self, member: &ConnectionId, room: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|r| r.is_member(member.as_str()))
    }

    /// Number of members in a room.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.member_count()).unwrap_or(0)
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn member_rooms(&self, member: &ConnectionId) -> Vec<String> {
        self.memberships
            .get(member)
            .map(|s| s.iter().map(|r| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether a connection has an attached sink.
    #[must_use]
    pub fn is_attached(&self, member: &ConnectionId) -> bool {
        self.sinks.contains_key(member)
    }

    /// Detach everything. Used at shutdown.
    pub fn clear(&self) {
        self.sinks.clear();
        self.memberships.clear();
        self.rooms.clear();
    }
}

impl PubSub for RoomRouter {
    fn join(&self, member: &ConnectionId, room_name: &str) -> Result<bool, RouterError> {
        validate_room_name(room_name).map_err(RouterError::InvalidRoom)?;

        if !self.sinks.contains_key(member) {
            return Err(RouterError::UnknownMember(member.to_string()));
        }

        let member_rooms = self.memberships.entry(member.clone()).or_default();
        if member_rooms.contains(room_name) {
            return Ok(false);
        }
        if member_rooms.len() >= self.config.max_rooms_per_member {
            return Err(RouterError::MaxMembershipsReached);
        }
        if !self.rooms.contains_key(room_name) && self.rooms.len() >= self.config.max_rooms {
            return Err(RouterError::MaxRoomsReached);
        }

        let mut room = self.rooms.entry(room_name.to_string()).or_insert_with(|| {
            debug!(room = %room_name, "Creating new room");
            Room::new(room_name)
        });
        room.join(member);
        member_rooms.insert(room_name.to_string());

        trace!(
            room = %room_name,
            connection = %member,
            members = room.member_count(),
            "Joined"
        );

        Ok(true)
    }

    fn leave(&self, member: &ConnectionId, room_name: &str) -> Result<(), RouterError> {
        let removed = self
            .memberships
            .get(member)
            .is_some_and(|rooms| rooms.remove(room_name).is_some());

        if !removed {
            return Err(RouterError::NotMember(room_name.to_string()));
        }

        self.remove_from_room(member, room_name);
        Ok(())
    }

    fn publish(&self, room_name: &str, event: ServerEvent, exclude: Option<&ConnectionId>) -> usize {
        let Some(room) = self.rooms.get(room_name) else {
            trace!(room = %room_name, event = event.name(), "Publish to empty room");
            return 0;
        };

        let event: Outbound = Arc::new(event);
        let mut delivered = 0;

        for member in room.members() {
            if exclude == Some(member) {
                continue;
            }
            if let Some(sink) = self.sinks.get(member) {
                if sink.send(Arc::clone(&event)).is_ok() {
                    delivered += 1;
                } else {
                    trace!(connection = %member, "Sink closed, dropping event");
                }
            }
        }

        trace!(room = %room_name, event = event.name(), recipients = delivered, "Published");
        delivered
    }

    fn send_to(&self, member: &ConnectionId, event: ServerEvent) -> bool {
        match self.sinks.get(member) {
            Some(sink) => sink.send(Arc::new(event)).is_ok(),
            None => false,
        }
    }
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of active rooms.
    pub room_count: usize,
    /// Number of attached connections.
    pub connection_count: usize,
    /// Total number of room memberships.
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn attach(router: &RoomRouter, id: &str) -> (ConnectionId, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionId::from(id);
        router.attach(conn.clone(), tx);
        (conn, rx)
    }

    #[test]
    fn test_router_join_leave() {
        let router = RoomRouter::new();
        let (conn, _rx) = attach(&router, "conn-1");

        assert!(router.join(&conn, "conversation:c1").unwrap());
        assert!(!router.join(&conn, "conversation:c1").unwrap());
        assert!(router.room_exists("conversation:c1"));
        assert_eq!(router.member_count("conversation:c1"), 1);

        router.leave(&conn, "conversation:c1").unwrap();
        // Room should be auto-deleted
        assert!(!router.room_exists("conversation:c1"));
        assert!(matches!(
            router.leave(&conn, "conversation:c1"),
            Err(RouterError::NotMember(_))
        ));
    }

    #[test]
    fn test_router_publish_with_exclude() {
        let router = RoomRouter::new();
        let (conn1, mut rx1) = attach(&router, "conn-1");
        let (conn2, mut rx2) = attach(&router, "conn-2");

        router.join(&conn1, "room").unwrap();
        router.join(&conn2, "room").unwrap();

        let count = router.publish("room", ServerEvent::typing("c1", "alice", true), Some(&conn1));
        assert_eq!(count, 1);

        assert!(rx1.try_recv().is_err());
        let event = rx2.try_recv().unwrap();
        assert_eq!(event.name(), "user_typing");
    }

    #[test]
    fn test_publish_to_empty_room_is_noop() {
        let router = RoomRouter::new();
        assert_eq!(router.publish("user:nobody", ServerEvent::pong(None), None), 0);
    }

    #[test]
    fn test_join_requires_attached_sink() {
        let router = RoomRouter::new();
        assert!(matches!(
            router.join(&"ghost".into(), "room"),
            Err(RouterError::UnknownMember(_))
        ));
    }

    #[test]
    fn test_router_invalid_room() {
        let router = RoomRouter::new();
        let (conn, _rx) = attach(&router, "conn-1");

        assert!(router.join(&conn, "").is_err());
        assert!(router.join(&conn, "$system").is_err());
    }

    #[test]
    fn test_membership_limit() {
        let router = RoomRouter::with_config(RouterConfig {
            max_rooms_per_member: 2,
            ..Default::default()
        });
        let (conn, _rx) = attach(&router, "conn-1");

        router.join(&conn, "a").unwrap();
        router.join(&conn, "b").unwrap();
        assert!(matches!(
            router.join(&conn, "c"),
            Err(RouterError::MaxMembershipsReached)
        ));
    }

    #[test]
    fn test_detach_leaves_all_rooms() {
        let router = RoomRouter::new();
        let (conn, _rx) = attach(&router, "conn-1");

        router.join(&conn, "room-1").unwrap();
        router.join(&conn, "room-2").unwrap();

        let mut rooms = router.detach(&conn);
        rooms.sort();
        assert_eq!(rooms, vec!["room-1".to_string(), "room-2".to_string()]);

        assert!(!router.room_exists("room-1"));
        assert!(!router.room_exists("room-2"));
        assert!(!router.send_to(&conn, ServerEvent::pong(None)));
    }

    #[test]
    fn test_send_to_closed_sink() {
        let router = RoomRouter::new();
        let (conn, rx) = attach(&router, "conn-1");
        drop(rx);

        assert!(!router.send_to(&conn, ServerEvent::pong(None)));
    }

    #[test]
    fn test_router_stats() {
        let router = RoomRouter::new();
        let (conn1, _rx1) = attach(&router, "conn-1");
        let (conn2, _rx2) = attach(&router, "conn-2");

        router.join(&conn1, "room-1").unwrap();
        router.join(&conn1, "room-2").unwrap();
        router.join(&conn2, "room-1").unwrap();

        let stats = router.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_memberships, 3);
    }
}
