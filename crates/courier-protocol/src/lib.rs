//! # courier-protocol
//!
//! Wire model and event definitions for the Courier messaging core.
//!
//! Clients and servers exchange named events. Every event is an
//! adjacently-tagged JSON object (`{"event": "...", "data": {...}}`) when
//! carried in a WebSocket text frame, or the same structure as
//! length-prefixed MessagePack when carried in a binary frame.
//!
//! ## Inbound events
//!
//! - `connect` - authenticate the connection (must come first)
//! - `join_conversation` / `leave_conversation` - conversation rooms
//! - `send_message`, `edit_message`, `delete_message` - message lifecycle
//! - `mark_messages_read` - read receipts
//! - `typing_start` / `typing_stop` - typing indicators
//! - `update_presence` - explicit presence changes
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::typing_start("conv-1");
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod model;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError, WireFrame};
pub use events::{codes, ClientEvent, SendMessage, ServerEvent};
pub use model::{
    unix_millis, Attachment, Conversation, ConversationId, ConversationKind, GroupId, Message, MessageId,
    MessageKind, Notification, PresenceRecord, PresenceStatus, QueuedMessage,
    QueuedNotification, ReadReceipt, SyncStatus, UserId,
};
pub use version::{Version, PROTOCOL_VERSION};

#[cfg(test)]
mod tests {
    #[test]
    fn test_clock_available_at_root() {
        // milliseconds, not seconds
        assert!(crate::unix_millis() > 1_600_000_000_000);
    }
}
