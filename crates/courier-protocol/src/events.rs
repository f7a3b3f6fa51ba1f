//! Inbound and outbound events.
//!
//! Events are adjacently tagged: the variant name goes into `event` and the
//! fields into `data`, so a `typing_start` looks like
//! `{"event":"typing_start","data":{"conversation_id":"c1"}}`.

use serde::{Deserialize, Serialize};

use crate::model::{
    Attachment, ConversationId, GroupId, Message, MessageId, MessageKind, PresenceRecord,
    PresenceStatus, QueuedMessage, QueuedNotification, UserId,
};

/// Error codes carried by `message_error`.
pub mod codes {
    /// Malformed or invalid payload.
    pub const VALIDATION: u16 = 4000;
    /// Connection has not completed `connect`.
    pub const UNAUTHENTICATED: u16 = 4001;
    /// Caller may not act on this resource.
    pub const FORBIDDEN: u16 = 4003;
    /// Target does not exist or is not owned by the caller.
    pub const NOT_FOUND: u16 = 4004;
    /// Storage failure.
    pub const INTERNAL: u16 = 5000;
}

/// Payload of `send_message`.
///
/// Exactly one of `recipient_id`, `group_id`, `conversation_id` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// Opaque client reference echoed back in `message_sent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl SendMessage {
    /// A plain text direct message.
    #[must_use]
    pub fn direct(recipient_id: impl Into<UserId>, content: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient_id.into()),
            content: content.into(),
            ..Default::default()
        }
    }

    /// A plain text message to a group.
    #[must_use]
    pub fn group(group_id: impl Into<GroupId>, content: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            content: content.into(),
            ..Default::default()
        }
    }

    /// A plain text message to an existing conversation.
    #[must_use]
    pub fn conversation(conversation_id: impl Into<ConversationId>, content: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Events sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Authenticate the connection. Must be the first event.
    Connect {
        /// Client protocol major version.
        version: u8,
        /// Credential verified by the server's authenticator.
        token: String,
    },

    /// Join a conversation room.
    JoinConversation { conversation_id: ConversationId },

    /// Leave a conversation room.
    LeaveConversation { conversation_id: ConversationId },

    /// Send a message.
    SendMessage(SendMessage),

    /// Mark messages in a conversation as read.
    MarkMessagesRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },

    /// Typing started in a conversation.
    TypingStart { conversation_id: ConversationId },

    /// Typing stopped in a conversation.
    TypingStop { conversation_id: ConversationId },

    /// Edit one of the caller's messages.
    EditMessage {
        message_id: MessageId,
        new_content: String,
    },

    /// Delete one of the caller's messages.
    DeleteMessage { message_id: MessageId },

    /// Set the caller's presence status.
    UpdatePresence { status: PresenceStatus },

    /// Application-level keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Connect { .. } => "connect",
            ClientEvent::JoinConversation { .. } => "join_conversation",
            ClientEvent::LeaveConversation { .. } => "leave_conversation",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::MarkMessagesRead { .. } => "mark_messages_read",
            ClientEvent::TypingStart { .. } => "typing_start",
            ClientEvent::TypingStop { .. } => "typing_stop",
            ClientEvent::EditMessage { .. } => "edit_message",
            ClientEvent::DeleteMessage { .. } => "delete_message",
            ClientEvent::UpdatePresence { .. } => "update_presence",
            ClientEvent::Ping { .. } => "ping",
        }
    }

    /// Create a `connect` event for the current protocol version.
    #[must_use]
    pub fn connect(token: impl Into<String>) -> Self {
        ClientEvent::Connect {
            version: crate::PROTOCOL_VERSION.major,
            token: token.into(),
        }
    }

    /// Create a `join_conversation` event.
    #[must_use]
    pub fn join(conversation_id: impl Into<ConversationId>) -> Self {
        ClientEvent::JoinConversation {
            conversation_id: conversation_id.into(),
        }
    }

    /// Create a `typing_start` event.
    #[must_use]
    pub fn typing_start(conversation_id: impl Into<ConversationId>) -> Self {
        ClientEvent::TypingStart {
            conversation_id: conversation_id.into(),
        }
    }

    /// Create a `typing_stop` event.
    #[must_use]
    pub fn typing_stop(conversation_id: impl Into<ConversationId>) -> Self {
        ClientEvent::TypingStop {
            conversation_id: conversation_id.into(),
        }
    }
}

/// Events sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection authenticated.
    Connected {
        connection_id: String,
        user_id: UserId,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Acknowledges a persisted message to its sender.
    MessageSent {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },

    /// A message for the receiving user.
    NewMessage { message: Message },

    /// Another participant read messages.
    MessagesRead {
        conversation_id: ConversationId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
        read_at: u64,
    },

    /// Confirms a `mark_messages_read` to the reader.
    MessagesMarkedRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },

    /// Typing indicator change.
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },

    /// A message was edited.
    MessageUpdated { message: Message },

    /// A message was deleted.
    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
    },

    /// A request from this connection failed.
    MessageError { code: u16, error: String },

    /// A user's presence changed.
    UserPresenceUpdated(PresenceRecord),

    /// Messages queued while the user was offline, oldest first.
    QueuedMessages { messages: Vec<QueuedMessage> },

    /// A notification, live or replayed from the queue.
    Notification(QueuedNotification),

    /// Reply to `ping`.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::MessagesRead { .. } => "messages_read",
            ServerEvent::MessagesMarkedRead { .. } => "messages_marked_read",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::MessageUpdated { .. } => "message_updated",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::MessageError { .. } => "message_error",
            ServerEvent::UserPresenceUpdated(_) => "user_presence_updated",
            ServerEvent::QueuedMessages { .. } => "queued_messages",
            ServerEvent::Notification(_) => "notification",
            ServerEvent::Pong { .. } => "pong",
        }
    }

    /// Create a `message_error` event.
    #[must_use]
    pub fn error(code: u16, error: impl Into<String>) -> Self {
        ServerEvent::MessageError {
            code,
            error: error.into(),
        }
    }

    /// Create a `user_typing` event.
    #[must_use]
    pub fn typing(
        conversation_id: impl Into<ConversationId>,
        user_id: impl Into<UserId>,
        is_typing: bool,
    ) -> Self {
        ServerEvent::UserTyping {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            is_typing,
        }
    }

    /// Create a `pong` event.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerEvent::Pong { timestamp }
    }
}
