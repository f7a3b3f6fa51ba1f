//! Data model shared by the wire protocol and the messaging core.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// A user identifier.
pub type UserId = String;

/// A message identifier.
pub type MessageId = String;

/// A conversation identifier.
pub type ConversationId = String;

/// A group identifier, owned by the external group service.
pub type GroupId = String;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Kind of message content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Audio,
    Video,
    System,
}

impl MessageKind {
    /// Stable storage name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
            MessageKind::System => "system",
        }
    }
}

impl FromStr for MessageKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "audio" => Ok(MessageKind::Audio),
            "video" => Ok(MessageKind::Video),
            "system" => Ok(MessageKind::System),
            _ => Err("Invalid message kind"),
        }
    }
}

/// Client synchronisation state of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    #[default]
    Synced,
    Failed,
}

impl SyncStatus {
    /// Stable storage name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err("Invalid sync status"),
        }
    }
}

/// A file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Where the content can be fetched from.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A read receipt. At most one per user per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub read_at: u64,
}

/// A persisted message.
///
/// Exactly one of `recipient_id` (direct) and `group_id` (group) is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Creation time, unix milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

impl Message {
    /// Whether `user_id` already has a read receipt on this message.
    #[must_use]
    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.iter().any(|r| r.user_id == user_id)
    }
}

/// Conversation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    /// Stable storage name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

impl FromStr for ConversationKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ConversationKind::Direct),
            "group" => Ok(ConversationKind::Group),
            _ => Err("Invalid conversation kind"),
        }
    }
}

/// A conversation among a fixed participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub participants: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
    pub last_activity: u64,
    #[serde(default)]
    pub unread_count: HashMap<UserId, u32>,
}

impl Conversation {
    /// Check whether a user takes part in this conversation.
    #[must_use]
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// Participants other than `user_id`.
    pub fn others<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participants.iter().filter(move |p| p.as_str() != user_id)
    }
}

/// A message as stored in an offline queue.
///
/// Bookkeeping fields (`read_by`, `sync_status`) are stripped: they are
/// meaningless to a recipient who has not seen the message yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: u64,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    pub queued_at: u64,
}

impl QueuedMessage {
    /// Normalise a message for queueing.
    #[must_use]
    pub fn from_message(message: &Message, queued_at: u64) -> Self {
        Self {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            group_id: message.group_id.clone(),
            conversation_id: message.conversation_id.clone(),
            content: message.content.clone(),
            kind: message.kind,
            attachments: message.attachments.clone(),
            timestamp: message.timestamp,
            is_edited: message.is_edited,
            edited_at: message.edited_at,
            reply_to_id: message.reply_to_id.clone(),
            queued_at,
        }
    }
}

/// A user-facing notification produced by an external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: u64,
}

/// A notification together with the time it was queued.
///
/// Live notifications carry no `queued_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedNotification {
    #[serde(flatten)]
    pub notification: Notification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<u64>,
}

/// Presence status chosen by a user (or implied by the connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    /// `away` still counts as online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Online/offline status plus last-seen timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub is_online: bool,
    pub status: PresenceStatus,
    /// Unix milliseconds.
    pub last_seen: u64,
}

impl PresenceRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn now(user_id: impl Into<UserId>, status: PresenceStatus) -> Self {
        Self {
            user_id: user_id.into(),
            is_online: status.is_online(),
            status,
            last_seen: unix_millis(),
        }
    }

    /// The record used when nothing is known about a user.
    #[must_use]
    pub fn offline(user_id: impl Into<UserId>) -> Self {
        Self::now(user_id, PresenceStatus::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            id: "m1".into(),
            sender_id: "bob".into(),
            recipient_id: Some("alice".into()),
            group_id: None,
            conversation_id: "c1".into(),
            content: "hi".into(),
            kind: MessageKind::Text,
            attachments: vec![],
            timestamp: 1_700_000_000_000,
            read_by: vec![ReadReceipt {
                user_id: "bob".into(),
                read_at: 1,
            }],
            sync_status: SyncStatus::Synced,
            is_edited: false,
            edited_at: None,
            reply_to_id: None,
        }
    }

    #[test]
    fn test_message_kind_storage_names() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::File,
            MessageKind::Audio,
            MessageKind::Video,
            MessageKind::System,
        ] {
            assert_eq!(kind.as_str().parse::<MessageKind>(), Ok(kind));
        }
        assert!("sticker".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_message_serializes_kind_as_type() {
        let json = serde_json::to_value(sample_message()).unwrap();
        assert_eq!(json["type"], "text");
        assert!(json.get("group_id").is_none());
    }

    #[test]
    fn test_queued_message_strips_bookkeeping() {
        let queued = QueuedMessage::from_message(&sample_message(), 42);
        let json = serde_json::to_value(&queued).unwrap();

        assert_eq!(json["content"], "hi");
        assert_eq!(json["queued_at"], 42);
        assert!(json.get("read_by").is_none());
        assert!(json.get("sync_status").is_none());
    }

    #[test]
    fn test_presence_status() {
        assert!(PresenceStatus::Away.is_online());
        assert!(!PresenceStatus::Offline.is_online());

        let record = PresenceRecord::offline("alice");
        assert!(!record.is_online);
        assert_eq!(record.status.to_string(), "offline");
    }

    #[test]
    fn test_conversation_others() {
        let conversation = Conversation {
            id: "c1".into(),
            kind: ConversationKind::Group,
            participants: vec!["a".into(), "b".into(), "c".into()],
            group_id: Some("g1".into()),
            last_message_id: None,
            last_activity: 0,
            unread_count: HashMap::new(),
        };

        let others: Vec<_> = conversation.others("b").cloned().collect();
        assert_eq!(others, vec!["a".to_string(), "c".to_string()]);
        assert!(conversation.has_participant("c"));
        assert!(!conversation.has_participant("d"));
    }
}
