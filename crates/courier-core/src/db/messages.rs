//! Message queries and the transactional message operations.

use super::{conversations, Database, OptionalExt};
use anyhow::{anyhow, Result};
use courier_protocol::{
    Attachment, Conversation, ConversationId, ConversationKind, GroupId, Message, MessageId,
    MessageKind, ReadReceipt, SyncStatus, UserId,
};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};

/// Where a new message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// A direct message; the conversation is created on first use.
    Direct(UserId),
    /// A message to an existing group conversation.
    Group(GroupId),
    /// A message to an existing conversation of either kind.
    Conversation(ConversationId),
}

/// A message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub target: MessageTarget,
    pub content: String,
    pub kind: MessageKind,
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<MessageId>,
}

/// Result of [`Database::create_message`].
#[derive(Debug)]
pub enum CreateOutcome {
    Created {
        message: Message,
        conversation: Conversation,
    },
    /// The conversation or group does not exist or the sender is not in it.
    NotFoundOrForbidden,
    /// `reply_to_id` does not name a message of the same conversation.
    InvalidReply,
}

/// Result of [`Database::mark_read`].
#[derive(Debug)]
pub enum MarkReadOutcome {
    /// Ids that received a new receipt, in request order.
    Marked(Vec<MessageId>),
    NotParticipant,
}

struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    recipient_id: Option<String>,
    group_id: Option<String>,
    content: String,
    kind: String,
    attachments: String,
    timestamp: i64,
    sync_status: String,
    is_edited: bool,
    edited_at: Option<i64>,
    reply_to_id: Option<String>,
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, recipient_id, group_id, content,
     kind, attachments, timestamp, sync_status, is_edited, edited_at, reply_to_id";

impl MessageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            recipient_id: row.get(3)?,
            group_id: row.get(4)?,
            content: row.get(5)?,
            kind: row.get(6)?,
            attachments: row.get(7)?,
            timestamp: row.get(8)?,
            sync_status: row.get(9)?,
            is_edited: row.get(10)?,
            edited_at: row.get(11)?,
            reply_to_id: row.get(12)?,
        })
    }

    fn into_message(self, read_by: Vec<ReadReceipt>) -> Result<Message> {
        Ok(Message {
            id: self.id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            group_id: self.group_id,
            conversation_id: self.conversation_id,
            content: self.content,
            kind: self.kind.parse::<MessageKind>().map_err(|e| anyhow!(e))?,
            attachments: serde_json::from_str(&self.attachments)?,
            timestamp: self.timestamp as u64,
            read_by,
            sync_status: self.sync_status.parse::<SyncStatus>().map_err(|e| anyhow!(e))?,
            is_edited: self.is_edited,
            edited_at: self.edited_at.map(|t| t as u64),
            reply_to_id: self.reply_to_id,
        })
    }
}

fn load_message(conn: &Connection, message_id: &str) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    let Some(row) = conn
        .query_row(&sql, [message_id], MessageRow::from_row)
        .optional()?
    else {
        return Ok(None);
    };

    let mut receipts = receipts_for(conn, &[message_id.to_string()])?;
    let read_by = receipts.remove(message_id).unwrap_or_default();
    Ok(Some(row.into_message(read_by)?))
}

/// Batch-fetch read receipts for a set of message ids.
fn receipts_for(conn: &Connection, message_ids: &[String]) -> Result<HashMap<String, Vec<ReadReceipt>>> {
    if message_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT message_id, user_id, read_at FROM message_reads
         WHERE message_id IN ({}) ORDER BY read_at, user_id",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let mut receipts: HashMap<String, Vec<ReadReceipt>> = HashMap::new();
    let rows = stmt.query_map(params.as_slice(), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    for row in rows {
        let (message_id, user_id, read_at) = row?;
        receipts.entry(message_id).or_default().push(ReadReceipt {
            user_id,
            read_at: read_at as u64,
        });
    }
    Ok(receipts)
}

fn next_seq(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM messages", [], |row| row.get(0))?)
}

/// Resolve the conversation of a new message.
///
/// Returns `(conversation_id, recipient_id, group_id)`, or `None` when the
/// sender may not post there.
fn resolve_target(
    conn: &Connection,
    sender_id: &str,
    target: &MessageTarget,
    now: u64,
) -> Result<Option<(String, Option<UserId>, Option<GroupId>)>> {
    match target {
        MessageTarget::Direct(recipient) => {
            let id = match conversations::find_direct(conn, sender_id, recipient)? {
                Some(id) => id,
                None => conversations::create_direct(conn, sender_id, recipient, now)?,
            };
            Ok(Some((id, Some(recipient.clone()), None)))
        }
        MessageTarget::Group(group_id) => {
            let Some(id) = conversations::find_group(conn, group_id)? else {
                return Ok(None);
            };
            if !conversations::is_participant(conn, &id, sender_id)? {
                return Ok(None);
            }
            Ok(Some((id, None, Some(group_id.clone()))))
        }
        MessageTarget::Conversation(conversation_id) => {
            let Some(conversation) = conversations::load(conn, conversation_id)? else {
                return Ok(None);
            };
            if !conversation.has_participant(sender_id) {
                return Ok(None);
            }
            match conversation.kind {
                ConversationKind::Direct => {
                    let recipient = conversation
                        .others(sender_id)
                        .next()
                        .cloned()
                        .ok_or_else(|| anyhow!("direct conversation {} has one participant", conversation.id))?;
                    Ok(Some((conversation.id, Some(recipient), None)))
                }
                ConversationKind::Group => {
                    let group_id = conversation
                        .group_id
                        .clone()
                        .ok_or_else(|| anyhow!("group conversation {} has no group id", conversation.id))?;
                    Ok(Some((conversation.id, None, Some(group_id))))
                }
            }
        }
    }
}

impl Database {
    // -- Conversations --

    /// Create the conversation of an externally managed group, or add
    /// missing participants to it. Returns the conversation.
    pub fn create_group_conversation(
        &self,
        group_id: &str,
        participants: &[UserId],
        now: u64,
    ) -> Result<Conversation> {
        self.transaction(|tx| {
            let id = match conversations::find_group(tx, group_id)? {
                Some(id) => {
                    conversations::add_participants(tx, &id, participants.iter().map(String::as_str))?;
                    id
                }
                None => conversations::create_group(tx, group_id, participants, now)?,
            };
            conversations::load(tx, &id)?.ok_or_else(|| anyhow!("conversation {} vanished", id))
        })
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.with_conn(|conn| conversations::load(conn, conversation_id))
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| conversations::is_participant(conn, conversation_id, user_id))
    }

    pub fn unread_count(&self, conversation_id: &str, user_id: &str) -> Result<Option<u32>> {
        self.with_conn(|conn| conversations::unread_count(conn, conversation_id, user_id))
    }

    /// Conversations of a user, most recently active first.
    pub fn user_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let mut result = Vec::new();
            for id in conversations::ids_for_user(conn, user_id)? {
                if let Some(conversation) = conversations::load(conn, &id)? {
                    result.push(conversation);
                }
            }
            Ok(result)
        })
    }

    // -- Messages --

    /// Insert a message, creating or resolving its conversation and updating
    /// activity and unread counters in the same transaction.
    pub fn create_message(&self, new: &NewMessage, now: u64) -> Result<CreateOutcome> {
        self.transaction(|tx| {
            let Some((conversation_id, recipient_id, group_id)) =
                resolve_target(tx, &new.sender_id, &new.target, now)?
            else {
                return Ok(CreateOutcome::NotFoundOrForbidden);
            };

            if let Some(reply_to) = &new.reply_to_id {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2",
                        [reply_to, &conversation_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Ok(CreateOutcome::InvalidReply);
                }
            }

            let id = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, recipient_id, group_id,
                     content, kind, attachments, timestamp, sync_status, reply_to_id, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    id,
                    conversation_id,
                    new.sender_id,
                    recipient_id,
                    group_id,
                    new.content,
                    new.kind.as_str(),
                    serde_json::to_string(&new.attachments)?,
                    now as i64,
                    SyncStatus::Synced.as_str(),
                    new.reply_to_id,
                    next_seq(tx)?,
                ],
            )?;

            conversations::touch(tx, &conversation_id, &id, now)?;
            conversations::increment_unread(tx, &conversation_id, &new.sender_id)?;

            let message = load_message(tx, &id)?.ok_or_else(|| anyhow!("message {} vanished", id))?;
            let conversation = conversations::load(tx, &conversation_id)?
                .ok_or_else(|| anyhow!("conversation {} vanished", conversation_id))?;

            Ok(CreateOutcome::Created {
                message,
                conversation,
            })
        })
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| load_message(conn, message_id))
    }

    /// Add read receipts for `user_id` and reset their unread counter.
    ///
    /// Ids that are duplicated, already read, or not in the conversation
    /// are skipped.
    pub fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_ids: &[MessageId],
        now: u64,
    ) -> Result<MarkReadOutcome> {
        self.transaction(|tx| {
            if !conversations::is_participant(tx, conversation_id, user_id)? {
                return Ok(MarkReadOutcome::NotParticipant);
            }

            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 SELECT id, ?2, ?3 FROM messages WHERE id = ?1 AND conversation_id = ?4",
            )?;

            let mut seen = HashSet::new();
            let mut marked = Vec::new();
            for id in message_ids {
                if !seen.insert(id.as_str()) {
                    continue;
                }
                let inserted = stmt.execute(rusqlite::params![id, user_id, now as i64, conversation_id])?;
                if inserted > 0 {
                    marked.push(id.clone());
                }
            }
            drop(stmt);

            conversations::reset_unread(tx, conversation_id, user_id)?;
            Ok(MarkReadOutcome::Marked(marked))
        })
    }

    /// Replace the content of a message owned by `user_id`.
    ///
    /// Returns `None` if the message does not exist or is not theirs.
    pub fn edit_message(
        &self,
        message_id: &str,
        user_id: &str,
        new_content: &str,
        now: u64,
    ) -> Result<Option<Message>> {
        self.transaction(|tx| {
            let updated = tx.execute(
                "UPDATE messages SET content = ?3, is_edited = 1, edited_at = ?4
                 WHERE id = ?1 AND sender_id = ?2",
                rusqlite::params![message_id, user_id, new_content, now as i64],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            load_message(tx, message_id)
        })
    }

    /// Hard-delete a message owned by `user_id`.
    ///
    /// Returns the conversation it belonged to, or `None` if the message does
    /// not exist or is not theirs.
    pub fn delete_message(&self, message_id: &str, user_id: &str) -> Result<Option<ConversationId>> {
        self.transaction(|tx| {
            let conversation_id: Option<String> = tx
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?1 AND sender_id = ?2",
                    [message_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(conversation_id) = conversation_id else {
                return Ok(None);
            };

            tx.execute("DELETE FROM messages WHERE id = ?1", [message_id])?;

            // Keep last_message_id pointing at a message that still exists.
            tx.execute(
                "UPDATE conversations SET last_message_id = (
                     SELECT id FROM messages WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT 1
                 ) WHERE id = ?1 AND last_message_id = ?2",
                [conversation_id.as_str(), message_id],
            )?;

            Ok(Some(conversation_id))
        })
    }

    /// Page through a conversation's history, newest first.
    ///
    /// Returns `None` if `user_id` is not a participant.
    pub fn conversation_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
        before: Option<&str>,
        limit: u32,
    ) -> Result<Option<Vec<Message>>> {
        self.with_conn(|conn| {
            if !conversations::is_participant(conn, conversation_id, user_id)? {
                return Ok(None);
            }

            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                   AND (?2 IS NULL OR seq < (SELECT seq FROM messages WHERE id = ?2))
                 ORDER BY seq DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, before, limit], MessageRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let mut receipts = receipts_for(conn, &ids)?;

            let messages = rows
                .into_iter()
                .map(|row| {
                    let read_by = receipts.remove(&row.id).unwrap_or_default();
                    row.into_message(read_by)
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(messages))
        })
    }
}
