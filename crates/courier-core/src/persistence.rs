//! Message persistence service.
//!
//! Async front for the SQLite layer. Requests are validated here, the
//! blocking work runs on Tokio's blocking pool, and storage failures are
//! logged with their cause and reported as a generic [`Error::Persistence`].

use crate::db::messages::{CreateOutcome, MarkReadOutcome};
use crate::db::Database;
use crate::error::{Error, Result};
use courier_protocol::{
    unix_millis, Conversation, ConversationId, Message, MessageId, SendMessage, UserId,
};
use std::sync::Arc;
use tracing::{debug, error};

pub use crate::db::messages::{MessageTarget, NewMessage};

/// Longest accepted message body, in characters.
pub const MAX_CONTENT_LENGTH: usize = 10_000;

/// Most message ids accepted by one `mark_read`.
pub const MAX_READ_BATCH: usize = 500;

/// Default and maximum page size of [`MessagePersistenceService::conversation_messages`].
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 200;

fn validate_content(content: &str, has_attachments: bool) -> Result<()> {
    if content.trim().is_empty() && !has_attachments {
        return Err(Error::Validation("Message content is required".into()));
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(Error::Validation(format!(
            "Message content exceeds {} characters",
            MAX_CONTENT_LENGTH
        )));
    }
    Ok(())
}

/// Turn a `send_message` payload into a [`NewMessage`].
///
/// # Errors
///
/// Returns [`Error::Validation`] unless exactly one target is set, the
/// content is acceptable, and a direct message is not addressed to the
/// sender.
pub fn new_message(sender_id: &str, request: SendMessage) -> Result<NewMessage> {
    let target = match (request.recipient_id, request.group_id, request.conversation_id) {
        (Some(recipient), None, None) => {
            if recipient.is_empty() {
                return Err(Error::Validation("recipient_id must not be empty".into()));
            }
            if recipient == sender_id {
                return Err(Error::Validation("Cannot send a direct message to yourself".into()));
            }
            MessageTarget::Direct(recipient)
        }
        (None, Some(group), None) => MessageTarget::Group(group),
        (None, None, Some(conversation)) => MessageTarget::Conversation(conversation),
        _ => {
            return Err(Error::Validation(
                "Exactly one of recipient_id, group_id or conversation_id is required".into(),
            ))
        }
    };

    validate_content(&request.content, !request.attachments.is_empty())?;

    Ok(NewMessage {
        sender_id: sender_id.to_string(),
        target,
        content: request.content,
        kind: request.kind,
        attachments: request.attachments,
        reply_to_id: request.reply_to_id,
    })
}

/// Persists messages, conversations and read receipts.
#[derive(Clone)]
pub struct MessagePersistenceService {
    db: Arc<Database>,
}

impl MessagePersistenceService {
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Run `f` on the blocking pool. `operation` names the failure reported
    /// to the client.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        match tokio::task::spawn_blocking(move || f(&db)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(operation, error = ?e, "Persistence failure");
                Err(Error::Persistence(operation))
            }
            Err(e) => {
                error!(operation, error = %e, "Persistence task failed");
                Err(Error::Persistence(operation))
            }
        }
    }

    /// Store a message and update its conversation.
    ///
    /// # Errors
    ///
    /// [`Error::NotFoundOrForbidden`] if the target conversation or group is
    /// unknown or the sender is not a participant, [`Error::Validation`] for
    /// a bad `reply_to_id`, [`Error::Persistence`] on storage failure.
    pub async fn create_message(&self, new: NewMessage) -> Result<(Message, Conversation)> {
        let outcome = self
            .run("send message", move |db| db.create_message(&new, unix_millis()))
            .await?;

        match outcome {
            CreateOutcome::Created {
                message,
                conversation,
            } => {
                debug!(
                    message = %message.id,
                    conversation = %conversation.id,
                    sender = %message.sender_id,
                    "Message persisted"
                );
                Ok((message, conversation))
            }
            CreateOutcome::NotFoundOrForbidden => Err(Error::NotFoundOrForbidden("Conversation")),
            CreateOutcome::InvalidReply => Err(Error::Validation(
                "reply_to_id must reference a message in the same conversation".into(),
            )),
        }
    }

    /// Mark messages read for `user_id`.
    ///
    /// Returns the ids that were newly marked and the read timestamp.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an empty or oversized batch,
    /// [`Error::NotFoundOrForbidden`] if the user is not a participant.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_ids: Vec<MessageId>,
    ) -> Result<(Vec<MessageId>, u64)> {
        if message_ids.is_empty() {
            return Err(Error::Validation("message_ids must not be empty".into()));
        }
        if message_ids.len() > MAX_READ_BATCH {
            return Err(Error::Validation(format!(
                "At most {} message ids per request",
                MAX_READ_BATCH
            )));
        }

        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        let now = unix_millis();
        let outcome = self
            .run("mark messages read", move |db| {
                db.mark_read(&conversation_id, &user_id, &message_ids, now)
            })
            .await?;

        match outcome {
            MarkReadOutcome::Marked(marked) => Ok((marked, now)),
            MarkReadOutcome::NotParticipant => Err(Error::NotFoundOrForbidden("Conversation")),
        }
    }

    /// Edit one of the user's messages.
    ///
    /// # Errors
    ///
    /// [`Error::NotFoundOrForbidden`] whether the message is missing or owned
    /// by someone else.
    pub async fn edit_message(&self, message_id: &str, user_id: &str, new_content: String) -> Result<Message> {
        validate_content(&new_content, false)?;

        let message_id = message_id.to_string();
        let user_id = user_id.to_string();
        self.run("edit message", move |db| {
            db.edit_message(&message_id, &user_id, &new_content, unix_millis())
        })
        .await?
        .ok_or(Error::NotFoundOrForbidden("Message"))
    }

    /// Delete one of the user's messages.
    ///
    /// # Errors
    ///
    /// Same policy as [`Self::edit_message`].
    pub async fn delete_message(&self, message_id: &str, user_id: &str) -> Result<(MessageId, ConversationId)> {
        let id = message_id.to_string();
        let user_id = user_id.to_string();
        let conversation_id = self
            .run("delete message", move |db| db.delete_message(&id, &user_id))
            .await?
            .ok_or(Error::NotFoundOrForbidden("Message"))?;
        Ok((message_id.to_string(), conversation_id))
    }

    /// Create (or extend) the conversation of a group.
    pub async fn create_group_conversation(&self, group_id: &str, participants: Vec<UserId>) -> Result<Conversation> {
        if group_id.is_empty() || participants.is_empty() {
            return Err(Error::Validation("A group needs an id and participants".into()));
        }
        let group_id = group_id.to_string();
        self.run("create conversation", move |db| {
            db.create_group_conversation(&group_id, &participants, unix_millis())
        })
        .await
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let id = conversation_id.to_string();
        self.run("load conversation", move |db| db.get_conversation(&id))
            .await
    }

    pub async fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        let id = conversation_id.to_string();
        let user_id = user_id.to_string();
        self.run("load conversation", move |db| db.is_participant(&id, &user_id))
            .await
    }

    /// A page of history, newest first, ending before `before` if given.
    ///
    /// # Errors
    ///
    /// [`Error::NotFoundOrForbidden`] if the user is not a participant.
    pub async fn conversation_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
        before: Option<MessageId>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        let id = conversation_id.to_string();
        let user_id = user_id.to_string();
        self.run("load messages", move |db| {
            db.conversation_messages(&id, &user_id, before.as_deref(), limit)
        })
        .await?
        .ok_or(Error::NotFoundOrForbidden("Conversation"))
    }

    pub async fn user_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let user_id = user_id.to_string();
        self.run("load conversations", move |db| db.user_conversations(&user_id))
            .await
    }

    /// Unread count of the user in the conversation.
    ///
    /// # Errors
    ///
    /// [`Error::NotFoundOrForbidden`] if the user is not a participant.
    pub async fn unread_count(&self, conversation_id: &str, user_id: &str) -> Result<u32> {
        let id = conversation_id.to_string();
        let user_id = user_id.to_string();
        self.run("load conversation", move |db| db.unread_count(&id, &user_id))
            .await?
            .ok_or(Error::NotFoundOrForbidden("Conversation"))
    }
}
