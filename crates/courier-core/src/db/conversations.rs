//! Conversation queries. Free functions over a connection so they compose
//! inside a caller's transaction.

use super::OptionalExt;
use anyhow::{anyhow, Result};
use courier_protocol::{Conversation, ConversationKind, UserId};
use rusqlite::Connection;
use std::collections::HashMap;

/// Canonical key of the direct conversation between two users.
///
/// Order independent; the length prefix keeps `("a:b", "c")` and
/// `("a", "b:c")` apart.
#[must_use]
pub fn direct_key(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}|{}", first.len(), first, second)
}

pub(crate) fn find_direct(conn: &Connection, a: &str, b: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM conversations WHERE direct_key = ?1",
        [direct_key(a, b)],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn create_direct(conn: &Connection, a: &str, b: &str, now: u64) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO conversations (id, kind, direct_key, last_activity, created_at)
         VALUES (?1, 'direct', ?2, ?3, ?3)",
        rusqlite::params![id, direct_key(a, b), now as i64],
    )?;
    add_participants(conn, &id, [a, b])?;
    Ok(id)
}

pub(crate) fn find_group(conn: &Connection, group_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM conversations WHERE group_id = ?1",
        [group_id],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn create_group(
    conn: &Connection,
    group_id: &str,
    participants: &[UserId],
    now: u64,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO conversations (id, kind, group_id, last_activity, created_at)
         VALUES (?1, 'group', ?2, ?3, ?3)",
        rusqlite::params![id, group_id, now as i64],
    )?;
    add_participants(conn, &id, participants.iter().map(String::as_str))?;
    Ok(id)
}

pub(crate) fn add_participants<'a>(
    conn: &Connection,
    conversation_id: &str,
    users: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id)
         VALUES (?1, ?2)",
    )?;
    for user in users {
        stmt.execute([conversation_id, user])?;
    }
    Ok(())
}

pub(crate) fn is_participant(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id = ?2",
            [conversation_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Record a new message as the conversation's latest activity.
pub(crate) fn touch(conn: &Connection, conversation_id: &str, message_id: &str, now: u64) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET last_message_id = ?2, last_activity = ?3 WHERE id = ?1",
        rusqlite::params![conversation_id, message_id, now as i64],
    )?;
    Ok(())
}

pub(crate) fn increment_unread(conn: &Connection, conversation_id: &str, except_user: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversation_participants SET unread_count = unread_count + 1
         WHERE conversation_id = ?1 AND user_id != ?2",
        [conversation_id, except_user],
    )?;
    Ok(())
}

pub(crate) fn reset_unread(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversation_participants SET unread_count = 0
         WHERE conversation_id = ?1 AND user_id = ?2",
        [conversation_id, user_id],
    )?;
    Ok(())
}

pub(crate) fn unread_count(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<Option<u32>> {
    conn.query_row(
        "SELECT unread_count FROM conversation_participants
         WHERE conversation_id = ?1 AND user_id = ?2",
        [conversation_id, user_id],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn load(conn: &Connection, conversation_id: &str) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT id, kind, group_id, last_message_id, last_activity
             FROM conversations WHERE id = ?1",
            [conversation_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((id, kind, group_id, last_message_id, last_activity)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT user_id, unread_count FROM conversation_participants
         WHERE conversation_id = ?1 ORDER BY user_id",
    )?;
    let members = stmt
        .query_map([&id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let participants = members.iter().map(|(user, _)| user.clone()).collect();
    let unread_count: HashMap<UserId, u32> = members.into_iter().collect();

    Ok(Some(Conversation {
        id,
        kind: kind.parse::<ConversationKind>().map_err(|e| anyhow!(e))?,
        participants,
        group_id,
        last_message_id,
        last_activity: last_activity as u64,
        unread_count,
    }))
}

pub(crate) fn ids_for_user(conn: &Connection, user_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT c.id FROM conversations c
         JOIN conversation_participants p ON p.conversation_id = c.id
         WHERE p.user_id = ?1
         ORDER BY c.last_activity DESC",
    )?;
    let ids = stmt
        .query_map([user_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_direct_key_is_order_independent() {
        assert_eq!(direct_key("alice", "bob"), direct_key("bob", "alice"));
        assert_ne!(direct_key("a:b", "c"), direct_key("a", "b:c"));
    }

    #[test]
    fn test_direct_conversation_dedup() {
        let db = Database::open_in_memory().unwrap();

        db.with_conn(|conn| {
            assert!(find_direct(conn, "alice", "bob")?.is_none());
            let id = create_direct(conn, "alice", "bob", 10)?;
            assert_eq!(find_direct(conn, "bob", "alice")?, Some(id.clone()));

            let conversation = load(conn, &id)?.unwrap();
            assert_eq!(conversation.kind, ConversationKind::Direct);
            assert_eq!(conversation.participants, vec!["alice", "bob"]);
            assert_eq!(conversation.unread_count.get("bob"), Some(&0));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_unread_counters() {
        let db = Database::open_in_memory().unwrap();

        db.with_conn(|conn| {
            let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
            let id = create_group(conn, "g1", &members, 10)?;

            increment_unread(conn, &id, "a")?;
            increment_unread(conn, &id, "a")?;
            assert_eq!(unread_count(conn, &id, "a")?, Some(0));
            assert_eq!(unread_count(conn, &id, "b")?, Some(2));

            reset_unread(conn, &id, "b")?;
            assert_eq!(unread_count(conn, &id, "b")?, Some(0));
            assert_eq!(unread_count(conn, &id, "c")?, Some(2));
            assert_eq!(unread_count(conn, &id, "zed")?, None);
            Ok(())
        })
        .unwrap();
    }
}
