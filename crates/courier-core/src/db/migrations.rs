use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            kind            TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
            direct_key      TEXT UNIQUE,
            group_id        TEXT UNIQUE,
            last_message_id TEXT,
            last_activity   INTEGER NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            user_id         TEXT NOT NULL,
            unread_count    INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON conversation_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            sender_id       TEXT NOT NULL,
            recipient_id    TEXT,
            group_id        TEXT,
            content         TEXT NOT NULL,
            kind            TEXT NOT NULL,
            attachments     TEXT NOT NULL DEFAULT '[]',
            timestamp       INTEGER NOT NULL,
            sync_status     TEXT NOT NULL DEFAULT 'synced',
            is_edited       INTEGER NOT NULL DEFAULT 0,
            edited_at       INTEGER,
            reply_to_id     TEXT,
            seq             INTEGER NOT NULL,
            CHECK ((recipient_id IS NULL) <> (group_id IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            read_at     INTEGER NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS kv_lists (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_kv_lists_key
            ON kv_lists(key, seq);

        CREATE TABLE IF NOT EXISTS kv_list_expiry (
            key         TEXT PRIMARY KEY,
            expires_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv_records (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            expires_at  INTEGER NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
