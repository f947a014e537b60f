use rusqlite::Connection;
use tracing::info;

use crate::DbError;

pub fn run(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id  TEXT NOT NULL,
            sender_id        TEXT NOT NULL,
            recipient_id     TEXT NOT NULL,
            message_type     TEXT NOT NULL
                CHECK (message_type IN ('text', 'image', 'file', 'voice')),
            content          TEXT,
            attachment_url   TEXT,
            attachment_name  TEXT,
            attachment_size  INTEGER,
            attachment_mime  TEXT,
            created_at       INTEGER NOT NULL,
            is_read          INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at, id);

        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender_id, created_at, id);

        CREATE INDEX IF NOT EXISTS idx_messages_recipient
            ON messages(recipient_id, created_at, id);

        CREATE INDEX IF NOT EXISTS idx_messages_unread
            ON messages(recipient_id, is_read, sender_id);

        -- Per-participant soft delete. Rows are created lazily on first hide.
        CREATE TABLE IF NOT EXISTS conversation_visibility (
            conversation_id  TEXT NOT NULL,
            user_id          TEXT NOT NULL,
            deleted_at       INTEGER,
            PRIMARY KEY (conversation_id, user_id)
        );

        -- Local mirror of the identity provider's display data.
        CREATE TABLE IF NOT EXISTS profiles (
            user_id     TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            avatar_url  TEXT,
            updated_at  INTEGER NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
