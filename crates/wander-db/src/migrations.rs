use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id                    TEXT PRIMARY KEY,
            participant_name      TEXT NOT NULL,
            participant_avatar    TEXT,
            participant_timezone  TEXT,
            last_seen             TEXT,
            subject               TEXT NOT NULL,
            status                TEXT NOT NULL DEFAULT 'active',
            last_message          TEXT,
            unread_count          INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
            deleted               INTEGER NOT NULL DEFAULT 0,
            last_message_id       INTEGER NOT NULL DEFAULT 0,
            created_at            TEXT NOT NULL,
            updated_at            TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            id               INTEGER NOT NULL,
            sender           TEXT NOT NULL,
            text             TEXT NOT NULL,
            kind             TEXT NOT NULL DEFAULT 'text',
            created_at       TEXT NOT NULL,
            PRIMARY KEY (conversation_id, id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
