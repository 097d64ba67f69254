use crate::models::{ConversationRow, MessageRow, NewMessage};
use crate::Database;
use anyhow::{Result, anyhow};
use rusqlite::{Connection, Row};

impl Database {
    // -- Key/value --

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()
        })
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.kv_set_many(&[(key, value)])
    }

    /// Write several keys in one transaction: either all land or none do.
    pub fn kv_set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for (key, value) in entries {
                tx.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    (key, value),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn kv_remove_many(&self, keys: &[&str]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for key in keys {
                tx.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    // -- Conversations --

    /// Insert a conversation and its existing history in one transaction,
    /// unless a conversation with the same id exists. Returns true when the
    /// conversation was inserted; on any failure nothing is written.
    pub fn insert_conversation_with_messages(
        &self,
        row: &ConversationRow,
        messages: &[MessageRow],
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO conversations
                 (id, participant_name, participant_avatar, participant_timezone, last_seen, subject,
                  status, last_message, unread_count, deleted, last_message_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    row.id,
                    row.participant_name,
                    row.participant_avatar,
                    row.participant_timezone,
                    row.last_seen,
                    row.subject,
                    row.status,
                    row.last_message,
                    row.unread_count,
                    row.deleted,
                    row.last_message_id as i64,
                    row.created_at,
                    row.updated_at,
                ],
            )?;
            if inserted == 0 {
                return Ok(false);
            }

            for msg in messages {
                if msg.conversation_id != row.id {
                    return Err(anyhow!(
                        "Message {} belongs to {}, not {}",
                        msg.id,
                        msg.conversation_id,
                        row.id
                    ));
                }
                tx.execute(
                    "INSERT INTO messages (conversation_id, id, sender, text, kind, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        msg.conversation_id,
                        msg.id as i64,
                        msg.sender,
                        msg.text,
                        msg.kind,
                        msg.created_at,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(true)
        })
    }

    pub fn get_conversations(&self) -> Result<Vec<ConversationRow>> {
        self.with_conn(query_conversations)
    }

    /// All messages, grouped by conversation and ordered by id within each.
    pub fn get_messages(&self) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, id, sender, text, kind, created_at
                 FROM messages
                 ORDER BY conversation_id, id",
            )?;
            let rows = stmt
                .query_map([], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn set_unread_count(&self, id: &str, unread_count: u32) -> Result<()> {
        self.update_one(
            "UPDATE conversations SET unread_count = ?2 WHERE id = ?1",
            id,
            unread_count,
        )
    }

    pub fn set_deleted(&self, id: &str, deleted: bool) -> Result<()> {
        self.update_one("UPDATE conversations SET deleted = ?2 WHERE id = ?1", id, deleted)
    }

    /// Remove a conversation together with its messages.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [id])?;
            let removed = tx.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(removed == 1)
        })
    }

    /// Append a message, bumping the conversation's persisted id counter,
    /// summary, timestamp and unread counter atomically. Returns the new id.
    pub fn append_message(&self, msg: &NewMessage<'_>) -> Result<u64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let changed = tx.execute(
                "UPDATE conversations
                 SET last_message_id = last_message_id + 1,
                     last_message = ?2,
                     updated_at = ?3,
                     unread_count = unread_count + ?4
                 WHERE id = ?1",
                rusqlite::params![msg.conversation_id, msg.text, msg.created_at, msg.unread_increment],
            )?;
            if changed == 0 {
                return Err(anyhow!("Conversation not found: {}", msg.conversation_id));
            }

            let id: i64 = tx.query_row(
                "SELECT last_message_id FROM conversations WHERE id = ?1",
                [msg.conversation_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO messages (conversation_id, id, sender, text, kind, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![msg.conversation_id, id, msg.sender, msg.text, msg.kind, msg.created_at],
            )?;

            tx.commit()?;
            Ok(id as u64)
        })
    }

    fn update_one<V: rusqlite::ToSql>(&self, sql: &str, id: &str, value: V) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(sql, rusqlite::params![id, value])?;
            if changed == 0 {
                return Err(anyhow!("Conversation not found: {}", id));
            }
            Ok(())
        })
    }
}

fn query_conversations(conn: &Connection) -> Result<Vec<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, participant_name, participant_avatar, participant_timezone, last_seen, subject,
                status, last_message, unread_count, deleted, last_message_id, created_at, updated_at
         FROM conversations
         ORDER BY updated_at DESC",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(ConversationRow {
                id: row.get(0)?,
                participant_name: row.get(1)?,
                participant_avatar: row.get(2)?,
                participant_timezone: row.get(3)?,
                last_seen: row.get(4)?,
                subject: row.get(5)?,
                status: row.get(6)?,
                last_message: row.get(7)?,
                unread_count: row.get(8)?,
                deleted: row.get(9)?,
                last_message_id: row.get::<_, i64>(10)? as u64,
                created_at: row.get(11)?,
                updated_at: row.get(12)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        conversation_id: row.get(0)?,
        id: row.get::<_, i64>(1)? as u64,
        sender: row.get(2)?,
        text: row.get(3)?,
        kind: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
