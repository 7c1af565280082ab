use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use causerie_shared::types::MessageKind;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::mapping::{enum_col, opt_ts_col, opt_uuid_col, ts_col, uuid_col};
use crate::models::Message;

const MESSAGE_COLS: &str = "id, conversation_id, sender_id, content, kind, attachment_url, \
     attachment_type, attachment_name, reply_to_id, created_at, edited_at, deleted_at";

impl Database {
    /// Persist a message and its side effects in one transaction: the
    /// conversation's `updated_at` advances to the message timestamp and
    /// the sender's read watermark is bumped (the sender has read their
    /// own send).
    pub fn record_message(&mut self, message: &Message) -> Result<()> {
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, content, kind,
                 attachment_url, attachment_type, attachment_name, reply_to_id,
                 created_at, edited_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender_id,
                message.content,
                message.kind.as_str(),
                message.attachment_url,
                message.attachment_type,
                message.attachment_name,
                message.reply_to_id.map(|id| id.to_string()),
                message.created_at.to_rfc3339(),
                message.edited_at.map(|t| t.to_rfc3339()),
                message.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        tx.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1 AND updated_at < ?2",
            params![
                message.conversation_id.to_string(),
                message.created_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "UPDATE participants SET last_read_at = ?3
             WHERE conversation_id = ?1 AND user_id = ?2
               AND (last_read_at IS NULL OR last_read_at < ?3)",
            params![
                message.conversation_id.to_string(),
                message.sender_id,
                message.created_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Messages in a conversation, newest first, tombstones excluded.
    ///
    /// As with conversation listing, callers pass `limit + 1` for has-more
    /// detection.
    pub fn messages_in(
        &self,
        conversation_id: Uuid,
        limit: u32,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages
             WHERE conversation_id = ?1
               AND deleted_at IS NULL
               AND (?2 IS NULL OR created_at < ?2)
             ORDER BY created_at DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![
                conversation_id.to_string(),
                cursor.map(|c| c.to_rfc3339()),
                limit
            ],
            row_to_message,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Most recent non-deleted message, for conversation list previews.
    pub fn last_message_in(&self, conversation_id: Uuid) -> Result<Option<Message>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLS} FROM messages
                     WHERE conversation_id = ?1 AND deleted_at IS NULL
                     ORDER BY created_at DESC
                     LIMIT 1"
                ),
                params![conversation_id.to_string()],
                row_to_message,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Unread count for one participant: messages authored by others after
    /// the read watermark, tombstones excluded.
    pub fn count_unread(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1
               AND sender_id != ?2
               AND deleted_at IS NULL
               AND (?3 IS NULL OR created_at > ?3)",
            params![
                conversation_id.to_string(),
                user_id,
                since.map(|t| t.to_rfc3339())
            ],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total unread across every conversation the user participates in.
    pub fn total_unread(&self, user_id: &str) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             JOIN participants p
               ON p.conversation_id = m.conversation_id AND p.user_id = ?1
             WHERE m.sender_id != ?1
               AND m.deleted_at IS NULL
               AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// How many messages `sender_id` has sent in a conversation since a
    /// window start. Backs the per-rule daily limit.
    pub fn count_messages_since(
        &self,
        conversation_id: Uuid,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND sender_id = ?2 AND created_at >= ?3",
            params![conversation_id.to_string(), sender_id, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Soft-delete: the row stays, listings and unread counts skip it.
    pub fn tombstone_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let kind: String = row.get(4)?;
    let reply_to_id: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let edited_at: Option<String> = row.get(10)?;
    let deleted_at: Option<String> = row.get(11)?;

    Ok(Message {
        id: uuid_col(0, id)?,
        conversation_id: uuid_col(1, conversation_id)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        kind: enum_col(4, &kind, MessageKind::parse)?,
        attachment_url: row.get(5)?,
        attachment_type: row.get(6)?,
        attachment_name: row.get(7)?,
        reply_to_id: opt_uuid_col(8, reply_to_id)?,
        created_at: ts_col(9, created_at)?,
        edited_at: opt_ts_col(10, edited_at)?,
        deleted_at: opt_ts_col(11, deleted_at)?,
    })
}
