use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use causerie_shared::types::{ConversationKind, ParticipantRole};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::mapping::{enum_col, ts_col, uuid_col};
use crate::models::Conversation;

const CONVERSATION_COLS: &str = "id, kind, name, description, avatar_url, created_at, updated_at";

impl Database {
    /// The unique DIRECT conversation whose participant set equals `{a, b}`.
    pub fn find_direct_conversation(&self, a: &str, b: &str) -> Result<Option<Conversation>> {
        find_direct_on(self.conn(), a, b)
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Conversations the user participates in, newest `updated_at` first.
    ///
    /// Fetches `limit` rows after the cursor; callers pass `limit + 1` to
    /// detect a further page.
    pub fn conversations_for_user(
        &self,
        user_id: &str,
        limit: u32,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLS} FROM conversations c
             JOIN participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1
               AND (?2 IS NULL OR c.updated_at < ?2)
             ORDER BY c.updated_at DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![user_id, cursor.map(|c| c.to_rfc3339()), limit],
            row_to_conversation,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Create a conversation together with its participant rows in one
    /// transaction.
    ///
    /// For DIRECT pairs the transaction first probes for an existing
    /// conversation and returns it unchanged (idempotent create). A
    /// concurrent creator racing us to the unique participant index is
    /// handled by re-reading and returning the winner instead of
    /// surfacing the conflict.
    #[allow(clippy::too_many_arguments)]
    pub fn create_conversation_with_participants(
        &mut self,
        kind: ConversationKind,
        name: Option<&str>,
        description: Option<&str>,
        avatar_url: Option<&str>,
        creator: (&str, Option<&str>),
        others: &[(String, Option<String>)],
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        let tx = self.conn_mut().transaction()?;

        if kind == ConversationKind::Direct && others.len() == 1 {
            if let Some(existing) = find_direct_on(&tx, creator.0, &others[0].0)? {
                tx.commit()?;
                return Ok((existing, false));
            }
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind,
            name: name.map(str::to_string),
            description: description.map(str::to_string),
            avatar_url: avatar_url.map(str::to_string),
            created_at: now,
            updated_at: now,
        };

        let inserted: Result<()> = (|| {
            tx.execute(
                "INSERT INTO conversations (id, kind, name, description, avatar_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    conversation.id.to_string(),
                    conversation.kind.as_str(),
                    conversation.name,
                    conversation.description,
                    conversation.avatar_url,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;

            tx.execute(
                "INSERT INTO participants (conversation_id, user_id, tenant_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation.id.to_string(),
                    creator.0,
                    creator.1,
                    ParticipantRole::Owner.as_str(),
                    now.to_rfc3339(),
                ],
            )?;

            for (user_id, tenant_id) in others {
                tx.execute(
                    "INSERT INTO participants (conversation_id, user_id, tenant_id, role, joined_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        conversation.id.to_string(),
                        user_id,
                        tenant_id,
                        ParticipantRole::Member.as_str(),
                        now.to_rfc3339(),
                    ],
                )?;
            }
            Ok(())
        })();

        match inserted {
            Ok(()) => {
                tx.commit()?;
                Ok((conversation, true))
            }
            Err(e)
                if e.is_unique_violation()
                    && kind == ConversationKind::Direct
                    && others.len() == 1 =>
            {
                // A concurrent create won the race; read back the winner.
                drop(tx);
                match self.find_direct_conversation(creator.0, &others[0].0)? {
                    Some(winner) => Ok((winner, false)),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a conversation; participants and messages cascade.
    pub fn delete_conversation(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

fn find_direct_on(conn: &Connection, a: &str, b: &str) -> Result<Option<Conversation>> {
    conn.query_row(
        &format!(
            "SELECT {CONVERSATION_COLS} FROM conversations c
             WHERE c.kind = 'DIRECT'
               AND EXISTS (SELECT 1 FROM participants p
                           WHERE p.conversation_id = c.id AND p.user_id = ?1)
               AND EXISTS (SELECT 1 FROM participants p
                           WHERE p.conversation_id = c.id AND p.user_id = ?2)
               AND (SELECT COUNT(*) FROM participants p
                    WHERE p.conversation_id = c.id) = 2
             LIMIT 1"
        ),
        params![a, b],
        row_to_conversation,
    )
    .optional()
    .map_err(StoreError::Sqlite)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(Conversation {
        id: uuid_col(0, id)?,
        kind: enum_col(1, &kind, ConversationKind::parse)?,
        name: row.get(2)?,
        description: row.get(3)?,
        avatar_url: row.get(4)?,
        created_at: ts_col(5, created_at)?,
        updated_at: ts_col(6, updated_at)?,
    })
}
