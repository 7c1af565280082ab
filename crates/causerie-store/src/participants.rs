use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use causerie_shared::types::ParticipantRole;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::mapping::{enum_col, opt_ts_col, ts_col, uuid_col};
use crate::models::Participant;

const PARTICIPANT_COLS: &str =
    "conversation_id, user_id, tenant_id, role, joined_at, last_read_at";

impl Database {
    pub fn insert_participant(&self, participant: &Participant) -> Result<()> {
        self.conn().execute(
            "INSERT INTO participants (conversation_id, user_id, tenant_id, role, joined_at, last_read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                participant.conversation_id.to_string(),
                participant.user_id,
                participant.tenant_id,
                participant.role.as_str(),
                participant.joined_at.to_rfc3339(),
                participant.last_read_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn is_participant(&self, conversation_id: Uuid, user_id: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_participant(&self, conversation_id: Uuid, user_id: &str) -> Result<Participant> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {PARTICIPANT_COLS} FROM participants
                     WHERE conversation_id = ?1 AND user_id = ?2"
                ),
                params![conversation_id.to_string(), user_id],
                row_to_participant,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn participants_of(&self, conversation_id: Uuid) -> Result<Vec<Participant>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PARTICIPANT_COLS} FROM participants
             WHERE conversation_id = ?1
             ORDER BY joined_at ASC"
        ))?;
        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_participant)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn participant_user_ids(&self, conversation_id: Uuid) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM participants WHERE conversation_id = ?1")?;
        let rows = stmt.query_map(params![conversation_id.to_string()], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Every conversation id the user participates in. Used when a session
    /// connects and joins its rooms.
    pub fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<Uuid>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT conversation_id FROM participants WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| {
            let id: String = row.get(0)?;
            uuid_col(0, id)
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Advance the read watermark. Monotonic: an older timestamp never
    /// rewinds it, so the call is idempotent.
    pub fn set_last_read(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE participants SET last_read_at = ?3
             WHERE conversation_id = ?1 AND user_id = ?2
               AND (last_read_at IS NULL OR last_read_at < ?3)",
            params![conversation_id.to_string(), user_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn is_conversation_admin(&self, conversation_id: Uuid, user_id: &str) -> Result<bool> {
        match self.get_participant(conversation_id, user_id) {
            Ok(p) => Ok(matches!(
                p.role,
                ParticipantRole::Owner | ParticipantRole::Admin
            )),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let conversation_id: String = row.get(0)?;
    let role: String = row.get(3)?;
    let joined_at: String = row.get(4)?;
    let last_read_at: Option<String> = row.get(5)?;

    Ok(Participant {
        conversation_id: uuid_col(0, conversation_id)?,
        user_id: row.get(1)?,
        tenant_id: row.get(2)?,
        role: enum_col(3, &role, ParticipantRole::parse)?,
        joined_at: ts_col(4, joined_at)?,
        last_read_at: opt_ts_col(5, last_read_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use causerie_shared::types::ConversationKind;

    fn seeded() -> (Database, Uuid) {
        let mut db = Database::open_in_memory().unwrap();
        let (conv, _) = db
            .create_conversation_with_participants(
                ConversationKind::Group,
                Some("room"),
                None,
                None,
                ("u1", Some("t1")),
                &[("u2".to_string(), Some("t1".to_string()))],
                Utc::now(),
            )
            .unwrap();
        (db, conv.id)
    }

    #[test]
    fn creator_is_owner_others_member() {
        let (db, conv) = seeded();
        let participants = db.participants_of(conv).unwrap();
        assert_eq!(participants.len(), 2);

        let owner = participants.iter().find(|p| p.user_id == "u1").unwrap();
        assert_eq!(owner.role, ParticipantRole::Owner);
        let member = participants.iter().find(|p| p.user_id == "u2").unwrap();
        assert_eq!(member.role, ParticipantRole::Member);

        assert!(db.is_conversation_admin(conv, "u1").unwrap());
        assert!(!db.is_conversation_admin(conv, "u2").unwrap());
        assert!(!db.is_conversation_admin(conv, "u3").unwrap());
    }

    #[test]
    fn membership_probe() {
        let (db, conv) = seeded();
        assert!(db.is_participant(conv, "u1").unwrap());
        assert!(!db.is_participant(conv, "stranger").unwrap());
        assert_eq!(db.conversation_ids_for_user("u2").unwrap(), vec![conv]);
    }

    #[test]
    fn duplicate_participant_violates_unique() {
        let (db, conv) = seeded();
        let err = db
            .insert_participant(&Participant {
                conversation_id: conv,
                user_id: "u1".into(),
                tenant_id: None,
                role: ParticipantRole::Member,
                joined_at: Utc::now(),
                last_read_at: None,
            })
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn last_read_never_rewinds() {
        let (db, conv) = seeded();
        let early = Utc::now();
        let late = early + chrono::Duration::seconds(5);

        db.set_last_read(conv, "u1", late).unwrap();
        db.set_last_read(conv, "u1", early).unwrap();

        let p = db.get_participant(conv, "u1").unwrap();
        assert_eq!(p.last_read_at, Some(late));
    }
}
