use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use causerie_shared::types::RequestStatus;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::mapping::{opt_ts_col, ts_col, uuid_col};
use crate::models::{BlockedUser, ContactRequest};

const REQUEST_COLS: &str = "id, from_user_id, from_tenant_id, to_user_id, to_tenant_id, \
     rule_id, message, status, created_at, responded_at, expires_at";

impl Database {
    /// Insert a contact request unless a live PENDING one already exists
    /// for the same ordered pair. Returns `false` without writing when the
    /// duplicate guard fires.
    pub fn create_contact_request(&mut self, request: &ContactRequest) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;

        let duplicate: Option<String> = tx
            .query_row(
                "SELECT id FROM contact_requests
                 WHERE from_user_id = ?1 AND to_user_id = ?2
                   AND status = 'PENDING' AND expires_at > ?3
                 LIMIT 1",
                params![
                    request.from_user_id,
                    request.to_user_id,
                    Utc::now().to_rfc3339()
                ],
                |row| row.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO contact_requests (id, from_user_id, from_tenant_id, to_user_id,
                 to_tenant_id, rule_id, message, status, created_at, responded_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                request.id.to_string(),
                request.from_user_id,
                request.from_tenant_id,
                request.to_user_id,
                request.to_tenant_id,
                request.rule_id,
                request.message,
                request.status.as_str(),
                request.created_at.to_rfc3339(),
                request.responded_at.map(|t| t.to_rfc3339()),
                request.expires_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    pub fn get_contact_request(&self, id: Uuid) -> Result<ContactRequest> {
        self.conn()
            .query_row(
                &format!("SELECT {REQUEST_COLS} FROM contact_requests WHERE id = ?1"),
                params![id.to_string()],
                row_to_request,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Live (unexpired) PENDING request for the ordered pair `from → to`.
    pub fn pending_request_between(
        &self,
        from_user_id: &str,
        to_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ContactRequest>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {REQUEST_COLS} FROM contact_requests
                     WHERE from_user_id = ?1 AND to_user_id = ?2
                       AND status = 'PENDING' AND expires_at > ?3
                     LIMIT 1"
                ),
                params![from_user_id, to_user_id, now.to_rfc3339()],
                row_to_request,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Whether an ACCEPTED request links the two users, in either
    /// direction.
    pub fn accepted_request_between(&self, a: &str, b: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM contact_requests
             WHERE status = 'ACCEPTED'
               AND ((from_user_id = ?1 AND to_user_id = ?2)
                 OR (from_user_id = ?2 AND to_user_id = ?1))",
            params![a, b],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn respond_contact_request(
        &self,
        id: Uuid,
        status: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE contact_requests SET status = ?2, responded_at = ?3
             WHERE id = ?1 AND status = 'PENDING'",
            params![id.to_string(), status.as_str(), at.to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn requests_received(&self, user_id: &str) -> Result<Vec<ContactRequest>> {
        self.list_requests("to_user_id", user_id)
    }

    pub fn requests_sent(&self, user_id: &str) -> Result<Vec<ContactRequest>> {
        self.list_requests("from_user_id", user_id)
    }

    fn list_requests(&self, column: &str, user_id: &str) -> Result<Vec<ContactRequest>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REQUEST_COLS} FROM contact_requests
             WHERE {column} = ?1
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_request)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Flip stale PENDING rows to EXPIRED. Run periodically; reads already
    /// treat stale rows as expired, this just makes it durable.
    pub fn expire_stale_requests(&self, now: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE contact_requests SET status = 'EXPIRED'
             WHERE status = 'PENDING' AND expires_at <= ?1",
            params![now.to_rfc3339()],
        )?;
        Ok(affected)
    }

    // -- blocks --------------------------------------------------------

    pub fn insert_block(&self, block: &BlockedUser) -> Result<()> {
        self.conn().execute(
            "INSERT INTO blocked_users (user_id, blocked_user_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                block.user_id,
                block.blocked_user_id,
                block.reason,
                block.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn remove_block(&self, user_id: &str, blocked_user_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM blocked_users WHERE user_id = ?1 AND blocked_user_id = ?2",
            params![user_id, blocked_user_id],
        )?;
        Ok(affected > 0)
    }

    pub fn blocks_of(&self, user_id: &str) -> Result<Vec<BlockedUser>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, blocked_user_id, reason, created_at
             FROM blocked_users WHERE user_id = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_block)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Block in either direction. The record is asymmetric, the effect is
    /// symmetric.
    pub fn block_exists_between(&self, a: &str, b: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM blocked_users
             WHERE (user_id = ?1 AND blocked_user_id = ?2)
                OR (user_id = ?2 AND blocked_user_id = ?1)",
            params![a, b],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRequest> {
    let id: String = row.get(0)?;
    let status: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let responded_at: Option<String> = row.get(9)?;
    let expires_at: String = row.get(10)?;

    Ok(ContactRequest {
        id: uuid_col(0, id)?,
        from_user_id: row.get(1)?,
        from_tenant_id: row.get(2)?,
        to_user_id: row.get(3)?,
        to_tenant_id: row.get(4)?,
        rule_id: row.get(5)?,
        message: row.get(6)?,
        status: crate::mapping::enum_col(7, &status, RequestStatus::parse)?,
        created_at: ts_col(8, created_at)?,
        responded_at: opt_ts_col(9, responded_at)?,
        expires_at: ts_col(10, expires_at)?,
    })
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockedUser> {
    let created_at: String = row.get(3)?;
    Ok(BlockedUser {
        user_id: row.get(0)?,
        blocked_user_id: row.get(1)?,
        reason: row.get(2)?,
        created_at: ts_col(3, created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(from: &str, to: &str, expires_in: Duration) -> ContactRequest {
        ContactRequest {
            id: Uuid::new_v4(),
            from_user_id: from.to_string(),
            from_tenant_id: Some("t1".into()),
            to_user_id: to.to_string(),
            to_tenant_id: Some("t2".into()),
            rule_id: "cross-org-managers".into(),
            message: Some("hello".into()),
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
            expires_at: Utc::now() + expires_in,
        }
    }

    #[test]
    fn single_pending_per_ordered_pair() {
        let mut db = Database::open_in_memory().unwrap();

        assert!(db
            .create_contact_request(&request("u1", "u2", Duration::days(7)))
            .unwrap());
        // Same direction: rejected.
        assert!(!db
            .create_contact_request(&request("u1", "u2", Duration::days(7)))
            .unwrap());
        // Opposite direction: its own pair.
        assert!(db
            .create_contact_request(&request("u2", "u1", Duration::days(7)))
            .unwrap());
    }

    #[test]
    fn expired_pending_does_not_shadow() {
        let mut db = Database::open_in_memory().unwrap();

        let stale = request("u1", "u2", Duration::days(-1));
        assert!(db.create_contact_request(&stale).unwrap());

        // The stale one no longer counts as pending...
        assert!(db
            .pending_request_between("u1", "u2", Utc::now())
            .unwrap()
            .is_none());
        // ...and does not block a fresh request.
        assert!(db
            .create_contact_request(&request("u1", "u2", Duration::days(7)))
            .unwrap());

        // The sweep makes expiry durable.
        let flipped = db.expire_stale_requests(Utc::now()).unwrap();
        assert_eq!(flipped, 1);
        assert_eq!(
            db.get_contact_request(stale.id).unwrap().status,
            RequestStatus::Expired
        );
    }

    #[test]
    fn respond_and_accepted_lookup() {
        let mut db = Database::open_in_memory().unwrap();
        let req = request("u1", "u2", Duration::days(7));
        db.create_contact_request(&req).unwrap();

        assert!(!db.accepted_request_between("u1", "u2").unwrap());

        db.respond_contact_request(req.id, RequestStatus::Accepted, Utc::now())
            .unwrap();

        let stored = db.get_contact_request(req.id).unwrap();
        assert_eq!(stored.status, RequestStatus::Accepted);
        assert!(stored.responded_at.is_some());

        // Symmetric effect.
        assert!(db.accepted_request_between("u2", "u1").unwrap());

        // Responding twice hits the status guard.
        assert!(matches!(
            db.respond_contact_request(req.id, RequestStatus::Declined, Utc::now()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn request_listings() {
        let mut db = Database::open_in_memory().unwrap();
        db.create_contact_request(&request("u1", "u2", Duration::days(7)))
            .unwrap();
        db.create_contact_request(&request("u3", "u2", Duration::days(7)))
            .unwrap();

        assert_eq!(db.requests_received("u2").unwrap().len(), 2);
        assert_eq!(db.requests_sent("u1").unwrap().len(), 1);
        assert!(db.requests_received("u1").unwrap().is_empty());
    }

    #[test]
    fn blocks_are_symmetric_in_effect() {
        let db = Database::open_in_memory().unwrap();
        db.insert_block(&BlockedUser {
            user_id: "u2".into(),
            blocked_user_id: "u1".into(),
            reason: Some("spam".into()),
            created_at: Utc::now(),
        })
        .unwrap();

        assert!(db.block_exists_between("u1", "u2").unwrap());
        assert!(db.block_exists_between("u2", "u1").unwrap());

        // Duplicate insert violates the primary key.
        let err = db
            .insert_block(&BlockedUser {
                user_id: "u2".into(),
                blocked_user_id: "u1".into(),
                reason: None,
                created_at: Utc::now(),
            })
            .unwrap_err();
        assert!(err.is_unique_violation());

        assert!(db.remove_block("u2", "u1").unwrap());
        assert!(!db.remove_block("u2", "u1").unwrap());
        assert!(!db.block_exists_between("u1", "u2").unwrap());
    }
}
