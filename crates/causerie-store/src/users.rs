use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::mapping::ts_col;
use crate::models::UserCacheEntry;

const USER_COLS: &str =
    "id, email, first_name, last_name, avatar_url, tenant_id, tenant_role, platform_role, synced_at";

impl Database {
    /// Look up a user in the denormalized cache. `None` simply means the
    /// external sync has not seen this user; callers fall back to
    /// "Unknown".
    pub fn user_cache_get(&self, id: &str) -> Result<Option<UserCacheEntry>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLS} FROM user_cache WHERE id = ?1"),
                params![id],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Upsert a cache row. This is the surface the external sync writes
    /// through; the core itself only reads.
    pub fn user_cache_upsert(&self, entry: &UserCacheEntry) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_cache (id, email, first_name, last_name, avatar_url,
                 tenant_id, tenant_role, platform_role, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 email = excluded.email,
                 first_name = excluded.first_name,
                 last_name = excluded.last_name,
                 avatar_url = excluded.avatar_url,
                 tenant_id = excluded.tenant_id,
                 tenant_role = excluded.tenant_role,
                 platform_role = excluded.platform_role,
                 synced_at = excluded.synced_at",
            params![
                entry.id,
                entry.email,
                entry.first_name,
                entry.last_name,
                entry.avatar_url,
                entry.tenant_id,
                entry.tenant_role,
                entry.platform_role,
                entry.synced_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserCacheEntry> {
    let synced_at: String = row.get(8)?;
    Ok(UserCacheEntry {
        id: row.get(0)?,
        email: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        avatar_url: row.get(4)?,
        tenant_id: row.get(5)?,
        tenant_role: row.get(6)?,
        platform_role: row.get(7)?,
        synced_at: ts_col(8, synced_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn upsert_then_get() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.user_cache_get("u1").unwrap().is_none());

        let mut entry = UserCacheEntry {
            id: "u1".into(),
            email: Some("ada@example.com".into()),
            first_name: Some("Ada".into()),
            last_name: None,
            avatar_url: None,
            tenant_id: Some("t1".into()),
            tenant_role: Some("owner".into()),
            platform_role: None,
            synced_at: Utc::now(),
        };
        db.user_cache_upsert(&entry).unwrap();
        assert_eq!(db.user_cache_get("u1").unwrap().unwrap(), entry);

        entry.last_name = Some("Lovelace".into());
        db.user_cache_upsert(&entry).unwrap();
        let stored = db.user_cache_get("u1").unwrap().unwrap();
        assert_eq!(stored.display_name(), "Ada Lovelace");
    }
}
