use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::util::{new_id, now_rfc3339};

const INTEGRATION_COLUMNS: &str = "id, user_id, access_token, refresh_token, token_expiry, \
     calendar_id, sync_enabled, last_sync, created_at, updated_at";

fn calendar_integration_from_row(row: &Row) -> rusqlite::Result<CalendarIntegration> {
    Ok(CalendarIntegration {
        id: row.get(0)?,
        user_id: row.get(1)?,
        access_token: row.get(2)?,
        refresh_token: row.get(3)?,
        token_expiry: row.get(4)?,
        calendar_id: row.get(5)?,
        sync_enabled: row.get::<_, i32>(6)? != 0,
        last_sync: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl CrmDb {
    // =========================================================================
    // Google Calendar integration config
    // =========================================================================

    /// Store tokens from a successful OAuth exchange, keyed on `user_id`.
    ///
    /// (Re)connecting resets the row to the primary calendar with sync on and
    /// no last-sync stamp. A missing refresh token keeps the stored one.
    pub fn upsert_calendar_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: Option<&str>,
    ) -> Result<CalendarIntegration, DbError> {
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO google_calendar_integrations (
                id, user_id, access_token, refresh_token, token_expiry,
                calendar_id, sync_enabled, last_sync, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'primary', 1, NULL, ?6, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token,
                                         google_calendar_integrations.refresh_token),
                token_expiry = excluded.token_expiry,
                calendar_id = 'primary',
                sync_enabled = 1,
                last_sync = NULL,
                updated_at = excluded.updated_at",
            params![new_id(), user_id, access_token, refresh_token, token_expiry, now],
        )?;
        self.get_calendar_integration(user_id)?
            .ok_or_else(|| DbError::not_found("CalendarIntegration", user_id))
    }

    pub fn get_calendar_integration(
        &self,
        user_id: &str,
    ) -> Result<Option<CalendarIntegration>, DbError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM google_calendar_integrations WHERE user_id = ?1",
                    INTEGRATION_COLUMNS
                ),
                params![user_id],
                calendar_integration_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Write back a refreshed access token.
    pub fn update_calendar_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: Option<&str>,
    ) -> Result<(), DbError> {
        self.touch_calendar_integration(
            user_id,
            "access_token = ?2, refresh_token = COALESCE(?3, refresh_token), token_expiry = ?4",
            params![user_id, access_token, refresh_token, token_expiry],
        )
    }

    pub fn set_calendar_sync_enabled(&self, user_id: &str, enabled: bool) -> Result<(), DbError> {
        self.touch_calendar_integration(
            user_id,
            "sync_enabled = ?2",
            params![user_id, enabled as i32],
        )
    }

    pub fn set_calendar_last_sync(&self, user_id: &str, last_sync: &str) -> Result<(), DbError> {
        self.touch_calendar_integration(user_id, "last_sync = ?2", params![user_id, last_sync])
    }

    pub fn set_calendar_id(&self, user_id: &str, calendar_id: &str) -> Result<(), DbError> {
        self.touch_calendar_integration(
            user_id,
            "calendar_id = ?2",
            params![user_id, calendar_id],
        )
    }

    /// Apply `assignments` (which bind from `?2`) plus a fresh `updated_at`.
    fn touch_calendar_integration(
        &self,
        user_id: &str,
        assignments: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<(), DbError> {
        let sql = format!(
            "UPDATE google_calendar_integrations
             SET {}, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE user_id = ?1",
            assignments
        );
        let changed = self.conn.execute(&sql, args)?;
        if changed == 0 {
            return Err(DbError::not_found("CalendarIntegration", user_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_upsert_creates_primary_enabled_row() {
        let db = test_db();
        let row = db
            .upsert_calendar_tokens("u1", "access-1", Some("refresh-1"), None)
            .unwrap();
        assert_eq!(row.calendar_id, "primary");
        assert!(row.sync_enabled);
        assert!(row.last_sync.is_none());
        assert_eq!(row.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[test]
    fn test_reconnect_keeps_refresh_token_and_resets_state() {
        let db = test_db();
        db.upsert_calendar_tokens("u1", "access-1", Some("refresh-1"), None)
            .unwrap();
        db.set_calendar_id("u1", "team@group.calendar.google.com")
            .unwrap();
        db.set_calendar_last_sync("u1", "2024-06-01T12:00:00Z").unwrap();
        db.set_calendar_sync_enabled("u1", false).unwrap();

        let row = db
            .upsert_calendar_tokens("u1", "access-2", None, Some("2030-01-01T00:00:00Z"))
            .unwrap();
        assert_eq!(row.access_token, "access-2");
        assert_eq!(row.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(row.calendar_id, "primary");
        assert!(row.sync_enabled);
        assert!(row.last_sync.is_none());

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM google_calendar_integrations", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_updates_on_missing_row_are_not_found() {
        let db = test_db();
        assert!(matches!(
            db.set_calendar_sync_enabled("ghost", false),
            Err(DbError::NotFound { .. })
        ));
        assert!(db.get_calendar_integration("ghost").unwrap().is_none());
    }

    #[test]
    fn test_token_refresh_write_back() {
        let db = test_db();
        db.upsert_calendar_tokens("u1", "old", Some("refresh-1"), None)
            .unwrap();
        db.update_calendar_access_token("u1", "new", None, Some("2030-01-01T00:00:00Z"))
            .unwrap();

        let row = db.get_calendar_integration("u1").unwrap().unwrap();
        assert_eq!(row.access_token, "new");
        assert_eq!(row.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(row.token_expiry.as_deref(), Some("2030-01-01T00:00:00Z"));
    }
}
