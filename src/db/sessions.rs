use rusqlite::{params, OptionalExtension};

use super::*;
use crate::util::now_rfc3339;

impl CrmDb {
    /// Issue a bearer token for `user_id`.
    pub fn create_session(&self, user_id: &str) -> Result<String, DbError> {
        let token = format!("nvr_{}", uuid::Uuid::new_v4().simple());
        self.conn.execute(
            "INSERT INTO api_sessions (token, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, user_id, now_rfc3339()],
        )?;
        Ok(token)
    }

    pub fn user_for_token(&self, token: &str) -> Result<Option<String>, DbError> {
        let user = self
            .conn
            .query_row(
                "SELECT user_id FROM api_sessions WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user)
    }

    pub fn revoke_session(&self, token: &str) -> Result<bool, DbError> {
        let changed = self
            .conn
            .execute("DELETE FROM api_sessions WHERE token = ?1", params![token])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;

    #[test]
    fn test_session_lifecycle() {
        let db = test_db();
        let token = db.create_session("u1").unwrap();
        assert!(token.starts_with("nvr_"));
        assert_eq!(db.user_for_token(&token).unwrap().as_deref(), Some("u1"));
        assert!(db.user_for_token("nvr_unknown").unwrap().is_none());

        assert!(db.revoke_session(&token).unwrap());
        assert!(db.user_for_token(&token).unwrap().is_none());
    }
}
