use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::*;
use crate::util::{new_id, now_rfc3339};

const INTEGRATION_COLUMNS: &str =
    "id, user_id, name, type, config, status, created_at, updated_at";

fn json_column(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn integration_from_row(row: &Row) -> rusqlite::Result<Integration> {
    let config: String = row.get(4)?;
    Ok(Integration {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        kind: row.get(3)?,
        config: serde_json::from_str(&config).unwrap_or_else(|_| serde_json::json!({})),
        status: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn log_from_row(row: &Row) -> rusqlite::Result<IntegrationLog> {
    Ok(IntegrationLog {
        id: row.get(0)?,
        integration_id: row.get(1)?,
        action: row.get(2)?,
        status: row.get(3)?,
        request_data: json_column(row.get(4)?),
        response_data: json_column(row.get(5)?),
        error_message: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl CrmDb {
    pub fn create_integration(
        &self,
        user_id: &str,
        input: &NewIntegration,
    ) -> Result<Integration, DbError> {
        let id = new_id();
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO integrations (id, user_id, name, type, config, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                user_id,
                input.name,
                input.kind,
                serde_json::to_string(&input.config)?,
                input.status,
                now,
            ],
        )?;
        self.get_integration(&id)
    }

    pub fn get_integration(&self, id: &str) -> Result<Integration, DbError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM integrations WHERE id = ?1", INTEGRATION_COLUMNS),
                params![id],
                integration_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::not_found("Integration", id))
    }

    /// Newest first, optionally narrowed by type and status.
    pub fn list_integrations(
        &self,
        user_id: &str,
        kind: Option<IntegrationKind>,
        status: Option<IntegrationStatus>,
    ) -> Result<Vec<Integration>, DbError> {
        let mut sql = format!(
            "SELECT {} FROM integrations WHERE user_id = ?",
            INTEGRATION_COLUMNS
        );
        let mut args = vec![Value::Text(user_id.to_string())];
        if let Some(kind) = kind {
            sql.push_str(" AND type = ?");
            args.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), integration_from_row)?;
        collect_rows(rows)
    }

    pub fn set_integration_status(
        &self,
        id: &str,
        status: IntegrationStatus,
    ) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "UPDATE integrations SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status, now_rfc3339()],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Integration", id));
        }
        Ok(())
    }

    pub fn delete_integration(&self, user_id: &str, id: &str) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "DELETE FROM integrations WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Integration", id));
        }
        Ok(())
    }

    // =========================================================================
    // Integration logs
    // =========================================================================

    pub fn insert_integration_log(
        &self,
        integration_id: &str,
        action: &str,
        status: LogStatus,
        request_data: Option<&serde_json::Value>,
        response_data: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<String, DbError> {
        let id = new_id();
        self.conn.execute(
            "INSERT INTO integration_logs (id, integration_id, action, status, request_data,
                                           response_data, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                integration_id,
                action,
                status,
                request_data.map(|v| v.to_string()),
                response_data.map(|v| v.to_string()),
                error_message,
                now_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Most recent first.
    pub fn list_integration_logs(
        &self,
        integration_id: &str,
        limit: u32,
    ) -> Result<Vec<IntegrationLog>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, integration_id, action, status, request_data, response_data,
                    error_message, created_at
             FROM integration_logs WHERE integration_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![integration_id, limit], log_from_row)?;
        collect_rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    fn webhook(db: &CrmDb, user: &str, status: &str) -> Integration {
        let input = NewIntegration::parse(
            Some("Hook"),
            Some("webhook"),
            Some(serde_json::json!({"url": "https://hooks.exemplo.com/crm"})),
            Some(status),
        )
        .unwrap();
        db.create_integration(user, &input).unwrap()
    }

    #[test]
    fn test_create_and_filter_integrations() {
        let db = test_db();
        let active = webhook(&db, "u1", "active");
        webhook(&db, "u1", "inactive");
        webhook(&db, "u2", "active");

        assert_eq!(active.config_str("url"), Some("https://hooks.exemplo.com/crm"));
        assert_eq!(db.list_integrations("u1", None, None).unwrap().len(), 2);

        let only_active = db
            .list_integrations("u1", Some(IntegrationKind::Webhook), Some(IntegrationStatus::Active))
            .unwrap();
        assert_eq!(only_active.len(), 1);
        assert_eq!(only_active[0].id, active.id);
    }

    #[test]
    fn test_logs_round_trip_json_and_order() {
        let db = test_db();
        let hook = webhook(&db, "u1", "active");

        db.insert_integration_log(
            &hook.id,
            "webhook",
            LogStatus::Success,
            Some(&serde_json::json!({"event": "lead.created"})),
            Some(&serde_json::json!({"status": 200})),
            None,
        )
        .unwrap();
        db.insert_integration_log(&hook.id, "webhook", LogStatus::Error, None, None, Some("timeout"))
            .unwrap();

        let logs = db.list_integration_logs(&hook.id, 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status, LogStatus::Error);
        assert_eq!(logs[0].error_message.as_deref(), Some("timeout"));
        assert_eq!(
            logs[1].request_data,
            Some(serde_json::json!({"event": "lead.created"}))
        );
    }

    #[test]
    fn test_status_change_and_delete() {
        let db = test_db();
        let hook = webhook(&db, "u1", "active");
        db.set_integration_status(&hook.id, IntegrationStatus::Error)
            .unwrap();
        assert_eq!(
            db.get_integration(&hook.id).unwrap().status,
            IntegrationStatus::Error
        );

        assert!(db.delete_integration("u2", &hook.id).is_err());
        db.delete_integration("u1", &hook.id).unwrap();
        assert!(db.get_integration(&hook.id).is_err());
    }
}
