use std::collections::BTreeMap;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::*;
use crate::util::{new_id, now_rfc3339};

const NOTIFICATION_COLUMNS: &str = "id, user_id, title, message, type, category, priority, \
     read, action_url, action_label, metadata, expires_at, created_at, updated_at";

fn notification_from_row(row: &Row) -> rusqlite::Result<Notification> {
    let metadata: String = row.get(10)?;
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        message: row.get(3)?,
        notification_type: row.get(4)?,
        category: row.get(5)?,
        priority: row.get(6)?,
        read: row.get::<_, i32>(7)? != 0,
        action_url: row.get(8)?,
        action_label: row.get(9)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        expires_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn template_from_row(row: &Row) -> rusqlite::Result<NotificationTemplate> {
    let variables: String = row.get(9)?;
    Ok(NotificationTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        title_template: row.get(2)?,
        message_template: row.get(3)?,
        notification_type: row.get(4)?,
        category: row.get(5)?,
        priority: row.get(6)?,
        action_url_template: row.get(7)?,
        action_label: row.get(8)?,
        variables: serde_json::from_str(&variables).unwrap_or_default(),
        active: row.get::<_, i32>(10)? != 0,
    })
}

fn preferences_from_row(row: &Row) -> rusqlite::Result<NotificationPreferences> {
    let categories: String = row.get(4)?;
    let mut parsed: BTreeMap<NotificationCategory, ChannelToggles> =
        serde_json::from_str(&categories).unwrap_or_default();
    // Categories added after the row was written get the all-on default.
    for category in NotificationCategory::ALL {
        parsed.entry(*category).or_default();
    }
    Ok(NotificationPreferences {
        user_id: row.get(0)?,
        email_enabled: row.get::<_, i32>(1)? != 0,
        push_enabled: row.get::<_, i32>(2)? != 0,
        in_app_enabled: row.get::<_, i32>(3)? != 0,
        categories: parsed,
        quiet_hours_start: row.get(5)?,
        quiet_hours_end: row.get(6)?,
        timezone: row.get(7)?,
    })
}

impl CrmDb {
    // =========================================================================
    // Notifications
    // =========================================================================

    pub fn insert_notification(&self, input: &NewNotification) -> Result<Notification, DbError> {
        let id = new_id();
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO notifications (id, user_id, title, message, type, category, priority,
                                        read, action_url, action_label, metadata, expires_at,
                                        created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                id,
                input.user_id,
                input.title,
                input.message,
                input.notification_type,
                input.category,
                input.priority,
                input.action_url,
                input.action_label,
                serde_json::to_string(&input.metadata)?,
                input.expires_at,
                now,
            ],
        )?;
        self.get_notification(&id)?
            .ok_or_else(|| DbError::not_found("Notification", id))
    }

    pub fn get_notification(&self, id: &str) -> Result<Option<Notification>, DbError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS),
                params![id],
                notification_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Newest first. `total` counts every match regardless of paging; an
    /// offset without a limit pages by 10.
    pub fn list_notifications(
        &self,
        user_id: &str,
        query: &NotificationQuery,
    ) -> Result<NotificationPage, DbError> {
        let mut clause = String::from(" WHERE user_id = ?");
        let mut args = vec![Value::Text(user_id.to_string())];
        if query.unread_only {
            clause.push_str(" AND read = 0");
        }
        if let Some(category) = query.category {
            clause.push_str(" AND category = ?");
            args.push(Value::Text(category.as_str().to_string()));
        }
        if let Some(kind) = query.notification_type {
            clause.push_str(" AND type = ?");
            args.push(Value::Text(kind.as_str().to_string()));
        }

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM notifications{}", clause),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let limit = match (query.limit, query.offset) {
            (Some(limit), _) => i64::from(limit),
            (None, Some(_)) => 10,
            (None, None) => -1,
        };
        let offset = i64::from(query.offset.unwrap_or(0));
        args.push(Value::Integer(limit));
        args.push(Value::Integer(offset));

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM notifications{} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
            NOTIFICATION_COLUMNS, clause
        ))?;
        let rows = stmt.query_map(params_from_iter(args), notification_from_row)?;

        Ok(NotificationPage {
            notifications: collect_rows(rows)?,
            total: total.max(0) as u64,
        })
    }

    pub fn mark_notification_read(&self, id: &str) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE notifications SET read = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_all_notifications_read(&self, user_id: &str) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            "UPDATE notifications SET read = 1, updated_at = ?2 WHERE user_id = ?1 AND read = 0",
            params![user_id, now_rfc3339()],
        )?;
        Ok(changed)
    }

    pub fn delete_notification(&self, id: &str) -> Result<bool, DbError> {
        let changed = self
            .conn
            .execute("DELETE FROM notifications WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn unread_notification_count(&self, user_id: &str) -> Result<u64, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read = 0",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Delete notifications whose `expires_at` is before `now` (RFC 3339).
    pub fn delete_expired_notifications(&self, now: &str) -> Result<usize, DbError> {
        let changed = self.conn.execute(
            "DELETE FROM notifications
             WHERE expires_at IS NOT NULL AND julianday(expires_at) < julianday(?1)",
            params![now],
        )?;
        Ok(changed)
    }

    /// Whether a notification from `template_name` already carries
    /// `variables.<key> = value` for this user.
    pub fn template_notification_exists(
        &self,
        user_id: &str,
        template_name: &str,
        key: &str,
        value: &str,
    ) -> Result<bool, DbError> {
        let path = format!("$.variables.{}", key);
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM notifications
                WHERE user_id = ?1
                  AND json_extract(metadata, '$.template_name') = ?2
                  AND json_extract(metadata, ?3) = ?4
             )",
            params![user_id, template_name, path, value],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub fn get_active_template(&self, name: &str) -> Result<Option<NotificationTemplate>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, title_template, message_template, type, category, priority,
                        action_url_template, action_label, variables, active
                 FROM notification_templates WHERE name = ?1 AND active = 1",
                params![name],
                template_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or replace a template by name.
    pub fn upsert_template(&self, template: &NotificationTemplate) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO notification_templates (
                id, name, title_template, message_template, type, category, priority,
                action_url_template, action_label, variables, active, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(name) DO UPDATE SET
                title_template = excluded.title_template,
                message_template = excluded.message_template,
                type = excluded.type,
                category = excluded.category,
                priority = excluded.priority,
                action_url_template = excluded.action_url_template,
                action_label = excluded.action_label,
                variables = excluded.variables,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                template.id,
                template.name,
                template.title_template,
                template.message_template,
                template.notification_type,
                template.category,
                template.priority,
                template.action_url_template,
                template.action_label,
                serde_json::to_string(&template.variables)?,
                template.active as i32,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    pub fn get_notification_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<NotificationPreferences>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, email_enabled, push_enabled, in_app_enabled, categories,
                        quiet_hours_start, quiet_hours_end, timezone
                 FROM notification_preferences WHERE user_id = ?1",
                params![user_id],
                preferences_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_notification_preferences(
        &self,
        prefs: &NotificationPreferences,
    ) -> Result<(), DbError> {
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO notification_preferences (
                id, user_id, email_enabled, push_enabled, in_app_enabled, categories,
                quiet_hours_start, quiet_hours_end, timezone, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(user_id) DO UPDATE SET
                email_enabled = excluded.email_enabled,
                push_enabled = excluded.push_enabled,
                in_app_enabled = excluded.in_app_enabled,
                categories = excluded.categories,
                quiet_hours_start = excluded.quiet_hours_start,
                quiet_hours_end = excluded.quiet_hours_end,
                timezone = excluded.timezone,
                updated_at = excluded.updated_at",
            params![
                new_id(),
                prefs.user_id,
                prefs.email_enabled as i32,
                prefs.push_enabled as i32,
                prefs.in_app_enabled as i32,
                serde_json::to_string(&prefs.categories)?,
                prefs.quiet_hours_start,
                prefs.quiet_hours_end,
                prefs.timezone,
                now,
            ],
        )?;
        Ok(())
    }
}
