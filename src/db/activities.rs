use std::collections::HashSet;

use chrono::NaiveDateTime;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::*;
use crate::util::{new_id, now_rfc3339};

const ACTIVITY_COLUMNS: &str = "id, user_id, title, description, type, status, due_date, \
     contact_id, deal_id, google_event_id, created_at, updated_at";

fn activity_from_row(row: &Row) -> rusqlite::Result<Activity> {
    let due_date: Option<String> = row.get(6)?;
    Ok(Activity {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        activity_type: row.get(4)?,
        status: row.get(5)?,
        // Unparseable dates are treated as undated rather than failing the row.
        due_date: due_date.and_then(|d| parse_due_date(&d).ok()),
        contact_id: row.get(7)?,
        deal_id: row.get(8)?,
        google_event_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl CrmDb {
    pub fn create_activity(
        &self,
        user_id: &str,
        input: &NewActivity,
    ) -> Result<Activity, DbError> {
        input.validate()?;
        self.ensure_activity_links(user_id, input.contact_id.as_deref(), input.deal_id.as_deref())?;

        let id = new_id();
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO activities (id, user_id, title, description, type, status, due_date,
                                     contact_id, deal_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                user_id,
                input.title.trim(),
                input.description,
                input.activity_type,
                input.status.unwrap_or(ActivityStatus::Pending),
                input.due_date.as_ref().map(format_due_date),
                input.contact_id,
                input.deal_id,
                now,
            ],
        )?;
        self.get_activity(user_id, &id)
    }

    pub fn get_activity(&self, user_id: &str, id: &str) -> Result<Activity, DbError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM activities WHERE id = ?1 AND user_id = ?2",
                    ACTIVITY_COLUMNS
                ),
                params![id, user_id],
                activity_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::not_found("Activity", id))
    }

    /// Soonest due first; undated activities last.
    pub fn list_activities(
        &self,
        user_id: &str,
        filter: &ActivityFilter,
    ) -> Result<Vec<Activity>, DbError> {
        let mut sql = format!("SELECT {} FROM activities WHERE user_id = ?", ACTIVITY_COLUMNS);
        let mut args = vec![Value::Text(user_id.to_string())];
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(kind) = filter.activity_type {
            sql.push_str(" AND type = ?");
            args.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(contact_id) = filter.contact_id.as_deref() {
            sql.push_str(" AND contact_id = ?");
            args.push(Value::Text(contact_id.to_string()));
        }
        if let Some(deal_id) = filter.deal_id.as_deref() {
            sql.push_str(" AND deal_id = ?");
            args.push(Value::Text(deal_id.to_string()));
        }
        if let Some(title) = filter.title.as_deref().filter(|s| !s.trim().is_empty()) {
            sql.push_str(" AND LOWER(title) LIKE ?");
            args.push(Value::Text(like_pattern(title)));
        }
        if let Some(after) = filter.due_after {
            sql.push_str(" AND due_date >= ?");
            args.push(Value::Text(format_due_date(&after)));
        }
        if let Some(before) = filter.due_before {
            sql.push_str(" AND due_date <= ?");
            args.push(Value::Text(format_due_date(&before)));
        }
        sql.push_str(" ORDER BY due_date IS NULL, due_date ASC, created_at ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), activity_from_row)?;
        collect_rows(rows)
    }

    pub fn update_activity(
        &self,
        user_id: &str,
        id: &str,
        update: &ActivityUpdate,
    ) -> Result<Activity, DbError> {
        if let Some(title) = update.title.as_deref() {
            if title.trim().is_empty() {
                return Err(DbError::Validation("Title cannot be empty".to_string()));
            }
        }
        self.ensure_activity_links(user_id, update.contact_id.as_deref(), update.deal_id.as_deref())?;

        let changed = self.conn.execute(
            "UPDATE activities SET
                title = COALESCE(?3, title),
                description = COALESCE(?4, description),
                type = COALESCE(?5, type),
                status = COALESCE(?6, status),
                due_date = COALESCE(?7, due_date),
                contact_id = COALESCE(?8, contact_id),
                deal_id = COALESCE(?9, deal_id),
                updated_at = ?10
             WHERE id = ?1 AND user_id = ?2",
            params![
                id,
                user_id,
                update.title,
                update.description,
                update.activity_type,
                update.status,
                update.due_date.as_ref().map(format_due_date),
                update.contact_id,
                update.deal_id,
                now_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Activity", id));
        }
        self.get_activity(user_id, id)
    }

    pub fn set_activity_status(
        &self,
        user_id: &str,
        id: &str,
        status: ActivityStatus,
    ) -> Result<Activity, DbError> {
        self.update_activity(
            user_id,
            id,
            &ActivityUpdate {
                status: Some(status),
                ..Default::default()
            },
        )
    }

    pub fn delete_activity(&self, user_id: &str, id: &str) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "DELETE FROM activities WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Activity", id));
        }
        Ok(())
    }

    // =========================================================================
    // Calendar link
    // =========================================================================

    /// Record the external event created for an activity.
    ///
    /// Only links activities that are still unlinked; returns false when the
    /// activity was linked in the meantime.
    pub fn link_activity_event(
        &self,
        user_id: &str,
        id: &str,
        google_event_id: &str,
    ) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE activities SET google_event_id = ?3, updated_at = ?4
             WHERE id = ?1 AND user_id = ?2
               AND (google_event_id IS NULL OR google_event_id = '')",
            params![id, user_id, google_event_id, now_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Dated activities without an external event, oldest due first.
    pub fn unlinked_dated_activities(&self, user_id: &str) -> Result<Vec<Activity>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM activities
             WHERE user_id = ?1 AND due_date IS NOT NULL
               AND (google_event_id IS NULL OR google_event_id = '')
             ORDER BY due_date ASC",
            ACTIVITY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], activity_from_row)?;
        Ok(collect_rows(rows)?
            .into_iter()
            .filter(|a| a.due_date.is_some())
            .collect())
    }

    /// Every external event id already owned by one of the user's activities.
    pub fn linked_event_ids(&self, user_id: &str) -> Result<HashSet<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT google_event_id FROM activities
             WHERE user_id = ?1 AND google_event_id IS NOT NULL AND google_event_id != ''",
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }

    /// Pending activities due in `[from, to]`, for reminder and overdue alerts.
    pub fn pending_activities_due_between(
        &self,
        user_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Activity>, DbError> {
        self.list_activities(
            user_id,
            &ActivityFilter {
                status: Some(ActivityStatus::Pending),
                due_after: Some(from),
                due_before: Some(to),
                ..Default::default()
            },
        )
    }

    fn ensure_activity_links(
        &self,
        user_id: &str,
        contact_id: Option<&str>,
        deal_id: Option<&str>,
    ) -> Result<(), DbError> {
        if let Some(contact_id) = contact_id {
            self.ensure_contact_owned(user_id, contact_id)?;
        }
        if let Some(deal_id) = deal_id {
            self.get_deal(user_id, deal_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    fn dated(db: &CrmDb, title: &str, due: &str) -> Activity {
        let mut input = NewActivity::new(title, ActivityType::Call);
        input.due_date = Some(parse_due_date(due).unwrap());
        db.create_activity("u1", &input).unwrap()
    }

    #[test]
    fn test_create_and_get_activity() {
        let db = test_db();
        let created = dated(&db, "Client Call", "2024-06-01T09:00:00");
        assert_eq!(created.status, ActivityStatus::Pending);
        assert_eq!(
            created.due_date.map(|d| format_due_date(&d)).as_deref(),
            Some("2024-06-01T09:00:00")
        );
        assert!(!created.is_linked());

        let fetched = db.get_activity("u1", &created.id).unwrap();
        assert_eq!(fetched, created);
        assert!(db.get_activity("u2", &created.id).is_err());
    }

    #[test]
    fn test_unknown_contact_is_not_found() {
        let db = test_db();
        let mut input = NewActivity::new("Ligar", ActivityType::Call);
        input.contact_id = Some("missing".to_string());
        assert!(matches!(
            db.create_activity("u1", &input),
            Err(DbError::NotFound { entity: "Contact", .. })
        ));
    }

    #[test]
    fn test_list_orders_by_due_date_with_undated_last() {
        let db = test_db();
        db.create_activity("u1", &NewActivity::new("Sem data", ActivityType::Task))
            .unwrap();
        dated(&db, "Depois", "2024-06-02T10:00:00");
        dated(&db, "Antes", "2024-06-01T10:00:00");

        let titles: Vec<String> = db
            .list_activities("u1", &ActivityFilter::default())
            .unwrap()
            .into_iter()
            .map(|a| a.title)
            .collect();
        assert_eq!(titles, vec!["Antes", "Depois", "Sem data"]);
    }

    #[test]
    fn test_link_only_once() {
        let db = test_db();
        let activity = dated(&db, "Client Call", "2024-06-01T09:00:00");

        assert!(db.link_activity_event("u1", &activity.id, "evt-1").unwrap());
        assert!(!db.link_activity_event("u1", &activity.id, "evt-2").unwrap());

        let linked = db.get_activity("u1", &activity.id).unwrap();
        assert_eq!(linked.google_event_id.as_deref(), Some("evt-1"));
        assert!(db.unlinked_dated_activities("u1").unwrap().is_empty());
        assert!(db.linked_event_ids("u1").unwrap().contains("evt-1"));
    }

    #[test]
    fn test_update_keeps_link_and_unset_fields() {
        let db = test_db();
        let activity = dated(&db, "Client Call", "2024-06-01T09:00:00");
        db.link_activity_event("u1", &activity.id, "evt-1").unwrap();

        let updated = db
            .update_activity(
                "u1",
                &activity.id,
                &ActivityUpdate {
                    title: Some("Client Call (remarcada)".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "Client Call (remarcada)");
        assert_eq!(updated.google_event_id.as_deref(), Some("evt-1"));
        assert_eq!(updated.due_date, activity.due_date);
    }

    #[test]
    fn test_pending_due_between() {
        let db = test_db();
        let soon = dated(&db, "Em breve", "2024-06-01T09:00:00");
        let done = dated(&db, "Feita", "2024-06-01T10:00:00");
        db.set_activity_status("u1", &done.id, ActivityStatus::Completed)
            .unwrap();
        dated(&db, "Longe", "2024-07-01T09:00:00");

        let due = db
            .pending_activities_due_between(
                "u1",
                parse_due_date("2024-06-01T00:00:00").unwrap(),
                parse_due_date("2024-06-02T00:00:00").unwrap(),
            )
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, soon.id);
    }
}
