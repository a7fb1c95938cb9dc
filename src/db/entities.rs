use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::*;
use crate::util::{new_id, now_rfc3339};

const CONTACT_COLUMNS: &str =
    "id, user_id, name, email, phone, company, position, status, created_at, updated_at";
const LEAD_COLUMNS: &str = "id, user_id, name, email, phone, company, source, status, \
     interest_level, value, created_at, updated_at";
const DEAL_COLUMNS: &str = "id, user_id, title, description, value, status, contact_id, \
     expected_close_date, created_at, updated_at";

fn contact_from_row(row: &Row) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        company: row.get(5)?,
        position: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn lead_from_row(row: &Row) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        company: row.get(5)?,
        source: row.get(6)?,
        status: row.get(7)?,
        interest_level: row.get(8)?,
        value: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn deal_from_row(row: &Row) -> rusqlite::Result<Deal> {
    Ok(Deal {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        value: row.get(4)?,
        status: row.get(5)?,
        contact_id: row.get(6)?,
        expected_close_date: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl CrmDb {
    // =========================================================================
    // Contacts
    // =========================================================================

    pub fn create_contact(&self, user_id: &str, input: &NewContact) -> Result<Contact, DbError> {
        input.validate()?;
        let id = new_id();
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO contacts (id, user_id, name, email, phone, company, position, status,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, LOWER(?4), ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                user_id,
                input.name.trim(),
                input.email.trim(),
                input.phone,
                input.company,
                input.position,
                input.status.unwrap_or(ContactStatus::Active),
                now,
            ],
        )?;
        self.get_contact(user_id, &id)
    }

    pub fn get_contact(&self, user_id: &str, id: &str) -> Result<Contact, DbError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM contacts WHERE id = ?1 AND user_id = ?2",
                    CONTACT_COLUMNS
                ),
                params![id, user_id],
                contact_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::not_found("Contact", id))
    }

    /// Newest first.
    pub fn list_contacts(
        &self,
        user_id: &str,
        filter: &ContactFilter,
    ) -> Result<Vec<Contact>, DbError> {
        let mut sql = format!("SELECT {} FROM contacts WHERE user_id = ?", CONTACT_COLUMNS);
        let mut args = vec![Value::Text(user_id.to_string())];
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(term) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            sql.push_str(
                " AND (LOWER(name) LIKE ? OR LOWER(email) LIKE ? OR LOWER(COALESCE(company, '')) LIKE ?)",
            );
            let pattern = like_pattern(term);
            args.extend(std::iter::repeat(Value::Text(pattern)).take(3));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), contact_from_row)?;
        collect_rows(rows)
    }

    pub fn update_contact(
        &self,
        user_id: &str,
        id: &str,
        update: &ContactUpdate,
    ) -> Result<Contact, DbError> {
        if let Some(email) = update.email.as_deref() {
            validate_email(email)?;
        }
        let changed = self.conn.execute(
            "UPDATE contacts SET
                name = COALESCE(?3, name),
                email = COALESCE(LOWER(?4), email),
                phone = COALESCE(?5, phone),
                company = COALESCE(?6, company),
                position = COALESCE(?7, position),
                updated_at = ?8
             WHERE id = ?1 AND user_id = ?2",
            params![
                id,
                user_id,
                update.name,
                update.email,
                update.phone,
                update.company,
                update.position,
                now_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Contact", id));
        }
        self.get_contact(user_id, id)
    }

    pub fn set_contact_status(
        &self,
        user_id: &str,
        id: &str,
        status: ContactStatus,
    ) -> Result<Contact, DbError> {
        let changed = self.conn.execute(
            "UPDATE contacts SET status = ?3, updated_at = ?4 WHERE id = ?1 AND user_id = ?2",
            params![id, user_id, status, now_rfc3339()],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Contact", id));
        }
        self.get_contact(user_id, id)
    }

    /// Deletes the contact's deals too; activities keep their row with the link cleared.
    pub fn delete_contact(&self, user_id: &str, id: &str) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "DELETE FROM contacts WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Contact", id));
        }
        Ok(())
    }

    pub(crate) fn ensure_contact_owned(&self, user_id: &str, contact_id: &str) -> Result<(), DbError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM contacts WHERE id = ?1 AND user_id = ?2)",
            params![contact_id, user_id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(DbError::not_found("Contact", contact_id))
        }
    }

    // =========================================================================
    // Leads
    // =========================================================================

    pub fn create_lead(&self, user_id: &str, input: &NewLead) -> Result<Lead, DbError> {
        input.validate()?;
        let id = new_id();
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO leads (id, user_id, name, email, phone, company, source, status,
                                interest_level, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, LOWER(?4), ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                id,
                user_id,
                input.name.trim(),
                input.email.trim(),
                input.phone,
                input.company,
                input.source.trim(),
                input.status.unwrap_or(LeadStatus::New),
                input.interest_level.unwrap_or(InterestLevel::Morno),
                input.value,
                now,
            ],
        )?;
        self.get_lead(user_id, &id)
    }

    pub fn get_lead(&self, user_id: &str, id: &str) -> Result<Lead, DbError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM leads WHERE id = ?1 AND user_id = ?2", LEAD_COLUMNS),
                params![id, user_id],
                lead_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::not_found("Lead", id))
    }

    pub fn list_leads(&self, user_id: &str, filter: &LeadFilter) -> Result<Vec<Lead>, DbError> {
        let mut sql = format!("SELECT {} FROM leads WHERE user_id = ?", LEAD_COLUMNS);
        let mut args = vec![Value::Text(user_id.to_string())];
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(level) = filter.interest_level {
            sql.push_str(" AND interest_level = ?");
            args.push(Value::Text(level.as_str().to_string()));
        }
        if let Some(term) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            sql.push_str(
                " AND (LOWER(name) LIKE ? OR LOWER(email) LIKE ? OR LOWER(COALESCE(company, '')) LIKE ? OR LOWER(source) LIKE ?)",
            );
            let pattern = like_pattern(term);
            args.extend(std::iter::repeat(Value::Text(pattern)).take(4));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), lead_from_row)?;
        collect_rows(rows)
    }

    pub fn update_lead(&self, user_id: &str, id: &str, update: &LeadUpdate) -> Result<Lead, DbError> {
        if let Some(email) = update.email.as_deref() {
            validate_email(email)?;
        }
        let changed = self.conn.execute(
            "UPDATE leads SET
                name = COALESCE(?3, name),
                email = COALESCE(LOWER(?4), email),
                phone = COALESCE(?5, phone),
                company = COALESCE(?6, company),
                source = COALESCE(?7, source),
                interest_level = COALESCE(?8, interest_level),
                value = COALESCE(?9, value),
                updated_at = ?10
             WHERE id = ?1 AND user_id = ?2",
            params![
                id,
                user_id,
                update.name,
                update.email,
                update.phone,
                update.company,
                update.source,
                update.interest_level,
                update.value,
                now_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Lead", id));
        }
        self.get_lead(user_id, id)
    }

    pub fn set_lead_status(
        &self,
        user_id: &str,
        id: &str,
        status: LeadStatus,
    ) -> Result<Lead, DbError> {
        let changed = self.conn.execute(
            "UPDATE leads SET status = ?3, updated_at = ?4 WHERE id = ?1 AND user_id = ?2",
            params![id, user_id, status, now_rfc3339()],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Lead", id));
        }
        self.get_lead(user_id, id)
    }

    pub fn delete_lead(&self, user_id: &str, id: &str) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "DELETE FROM leads WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Lead", id));
        }
        Ok(())
    }

    // =========================================================================
    // Deals
    // =========================================================================

    /// The contact must exist and belong to the same user.
    pub fn create_deal(&self, user_id: &str, input: &NewDeal) -> Result<Deal, DbError> {
        input.validate()?;
        self.ensure_contact_owned(user_id, &input.contact_id)?;
        let id = new_id();
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO deals (id, user_id, title, description, value, status, contact_id,
                                expected_close_date, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                user_id,
                input.title.trim(),
                input.description,
                input.value,
                input.status.unwrap_or(DealStatus::Prospecting),
                input.contact_id,
                input.expected_close_date,
                now,
            ],
        )?;
        self.get_deal(user_id, &id)
    }

    pub fn get_deal(&self, user_id: &str, id: &str) -> Result<Deal, DbError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM deals WHERE id = ?1 AND user_id = ?2", DEAL_COLUMNS),
                params![id, user_id],
                deal_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::not_found("Deal", id))
    }

    pub fn list_deals(&self, user_id: &str, filter: &DealFilter) -> Result<Vec<Deal>, DbError> {
        let mut sql = format!("SELECT {} FROM deals WHERE user_id = ?", DEAL_COLUMNS);
        let mut args = vec![Value::Text(user_id.to_string())];
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(contact_id) = filter.contact_id.as_deref() {
            sql.push_str(" AND contact_id = ?");
            args.push(Value::Text(contact_id.to_string()));
        }
        if let Some(term) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            sql.push_str(" AND LOWER(title) LIKE ?");
            args.push(Value::Text(like_pattern(term)));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), deal_from_row)?;
        collect_rows(rows)
    }

    pub fn update_deal(&self, user_id: &str, id: &str, update: &DealUpdate) -> Result<Deal, DbError> {
        update.validate()?;
        if let Some(contact_id) = update.contact_id.as_deref() {
            self.ensure_contact_owned(user_id, contact_id)?;
        }
        let changed = self.conn.execute(
            "UPDATE deals SET
                title = COALESCE(?3, title),
                description = COALESCE(?4, description),
                value = COALESCE(?5, value),
                contact_id = COALESCE(?6, contact_id),
                expected_close_date = COALESCE(?7, expected_close_date),
                updated_at = ?8
             WHERE id = ?1 AND user_id = ?2",
            params![
                id,
                user_id,
                update.title,
                update.description,
                update.value,
                update.contact_id,
                update.expected_close_date,
                now_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Deal", id));
        }
        self.get_deal(user_id, id)
    }

    pub fn set_deal_status(
        &self,
        user_id: &str,
        id: &str,
        status: DealStatus,
    ) -> Result<Deal, DbError> {
        let changed = self.conn.execute(
            "UPDATE deals SET status = ?3, updated_at = ?4 WHERE id = ?1 AND user_id = ?2",
            params![id, user_id, status, now_rfc3339()],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Deal", id));
        }
        self.get_deal(user_id, id)
    }

    pub fn delete_deal(&self, user_id: &str, id: &str) -> Result<(), DbError> {
        let changed = self.conn.execute(
            "DELETE FROM deals WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if changed == 0 {
            return Err(DbError::not_found("Deal", id));
        }
        Ok(())
    }
}
