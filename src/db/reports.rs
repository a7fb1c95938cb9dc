use std::collections::BTreeMap;

use rusqlite::types::FromSql;
use rusqlite::params;

use super::*;

/// Raw per-table aggregates for one user over rows created inside a window.
/// Months are `YYYY-MM` of the UTC `created_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportCounts {
    pub contacts: u64,
    pub leads_by_status: BTreeMap<LeadStatus, u64>,
    pub leads_by_source: BTreeMap<String, u64>,
    pub deals_by_status: BTreeMap<DealStatus, u64>,
    pub deal_value_by_status: BTreeMap<DealStatus, f64>,
    pub activities_by_type: BTreeMap<ActivityType, u64>,
    pub activities_by_status: BTreeMap<ActivityStatus, u64>,
    pub contacts_by_month: BTreeMap<String, u64>,
    pub leads_by_month: BTreeMap<String, u64>,
    pub deals_by_month: BTreeMap<String, u64>,
    pub won_value_by_month: BTreeMap<String, f64>,
}

impl CrmDb {
    /// Aggregate contacts, leads, deals and activities of `user_id` created
    /// between `since` and `until` inclusive (RFC 3339, UTC).
    pub fn report_counts(
        &self,
        user_id: &str,
        since: &str,
        until: &str,
    ) -> Result<ReportCounts, DbError> {
        let contacts: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM contacts WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3",
            params![user_id, since, until],
            |row| row.get(0),
        )?;

        Ok(ReportCounts {
            contacts: contacts as u64,
            leads_by_status: self.grouped(
                "SELECT status, COUNT(*) FROM leads
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 GROUP BY status",
                user_id,
                since,
                until,
            )?,
            leads_by_source: self.grouped(
                "SELECT source, COUNT(*) FROM leads
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 GROUP BY source",
                user_id,
                since,
                until,
            )?,
            deals_by_status: self.grouped(
                "SELECT status, COUNT(*) FROM deals
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 GROUP BY status",
                user_id,
                since,
                until,
            )?,
            deal_value_by_status: self.grouped(
                "SELECT status, COALESCE(SUM(value), 0.0) FROM deals
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 GROUP BY status",
                user_id,
                since,
                until,
            )?,
            activities_by_type: self.grouped(
                "SELECT type, COUNT(*) FROM activities
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 GROUP BY type",
                user_id,
                since,
                until,
            )?,
            activities_by_status: self.grouped(
                "SELECT status, COUNT(*) FROM activities
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 GROUP BY status",
                user_id,
                since,
                until,
            )?,
            contacts_by_month: self.grouped(
                "SELECT substr(created_at, 1, 7), COUNT(*) FROM contacts
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 GROUP BY 1",
                user_id,
                since,
                until,
            )?,
            leads_by_month: self.grouped(
                "SELECT substr(created_at, 1, 7), COUNT(*) FROM leads
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 GROUP BY 1",
                user_id,
                since,
                until,
            )?,
            deals_by_month: self.grouped(
                "SELECT substr(created_at, 1, 7), COUNT(*) FROM deals
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 GROUP BY 1",
                user_id,
                since,
                until,
            )?,
            won_value_by_month: self.grouped(
                "SELECT substr(created_at, 1, 7), COALESCE(SUM(value), 0.0) FROM deals
                 WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 AND status = 'closed_won'
                 GROUP BY 1",
                user_id,
                since,
                until,
            )?,
        })
    }

    fn grouped<K, V>(
        &self,
        sql: &str,
        user_id: &str,
        since: &str,
        until: &str,
    ) -> Result<BTreeMap<K, V>, DbError>
    where
        K: FromSql + Ord,
        V: FromSql,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![user_id, since, until], |row| {
            Ok((row.get::<_, K>(0)?, row.get::<_, V>(1)?))
        })?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }
}
