//! Overview report: pipeline totals and per-status breakdowns over a window
//! of recent days.
//!
//! Only rows created inside the window are counted, including the monthly
//! series. Ratios over an empty denominator are 0.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::db::reports::ReportCounts;
use crate::db::{ActivityStatus, ActivityType, CrmDb, DbError, DealStatus, LeadStatus};

pub const DEFAULT_REPORT_DAYS: u32 = 30;
pub const MAX_REPORT_DAYS: u32 = 3650;

/// Months in the monthly series, oldest first, ending with the current one.
const MONTHLY_POINTS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPeriod {
    pub start_date: String,
    pub end_date: String,
    pub days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_contacts: u64,
    pub total_leads: u64,
    pub total_deals: u64,
    pub total_activities: u64,
    /// Sum of closed-won deal values.
    pub total_revenue: f64,
    /// Sum of prospecting and negotiation deal values.
    pub pipeline_value: f64,
    /// Won deals per lead, as a percentage.
    pub conversion_rate: f64,
    pub avg_deal_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadBreakdown {
    pub total: u64,
    pub by_status: BTreeMap<LeadStatus, u64>,
    pub by_source: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealBreakdown {
    pub total: u64,
    pub by_status: BTreeMap<DealStatus, u64>,
    pub total_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityBreakdown {
    pub total: u64,
    pub by_type: BTreeMap<ActivityType, u64>,
    pub by_status: BTreeMap<ActivityStatus, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyPoint {
    /// `YYYY-MM`
    pub month: String,
    pub contacts: u64,
    pub leads: u64,
    pub deals: u64,
    pub revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Funnel {
    pub leads: u64,
    pub qualified_leads: u64,
    pub deals: u64,
    pub won_deals: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewReport {
    pub period: ReportPeriod,
    pub summary: ReportSummary,
    pub leads: LeadBreakdown,
    pub deals: DealBreakdown,
    pub activities: ActivityBreakdown,
    pub monthly_data: Vec<MonthlyPoint>,
    pub funnel: Funnel,
}

/// Build the overview for `user_id` over the `days` before `now`.
pub fn overview(
    db: &CrmDb,
    user_id: &str,
    days: u32,
    now: DateTime<Utc>,
) -> Result<OverviewReport, DbError> {
    if !(1..=MAX_REPORT_DAYS).contains(&days) {
        return Err(DbError::Validation(format!(
            "Days must be between 1 and {}",
            MAX_REPORT_DAYS
        )));
    }
    let start = now - Duration::days(i64::from(days));
    let counts = db.report_counts(user_id, &start.to_rfc3339(), &now.to_rfc3339())?;
    Ok(build(counts, days, start, now))
}

fn build(
    counts: ReportCounts,
    days: u32,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> OverviewReport {
    let leads_by_status = with_all(LeadStatus::ALL, &counts.leads_by_status);
    let deals_by_status = with_all(DealStatus::ALL, &counts.deals_by_status);
    let activities_by_type = with_all(ActivityType::ALL, &counts.activities_by_type);
    let activities_by_status = with_all(ActivityStatus::ALL, &counts.activities_by_status);

    let total_leads: u64 = leads_by_status.values().sum();
    let total_deals: u64 = deals_by_status.values().sum();
    let total_activities: u64 = activities_by_type.values().sum();
    let won_deals = deals_by_status[&DealStatus::ClosedWon];

    let value_of = |status: DealStatus| {
        counts
            .deal_value_by_status
            .get(&status)
            .copied()
            .unwrap_or(0.0)
    };
    let total_value: f64 = counts.deal_value_by_status.values().sum();
    let total_revenue = value_of(DealStatus::ClosedWon);
    let pipeline_value = value_of(DealStatus::Prospecting) + value_of(DealStatus::Negotiation);

    let monthly_data = month_keys(now.date_naive(), MONTHLY_POINTS)
        .into_iter()
        .map(|month| MonthlyPoint {
            contacts: counts.contacts_by_month.get(&month).copied().unwrap_or(0),
            leads: counts.leads_by_month.get(&month).copied().unwrap_or(0),
            deals: counts.deals_by_month.get(&month).copied().unwrap_or(0),
            revenue: counts.won_value_by_month.get(&month).copied().unwrap_or(0.0),
            month,
        })
        .collect();

    OverviewReport {
        period: ReportPeriod {
            start_date: start.to_rfc3339(),
            end_date: now.to_rfc3339(),
            days,
        },
        summary: ReportSummary {
            total_contacts: counts.contacts,
            total_leads,
            total_deals,
            total_activities,
            total_revenue,
            pipeline_value,
            conversion_rate: ratio(won_deals as f64, total_leads) * 100.0,
            avg_deal_value: ratio(total_value, total_deals),
        },
        funnel: Funnel {
            leads: total_leads,
            qualified_leads: leads_by_status[&LeadStatus::Qualified],
            deals: total_deals,
            won_deals,
        },
        leads: LeadBreakdown {
            total: total_leads,
            by_status: leads_by_status,
            by_source: counts.leads_by_source,
        },
        deals: DealBreakdown {
            total: total_deals,
            by_status: deals_by_status,
            total_value,
        },
        activities: ActivityBreakdown {
            total: total_activities,
            by_type: activities_by_type,
            by_status: activities_by_status,
        },
        monthly_data,
    }
}

fn ratio(numerator: f64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

/// Every key of `all` present, zero when absent from `counts`.
fn with_all<K: Ord + Copy>(all: &[K], counts: &BTreeMap<K, u64>) -> BTreeMap<K, u64> {
    all.iter()
        .map(|k| (*k, counts.get(k).copied().unwrap_or(0)))
        .collect()
}

/// `YYYY-MM` for the `n` months ending with the month of `today`, oldest first.
fn month_keys(today: NaiveDate, n: u32) -> Vec<String> {
    let current = today.year() * 12 + today.month0() as i32;
    (0..n as i32)
        .rev()
        .map(|back| {
            let index = current - back;
            format!("{:04}-{:02}", index.div_euclid(12), index.rem_euclid(12) + 1)
        })
        .collect()
}
