//! Reminder and overdue alerts for pending Activities.
//!
//! A scan is idempotent: an Activity that already produced a reminder (or an
//! overdue alert) is skipped on later scans, keyed on the `activity_id`
//! recorded in the notification metadata.

use chrono::{Duration, NaiveDateTime};

use crate::db::{Activity, CrmDb, DbError, SharedDb};
use crate::notifications::NotificationService;

const REMINDER_TEMPLATE: &str = "activity_reminder";
const OVERDUE_TEMPLATE: &str = "activity_overdue";

/// Overdue alerts only look this far back.
const OVERDUE_LOOKBACK_DAYS: i64 = 30;

const DISPLAY_FORMAT: &str = "%d/%m/%Y %H:%M";

/// Reminder lead times are clamped to `0..=MAX_LEAD_MINUTES`.
pub const MAX_LEAD_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertSummary {
    pub reminders: usize,
    pub overdue: usize,
}

/// Emit reminders for Activities due within `lead_time` of `now` and overdue
/// alerts for those already past due. `now` is local wall-clock time in the
/// configured timezone, the same clock `due_date` is stored in.
/// `lead_time` is clamped to at most `MAX_LEAD_MINUTES`.
pub fn scan_activity_alerts(
    db: &SharedDb,
    notifications: &NotificationService,
    user_id: &str,
    now: NaiveDateTime,
    lead_time: Duration,
) -> Result<AlertSummary, DbError> {
    let lead_time = lead_time.clamp(Duration::zero(), Duration::minutes(MAX_LEAD_MINUTES));
    let horizon = now.checked_add_signed(lead_time).unwrap_or(now);
    let lookback = now
        .checked_sub_signed(Duration::days(OVERDUE_LOOKBACK_DAYS))
        .unwrap_or(now);

    let (upcoming, overdue) = {
        let db = db.lock();
        let upcoming = unalerted(
            &db,
            user_id,
            REMINDER_TEMPLATE,
            db.pending_activities_due_between(user_id, now, horizon)?,
        )?;
        let overdue = unalerted(
            &db,
            user_id,
            OVERDUE_TEMPLATE,
            db.pending_activities_due_between(user_id, lookback, now - Duration::seconds(1))?,
        )?;
        (upcoming, overdue)
    };

    let mut summary = AlertSummary::default();
    for activity in &upcoming {
        let Some(due) = activity.due_date else { continue };
        let date = due.format(DISPLAY_FORMAT).to_string();
        if notifications
            .notify_activity_reminder(user_id, &activity.title, &date, &activity.id)
            .is_some()
        {
            summary.reminders += 1;
        }
    }
    for activity in &overdue {
        let Some(due) = activity.due_date else { continue };
        let date = due.format(DISPLAY_FORMAT).to_string();
        if notifications
            .notify_activity_overdue(user_id, &activity.title, &date, &activity.id)
            .is_some()
        {
            summary.overdue += 1;
        }
    }

    if summary != AlertSummary::default() {
        log::info!(
            "Activity alerts for user {}: {} reminders, {} overdue",
            user_id,
            summary.reminders,
            summary.overdue
        );
    }
    Ok(summary)
}

fn unalerted(
    db: &CrmDb,
    user_id: &str,
    template_name: &str,
    candidates: Vec<Activity>,
) -> Result<Vec<Activity>, DbError> {
    let mut fresh = Vec::with_capacity(candidates.len());
    for activity in candidates {
        if !db.template_notification_exists(user_id, template_name, "activity_id", &activity.id)? {
            fresh.push(activity);
        }
    }
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{ActivityStatus, ActivityType, NewActivity, NotificationQuery};
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn seed(db: &SharedDb, title: &str, due: NaiveDateTime, status: Option<ActivityStatus>) {
        let mut input = NewActivity::new(title, ActivityType::Call);
        input.due_date = Some(due);
        input.status = status;
        db.lock().create_activity("u1", &input).unwrap();
    }

    #[test]
    fn test_scan_alerts_once_per_activity() {
        let db = test_db().into_shared();
        let notifications = NotificationService::new(db.clone());
        seed(&db, "Ligar para Ana", at(9, 30), None);
        seed(&db, "Enviar proposta", at(8, 0), None);
        seed(&db, "Reunião feita", at(8, 30), Some(ActivityStatus::Completed));
        seed(&db, "Amanhã", at(23, 0), None);

        let first =
            scan_activity_alerts(&db, &notifications, "u1", at(9, 0), Duration::hours(1)).unwrap();
        assert_eq!(first, AlertSummary { reminders: 1, overdue: 1 });

        let second =
            scan_activity_alerts(&db, &notifications, "u1", at(9, 5), Duration::hours(1)).unwrap();
        assert_eq!(second, AlertSummary::default());

        let page = notifications
            .list("u1", &NotificationQuery::default())
            .unwrap();
        assert_eq!(page.total, 2);
        let reminder = page
            .notifications
            .iter()
            .find(|n| n.metadata["template_name"] == REMINDER_TEMPLATE)
            .unwrap();
        assert_eq!(reminder.metadata["variables"]["activity_date"], "01/06/2024 09:30");
    }

    #[test]
    fn test_extreme_lead_time_is_clamped() {
        let db = test_db().into_shared();
        let notifications = NotificationService::new(db.clone());
        seed(&db, "Semana que vem", at(9, 0) + Duration::days(6), None);
        seed(&db, "Mês que vem", at(9, 0) + Duration::days(20), None);

        let summary = scan_activity_alerts(
            &db,
            &notifications,
            "u1",
            at(9, 0),
            Duration::days(1_000_000),
        )
        .unwrap();
        assert_eq!(summary, AlertSummary { reminders: 1, overdue: 0 });

        let none =
            scan_activity_alerts(&db, &notifications, "u1", at(9, 0), -Duration::days(3)).unwrap();
        assert_eq!(none, AlertSummary::default());
    }
}
