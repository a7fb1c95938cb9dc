//! Agenda merge of CRM Activities with external calendar events.
//!
//! Activities are the source of truth for anything they link to. An external
//! event whose id belongs to an Activity is dropped so the agenda never shows
//! the same appointment twice; the rest are shown read-only as meetings.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use serde::Serialize;

use crate::db::{Activity, ActivityStatus, ActivityType};
use crate::google_api::calendar::CalendarEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelineSource {
    Crm,
    Google,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    /// Activity id, or `google-<event id>` for external events.
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub source: TimelineSource,
    /// Activity linked to an external event.
    pub linked: bool,
    pub activity_type: ActivityType,
    pub status: Option<ActivityStatus>,
}

/// Dated Activities plus unlinked external events, ordered by start time.
///
/// Activities without a due date are left out. Activity entries last
/// `duration_minutes`; external entries keep their own end, falling back to
/// the same duration when it cannot be read.
pub fn merge_timeline(
    activities: &[Activity],
    events: &[CalendarEvent],
    tz: Tz,
    duration_minutes: u32,
) -> Vec<TimelineEntry> {
    let duration = chrono::Duration::minutes(i64::from(duration_minutes));
    let linked: HashSet<&str> = activities
        .iter()
        .filter_map(|a| a.google_event_id.as_deref())
        .filter(|id| !id.is_empty())
        .collect();

    let mut entries: Vec<TimelineEntry> = activities
        .iter()
        .filter_map(|a| {
            let start = a.due_date?;
            Some(TimelineEntry {
                id: a.id.clone(),
                title: a.title.clone(),
                description: a.description.clone(),
                start,
                end: start + duration,
                source: TimelineSource::Crm,
                linked: a.is_linked(),
                activity_type: a.activity_type,
                status: Some(a.status),
            })
        })
        .collect();

    for event in events {
        if event.id.is_empty() || linked.contains(event.id.as_str()) || event.is_cancelled() {
            continue;
        }
        let Some(start) = event.start.to_local(tz) else {
            log::debug!("Skipping event {} without a readable start", event.id);
            continue;
        };
        let end = event
            .end
            .to_local(tz)
            .filter(|end| *end >= start)
            .unwrap_or(start + duration);
        entries.push(TimelineEntry {
            id: format!("google-{}", event.id),
            title: event.title().to_string(),
            description: event.description.clone(),
            start,
            end,
            source: TimelineSource::Google,
            linked: false,
            activity_type: ActivityType::Meeting,
            status: None,
        });
    }

    entries.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
    entries
}
