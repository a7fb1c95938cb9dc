//! Google Calendar API v3: event and calendar-list calls.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{error_for_response, send_with_retry, GoogleApiError, RetryPolicy};
use crate::sync::provider::CalendarProvider;

pub const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    /// All-day events carry only a date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl EventDateTime {
    /// Wall-clock time interpreted in `tz`.
    pub fn to_local(&self, tz: Tz) -> Option<NaiveDateTime> {
        if let Some(dt) = self.date_time.as_deref() {
            if let Some(utc) = parse_event_datetime(dt) {
                return Some(utc.with_timezone(&tz).naive_local());
            }
            // No offset: already wall-clock in the event's own zone
            return NaiveDateTime::parse_from_str(dt, "%Y-%m-%dT%H:%M:%S").ok();
        }
        self.date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    }

    pub fn is_all_day(&self) -> bool {
        self.date_time.is_none() && self.date.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub start: EventDateTime,
    #[serde(default)]
    pub end: EventDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
}

impl CalendarEvent {
    pub fn title(&self) -> &str {
        self.summary.as_deref().unwrap_or("(Sem título)")
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderOverride {
    pub method: String,
    pub minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminders {
    pub use_default: bool,
    #[serde(default)]
    pub overrides: Vec<ReminderOverride>,
}

impl Reminders {
    /// E-mail one day before, popup thirty minutes before.
    pub fn crm_defaults() -> Self {
        Self {
            use_default: false,
            overrides: vec![
                ReminderOverride {
                    method: "email".to_string(),
                    minutes: 24 * 60,
                },
                ReminderOverride {
                    method: "popup".to_string(),
                    minutes: 30,
                },
            ],
        }
    }
}

/// Body for insert and patch calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: EventDateTime,
    pub end: EventDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminders: Option<Reminders>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarListEntry {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsPage {
    #[serde(default)]
    items: Vec<CalendarEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarListPage {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    next_page_token: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

/// Bearer-authenticated Calendar v3 client.
#[derive(Debug, Clone)]
pub struct GoogleCalendarClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl GoogleCalendarClient {
    pub fn new(http: reqwest::Client, retry: RetryPolicy) -> Self {
        Self::with_base_url(http, retry, CALENDAR_API_BASE)
    }

    pub fn with_base_url(http: reqwest::Client, retry: RetryPolicy, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<url::Url, GoogleApiError> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|e| GoogleApiError::InvalidUrl(e.to_string()))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| GoogleApiError::InvalidUrl(self.base_url.clone()))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarClient {
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, GoogleApiError> {
        let url = self.endpoint(&["calendars", calendar_id, "events"])?;
        let time_min = time_min.to_rfc3339();
        let time_max = time_max.to_rfc3339();

        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(url.clone())
                .bearer_auth(access_token)
                .query(&[
                    ("timeMin", time_min.as_str()),
                    ("timeMax", time_max.as_str()),
                    ("singleEvents", "true"),
                    ("orderBy", "startTime"),
                    ("maxResults", "250"),
                ]);
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let resp = send_with_retry(request, &self.retry).await?;
            if !resp.status().is_success() {
                return Err(error_for_response(resp).await);
            }
            let page: EventsPage = resp.json().await?;
            events.extend(page.items.into_iter().filter(|e| !e.is_cancelled()));

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(events)
    }

    async fn insert_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        payload: &EventPayload,
    ) -> Result<CalendarEvent, GoogleApiError> {
        let url = self.endpoint(&["calendars", calendar_id, "events"])?;
        // Sent once: a timed-out insert may already have created the event.
        let resp = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        payload: &EventPayload,
    ) -> Result<CalendarEvent, GoogleApiError> {
        let url = self.endpoint(&["calendars", calendar_id, "events", event_id])?;
        let resp = send_with_retry(
            self.http.patch(url).bearer_auth(access_token).json(payload),
            &self.retry,
        )
        .await?;
        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), GoogleApiError> {
        let url = self.endpoint(&["calendars", calendar_id, "events", event_id])?;
        let resp = send_with_retry(
            self.http.delete(url).bearer_auth(access_token),
            &self.retry,
        )
        .await?;
        let status = resp.status();
        // Already gone on the remote side.
        if status == reqwest::StatusCode::GONE || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !status.is_success() {
            return Err(error_for_response(resp).await);
        }
        Ok(())
    }

    async fn list_calendars(
        &self,
        access_token: &str,
    ) -> Result<Vec<CalendarListEntry>, GoogleApiError> {
        let url = self.endpoint(&["users", "me", "calendarList"])?;
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.http.get(url.clone()).bearer_auth(access_token);
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let resp = send_with_retry(request, &self.retry).await?;
            if !resp.status().is_success() {
                return Err(error_for_response(resp).await);
            }
            let page: CalendarListPage = resp.json().await?;
            calendars.extend(page.items);

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(calendars)
    }
}

/// Parse an event timestamp to UTC. Date-only values are midnight UTC.
pub fn parse_event_datetime(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if s.contains('T') {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    } else {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
    }
}
