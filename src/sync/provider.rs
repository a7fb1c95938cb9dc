//! The external calendar seam used by the sync bridge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::google_api::calendar::{CalendarEvent, CalendarListEntry, EventPayload};
use crate::google_api::GoogleApiError;

/// Calendar operations the sync bridge needs from a remote provider.
///
/// Every call takes the bearer token explicitly so the bridge can refresh it
/// between calls without rebuilding the provider.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Non-cancelled events that start inside `[time_min, time_max)`.
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, GoogleApiError>;

    async fn insert_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        payload: &EventPayload,
    ) -> Result<CalendarEvent, GoogleApiError>;

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        payload: &EventPayload,
    ) -> Result<CalendarEvent, GoogleApiError>;

    /// Deleting an event that no longer exists is not an error.
    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), GoogleApiError>;

    async fn list_calendars(
        &self,
        access_token: &str,
    ) -> Result<Vec<CalendarListEntry>, GoogleApiError>;
}
