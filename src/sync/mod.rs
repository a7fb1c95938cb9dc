//! Calendar sync bridge between Activities and the user's Google Calendar.
//!
//! Runs on demand only. Import reads the external window and drops events
//! already owned by an Activity; export creates one event per dated,
//! unlinked Activity and records the returned id. Local writes are always
//! authoritative: mirroring an edit or delete to the external calendar is
//! best effort and never rolls back the local change.

pub mod guard;
pub mod provider;

use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::Serialize;

use crate::config::{AppConfig, ConfigError, ConflictPolicy};
use crate::db::{Activity, ActivityUpdate, CalendarIntegration, DbError, SharedDb};
use crate::google_api::auth::{authorization_url, exchange_code, run_loopback_consent};
use crate::google_api::calendar::{
    CalendarEvent, CalendarListEntry, EventDateTime, EventPayload, GoogleCalendarClient, Reminders,
};
use crate::google_api::{
    is_token_expired, refresh_access_token, GoogleApiError, OAuthClient, TokenResponse,
};
use crate::util::now_rfc3339;

pub use guard::{SyncGuard, SyncPermit};
pub use provider::CalendarProvider;

const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Google Calendar is not connected")]
    NotConnected,
    #[error("A calendar sync is already running for this user")]
    AlreadyRunning,
    #[error(transparent)]
    NotConfigured(#[from] ConfigError),
    #[error("Database: {0}")]
    Db(#[from] DbError),
    #[error("Google: {0}")]
    Google(#[from] GoogleApiError),
}

/// Calendar-related settings resolved from the app config.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub timezone: Tz,
    pub window_days: u32,
    pub default_duration_minutes: u32,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::Sao_Paulo,
            window_days: 30,
            default_duration_minutes: 60,
            conflict_policy: ConflictPolicy::LocalWins,
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            timezone: config.timezone()?,
            window_days: config.google.sync_window_days,
            default_duration_minutes: config.google.default_duration_minutes,
            conflict_policy: config.google.conflict_policy,
        })
    }
}

/// Counts from one `sync_events` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// External events in the window not owned by any Activity.
    pub google_to_crm: usize,
    /// Activities newly linked to an external event.
    pub crm_to_google: usize,
    pub last_sync: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub configured: bool,
    pub missing: Vec<&'static str>,
    pub connected: bool,
    pub calendar_id: Option<String>,
    pub last_sync: Option<String>,
    /// "Nunca" until the first successful sync.
    pub last_sync_label: String,
    pub calendars: Option<Vec<CalendarListEntry>>,
}

/// Access token and target calendar for one connected user.
struct Session {
    user_id: String,
    access_token: String,
    calendar_id: String,
}

pub struct CalendarSync {
    db: SharedDb,
    provider: Arc<dyn CalendarProvider>,
    http: reqwest::Client,
    oauth: Option<OAuthClient>,
    settings: SyncSettings,
    guard: SyncGuard,
    /// Calendar list per user, cleared on disconnect.
    calendars: DashMap<String, Vec<CalendarListEntry>>,
}

impl CalendarSync {
    pub fn new(
        db: SharedDb,
        provider: Arc<dyn CalendarProvider>,
        http: reqwest::Client,
        oauth: Option<OAuthClient>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            db,
            provider,
            http,
            oauth,
            settings,
            guard: SyncGuard::new(),
            calendars: DashMap::new(),
        }
    }

    /// Production wiring: Google Calendar v3 client with the configured retry policy.
    ///
    /// A missing OAuth client is not an error here; the operations that need
    /// it report `NotConfigured` when called.
    pub fn from_config(
        db: SharedDb,
        http: reqwest::Client,
        config: &AppConfig,
    ) -> Result<Self, ConfigError> {
        let provider = GoogleCalendarClient::new(http.clone(), config.retry.clone());
        Ok(Self::new(
            db,
            Arc::new(provider),
            http,
            config.google.oauth_client().ok(),
            SyncSettings::from_config(config)?,
        ))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn oauth(&self) -> Result<&OAuthClient, SyncError> {
        match self.oauth.as_ref() {
            Some(oauth) => Ok(oauth),
            None => Err(SyncError::NotConfigured(ConfigError::GoogleNotConfigured(
                crate::config::GoogleConfig::default().status().missing,
            ))),
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Consent URL for `user_id`; the user id travels in `state`.
    pub fn authorization_url(&self, user_id: &str) -> Result<String, SyncError> {
        Ok(authorization_url(self.oauth()?, Some(user_id)))
    }

    /// Exchange a consent code and store the resulting tokens.
    pub async fn complete_connect(
        &self,
        user_id: &str,
        code: &str,
    ) -> Result<CalendarIntegration, SyncError> {
        let token = exchange_code(&self.http, self.oauth()?, code).await?;
        self.store_tokens(user_id, &token)
    }

    /// Browser consent with a loopback redirect, for the CLI.
    pub async fn connect_interactive(&self, user_id: &str) -> Result<CalendarIntegration, SyncError> {
        let token = run_loopback_consent(&self.http, self.oauth()?).await?;
        self.store_tokens(user_id, &token)
    }

    fn store_tokens(
        &self,
        user_id: &str,
        token: &TokenResponse,
    ) -> Result<CalendarIntegration, SyncError> {
        let row = store_calendar_tokens(&self.db, user_id, token)?;
        self.calendars.remove(user_id);
        log::info!("Google Calendar connected for user {}", user_id);
        Ok(row)
    }

    /// Turn sync off for the user. Activities keep their event links and the
    /// token row is retained.
    pub fn disconnect(&self, user_id: &str) -> Result<(), SyncError> {
        match self.db.lock().set_calendar_sync_enabled(user_id, false) {
            Ok(()) => {}
            Err(DbError::NotFound { .. }) => return Err(SyncError::NotConnected),
            Err(e) => return Err(e.into()),
        }
        self.calendars.remove(user_id);
        log::info!("Google Calendar disconnected for user {}", user_id);
        Ok(())
    }

    pub fn status(&self, user_id: &str) -> Result<SyncStatus, SyncError> {
        let configured = self.oauth.is_some();
        let missing = if configured {
            Vec::new()
        } else {
            crate::config::GoogleConfig::default().status().missing
        };
        let row = self.db.lock().get_calendar_integration(user_id)?;
        let connected = row.as_ref().is_some_and(|r| r.sync_enabled);

        // Display state only exists while connected.
        let last_sync = row
            .as_ref()
            .filter(|r| r.sync_enabled)
            .and_then(|r| r.last_sync.clone());
        let last_sync_label = last_sync_label(last_sync.as_deref(), self.settings.timezone);

        Ok(SyncStatus {
            configured,
            missing,
            connected,
            calendar_id: row.filter(|r| r.sync_enabled).map(|r| r.calendar_id),
            last_sync,
            last_sync_label,
            calendars: self.calendars.get(user_id).map(|c| c.value().clone()),
        })
    }

    pub async fn list_calendars(&self, user_id: &str) -> Result<Vec<CalendarListEntry>, SyncError> {
        let session = self.session(user_id).await?;
        let calendars = self.provider.list_calendars(&session.access_token).await?;
        self.calendars
            .insert(user_id.to_string(), calendars.clone());
        Ok(calendars)
    }

    pub fn change_calendar(&self, user_id: &str, calendar_id: &str) -> Result<(), SyncError> {
        let calendar_id = calendar_id.trim();
        if calendar_id.is_empty() {
            return Err(DbError::Validation("Calendar id is required".to_string()).into());
        }
        match self.db.lock().set_calendar_id(user_id, calendar_id) {
            Ok(()) => Ok(()),
            Err(DbError::NotFound { .. }) => Err(SyncError::NotConnected),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// External events in the sync window that no Activity owns yet.
    pub async fn import_external_events(
        &self,
        user_id: &str,
    ) -> Result<Vec<CalendarEvent>, SyncError> {
        let session = self.session(user_id).await?;
        self.import_with(&session).await
    }

    /// Create an external event for every dated, unlinked Activity.
    /// Returns how many Activities were linked. Shares the per-user guard
    /// with `sync_events`.
    pub async fn export_local_activities(&self, user_id: &str) -> Result<usize, SyncError> {
        let _permit = self
            .guard
            .try_acquire(user_id)
            .ok_or(SyncError::AlreadyRunning)?;

        let session = self.session(user_id).await?;
        self.export_with(&session).await
    }

    /// Import then export, then stamp `last_sync`.
    pub async fn sync_events(&self, user_id: &str) -> Result<SyncSummary, SyncError> {
        let _permit = self
            .guard
            .try_acquire(user_id)
            .ok_or(SyncError::AlreadyRunning)?;

        let session = self.session(user_id).await?;
        let imported = self.import_with(&session).await?;
        let exported = self.export_with(&session).await?;

        let last_sync = now_rfc3339();
        self.db.lock().set_calendar_last_sync(user_id, &last_sync)?;

        log::info!(
            "Calendar sync for {}: {} external events, {} activities exported",
            user_id,
            imported.len(),
            exported
        );
        Ok(SyncSummary {
            google_to_crm: imported.len(),
            crm_to_google: exported,
            last_sync,
        })
    }

    pub fn is_syncing(&self, user_id: &str) -> bool {
        self.guard.is_running(user_id)
    }

    async fn import_with(&self, session: &Session) -> Result<Vec<CalendarEvent>, SyncError> {
        let time_min = Utc::now();
        let time_max = time_min
            .checked_add_signed(chrono::Duration::days(i64::from(self.settings.window_days)))
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
        let events = self
            .provider
            .list_events(&session.access_token, &session.calendar_id, time_min, time_max)
            .await?;

        let linked = self.db.lock().linked_event_ids(&session.user_id)?;
        Ok(events
            .into_iter()
            .filter(|e| !e.id.is_empty() && !linked.contains(&e.id))
            .collect())
    }

    async fn export_with(&self, session: &Session) -> Result<usize, SyncError> {
        let pending = self.db.lock().unlinked_dated_activities(&session.user_id)?;
        let mut linked = 0;

        for activity in pending {
            let Some(payload) = self.payload_for(&activity) else {
                continue;
            };
            let event = match self
                .provider
                .insert_event(&session.access_token, &session.calendar_id, &payload)
                .await
            {
                Ok(event) => event,
                // Every remaining insert would fail the same way.
                Err(e) if e.is_auth_expired() => return Err(e.into()),
                Err(e) => {
                    log::warn!("Failed to export activity {}: {}", activity.id, e);
                    continue;
                }
            };
            if event.id.is_empty() {
                log::warn!("Google returned no event id for activity {}", activity.id);
                continue;
            }

            let stored = self
                .db
                .lock()
                .link_activity_event(&session.user_id, &activity.id, &event.id);
            match stored {
                Ok(true) => linked += 1,
                Ok(false) => log::warn!(
                    "Activity {} was linked elsewhere; event {} left unlinked",
                    activity.id,
                    event.id
                ),
                Err(e) => log::error!(
                    "Failed to record event {} on activity {}: {}",
                    event.id,
                    activity.id,
                    e
                ),
            }
        }
        Ok(linked)
    }

    // =========================================================================
    // Mirrored edits
    // =========================================================================

    /// Update an Activity locally and, when linked, mirror the visible fields
    /// to its external event.
    pub async fn update_linked_activity(
        &self,
        user_id: &str,
        activity_id: &str,
        update: &ActivityUpdate,
    ) -> Result<Activity, SyncError> {
        let activity = self.db.lock().update_activity(user_id, activity_id, update)?;
        if !activity.is_linked() || !update.touches_calendar_fields() {
            return Ok(activity);
        }
        if self.settings.conflict_policy == ConflictPolicy::PreserveRemote {
            log::debug!("Keeping remote event for activity {} untouched", activity.id);
            return Ok(activity);
        }

        match self.mirror_update(user_id, &activity).await {
            Ok(()) => {}
            Err(SyncError::NotConnected) => {
                log::debug!("Calendar not connected; activity {} updated locally only", activity.id)
            }
            Err(e) => log::warn!(
                "Failed to mirror activity {} to Google Calendar: {}",
                activity.id,
                e
            ),
        }
        Ok(activity)
    }

    async fn mirror_update(&self, user_id: &str, activity: &Activity) -> Result<(), SyncError> {
        let (Some(event_id), Some(payload)) =
            (activity.google_event_id.as_deref(), self.payload_for(activity))
        else {
            return Ok(());
        };
        let session = self.session(user_id).await?;
        self.provider
            .update_event(&session.access_token, &session.calendar_id, event_id, &payload)
            .await?;
        Ok(())
    }

    /// Remove the external event (best effort), then the Activity.
    pub async fn delete_linked_activity(
        &self,
        user_id: &str,
        activity_id: &str,
    ) -> Result<(), SyncError> {
        let activity = self.db.lock().get_activity(user_id, activity_id)?;

        if let Some(event_id) = activity.google_event_id.as_deref().filter(|id| !id.is_empty()) {
            let removed = match self.session(user_id).await {
                Ok(session) => self
                    .provider
                    .delete_event(&session.access_token, &session.calendar_id, event_id)
                    .await
                    .map_err(SyncError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = removed {
                log::warn!(
                    "Failed to delete Google event {} for activity {}: {}",
                    event_id,
                    activity.id,
                    e
                );
            }
        }

        self.db.lock().delete_activity(user_id, activity_id)?;
        Ok(())
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    /// Connected session for `user_id`, refreshing the access token first
    /// when its stored expiry has passed.
    async fn session(&self, user_id: &str) -> Result<Session, SyncError> {
        let row = self.db.lock().get_calendar_integration(user_id)?;
        let row = match row {
            Some(row) if row.sync_enabled && !row.access_token.is_empty() => row,
            _ => return Err(SyncError::NotConnected),
        };

        let access_token = if is_token_expired(row.token_expiry.as_deref()) {
            self.refresh(&row).await?
        } else {
            row.access_token
        };
        Ok(Session {
            user_id: user_id.to_string(),
            access_token,
            calendar_id: row.calendar_id,
        })
    }

    async fn refresh(&self, row: &CalendarIntegration) -> Result<String, SyncError> {
        let Some(refresh_token) = row.refresh_token.as_deref() else {
            return Err(GoogleApiError::AuthExpired.into());
        };
        let token = refresh_access_token(&self.http, self.oauth()?, refresh_token).await?;
        self.db.lock().update_calendar_access_token(
            &row.user_id,
            &token.access_token,
            token.refresh_token.as_deref(),
            token.expiry().as_deref(),
        )?;
        log::info!("Refreshed Google Calendar token for user {}", row.user_id);
        Ok(token.access_token)
    }

    fn payload_for(&self, activity: &Activity) -> Option<EventPayload> {
        event_payload_for(
            activity,
            self.settings.timezone.name(),
            self.settings.default_duration_minutes,
        )
    }
}

/// Upsert the Integration Config row from a token exchange.
pub fn store_calendar_tokens(
    db: &SharedDb,
    user_id: &str,
    token: &TokenResponse,
) -> Result<CalendarIntegration, DbError> {
    db.lock().upsert_calendar_tokens(
        user_id,
        &token.access_token,
        token.refresh_token.as_deref(),
        token.expiry().as_deref(),
    )
}

/// External event body for a dated Activity; `None` when it has no due date.
pub fn event_payload_for(
    activity: &Activity,
    timezone: &str,
    duration_minutes: u32,
) -> Option<EventPayload> {
    let start = activity.due_date?;
    let end = start + chrono::Duration::minutes(i64::from(duration_minutes));
    Some(EventPayload {
        summary: activity.title.clone(),
        description: activity.description.clone(),
        start: wall_clock(start, timezone),
        end: wall_clock(end, timezone),
        reminders: Some(Reminders::crm_defaults()),
    })
}

fn wall_clock(at: NaiveDateTime, timezone: &str) -> EventDateTime {
    EventDateTime {
        date_time: Some(at.format(LOCAL_FORMAT).to_string()),
        date: None,
        time_zone: Some(timezone.to_string()),
    }
}

/// pt-BR display of the last sync time, or "Nunca".
pub fn last_sync_label(last_sync: Option<&str>, tz: Tz) -> String {
    last_sync
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| {
            dt.with_timezone(&tz)
                .format("%d/%m/%Y %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "Nunca".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate};
    use parking_lot::Mutex;

    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{ActivityType, NewActivity};

    /// In-memory calendar. Inserted events become visible to `list_events`.
    #[derive(Default)]
    struct FakeProvider {
        events: Mutex<Vec<CalendarEvent>>,
        inserted: Mutex<Vec<EventPayload>>,
        updated: Mutex<Vec<(String, EventPayload)>>,
        deleted: Mutex<Vec<String>>,
        fail_titles: Vec<String>,
        fail_updates: bool,
        fail_deletes: bool,
        list_delay: Option<Duration>,
        next_id: AtomicUsize,
    }

    fn api_error() -> GoogleApiError {
        GoogleApiError::ApiError {
            status: 500,
            message: "backend error".to_string(),
        }
    }

    #[async_trait]
    impl CalendarProvider for FakeProvider {
        async fn list_events(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _time_min: DateTime<Utc>,
            _time_max: DateTime<Utc>,
        ) -> Result<Vec<CalendarEvent>, GoogleApiError> {
            if let Some(delay) = self.list_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.events.lock().clone())
        }

        async fn insert_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            payload: &EventPayload,
        ) -> Result<CalendarEvent, GoogleApiError> {
            if self.fail_titles.contains(&payload.summary) {
                return Err(api_error());
            }
            let id = format!("evt{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let event = CalendarEvent {
                id,
                summary: Some(payload.summary.clone()),
                description: payload.description.clone(),
                start: payload.start.clone(),
                end: payload.end.clone(),
                status: Some("confirmed".to_string()),
                html_link: None,
            };
            self.inserted.lock().push(payload.clone());
            self.events.lock().push(event.clone());
            Ok(event)
        }

        async fn update_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            event_id: &str,
            payload: &EventPayload,
        ) -> Result<CalendarEvent, GoogleApiError> {
            if self.fail_updates {
                return Err(api_error());
            }
            self.updated
                .lock()
                .push((event_id.to_string(), payload.clone()));
            Ok(CalendarEvent {
                id: event_id.to_string(),
                summary: Some(payload.summary.clone()),
                description: payload.description.clone(),
                start: payload.start.clone(),
                end: payload.end.clone(),
                status: None,
                html_link: None,
            })
        }

        async fn delete_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            event_id: &str,
        ) -> Result<(), GoogleApiError> {
            if self.fail_deletes {
                return Err(api_error());
            }
            self.deleted.lock().push(event_id.to_string());
            Ok(())
        }

        async fn list_calendars(
            &self,
            _access_token: &str,
        ) -> Result<Vec<CalendarListEntry>, GoogleApiError> {
            Ok(vec![CalendarListEntry {
                id: "primary".to_string(),
                summary: "Agenda".to_string(),
                primary: true,
                access_role: Some("owner".to_string()),
            }])
        }
    }

    fn external(id: &str, title: &str) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            summary: Some(title.to_string()),
            description: None,
            start: EventDateTime {
                date_time: Some("2024-06-02T10:00:00-03:00".to_string()),
                ..Default::default()
            },
            end: EventDateTime {
                date_time: Some("2024-06-02T11:00:00-03:00".to_string()),
                ..Default::default()
            },
            status: Some("confirmed".to_string()),
            html_link: None,
        }
    }

    fn setup(provider: FakeProvider) -> (CalendarSync, SharedDb, Arc<FakeProvider>) {
        let db = test_db().into_shared();
        db.lock()
            .upsert_calendar_tokens("u1", "access", Some("refresh"), None)
            .unwrap();
        let provider = Arc::new(provider);
        let sync = CalendarSync::new(
            Arc::clone(&db),
            provider.clone(),
            reqwest::Client::new(),
            None,
            SyncSettings::default(),
        );
        (sync, db, provider)
    }

    fn due(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn activity(db: &SharedDb, title: &str, due_date: Option<NaiveDateTime>) -> Activity {
        let mut input = NewActivity::new(title, ActivityType::Call);
        input.due_date = due_date;
        db.lock().create_activity("u1", &input).unwrap()
    }

    #[test]
    fn test_event_payload_uses_default_duration() {
        let db = test_db().into_shared();
        let client_call = activity(&db, "Client Call", Some(due(1, 9)));
        let payload = event_payload_for(&client_call, "America/Sao_Paulo", 60).unwrap();

        assert_eq!(payload.summary, "Client Call");
        assert_eq!(payload.start.date_time.as_deref(), Some("2024-06-01T09:00:00"));
        assert_eq!(payload.end.date_time.as_deref(), Some("2024-06-01T10:00:00"));
        assert_eq!(payload.start.time_zone.as_deref(), Some("America/Sao_Paulo"));

        let undated = activity(&db, "Sem data", None);
        assert!(event_payload_for(&undated, "UTC", 60).is_none());
    }

    #[tokio::test]
    async fn test_export_links_each_dated_activity_once() {
        let (sync, db, provider) = setup(FakeProvider::default());
        let first = activity(&db, "Client Call", Some(due(1, 9)));
        let second = activity(&db, "Follow up", Some(due(3, 14)));
        activity(&db, "Undated", None);

        assert_eq!(sync.export_local_activities("u1").await.unwrap(), 2);
        assert_eq!(sync.export_local_activities("u1").await.unwrap(), 0);
        assert_eq!(provider.inserted.lock().len(), 2);

        let first = db.lock().get_activity("u1", &first.id).unwrap();
        let second = db.lock().get_activity("u1", &second.id).unwrap();
        assert!(first.is_linked());
        assert!(second.is_linked());
        assert_ne!(first.google_event_id, second.google_event_id);

        let inserted = provider.inserted.lock();
        assert_eq!(inserted[0].summary, "Client Call");
        assert_eq!(inserted[0].start.date_time.as_deref(), Some("2024-06-01T09:00:00"));
    }

    #[tokio::test]
    async fn test_export_skips_failures_and_counts_linked_only() {
        let (sync, db, _provider) = setup(FakeProvider {
            fail_titles: vec!["Broken".to_string()],
            ..Default::default()
        });
        let broken = activity(&db, "Broken", Some(due(1, 9)));
        activity(&db, "Fine", Some(due(2, 9)));

        assert_eq!(sync.export_local_activities("u1").await.unwrap(), 1);
        assert!(!db.lock().get_activity("u1", &broken.id).unwrap().is_linked());
    }

    #[tokio::test]
    async fn test_import_drops_events_owned_by_activities() {
        let provider = FakeProvider::default();
        provider.events.lock().push(external("ext-1", "Almoço"));
        let (sync, db, _provider) = setup(provider);
        activity(&db, "Client Call", Some(due(1, 9)));

        sync.export_local_activities("u1").await.unwrap();
        let imported = sync.import_external_events("u1").await.unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].id, "ext-1");
    }

    #[tokio::test]
    async fn test_sync_events_reports_both_directions_and_stamps() {
        let provider = FakeProvider::default();
        provider.events.lock().push(external("ext-1", "Almoço"));
        let (sync, db, _provider) = setup(provider);
        activity(&db, "Client Call", Some(due(1, 9)));

        let summary = sync.sync_events("u1").await.unwrap();
        assert_eq!(summary.google_to_crm, 1);
        assert_eq!(summary.crm_to_google, 1);

        let row = db.lock().get_calendar_integration("u1").unwrap().unwrap();
        assert_eq!(row.last_sync.as_deref(), Some(summary.last_sync.as_str()));
        assert!(!sync.is_syncing("u1"));
    }

    #[tokio::test]
    async fn test_concurrent_sync_for_same_user_is_rejected() {
        let (sync, _db, _provider) = setup(FakeProvider {
            list_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        let (first, second) = tokio::join!(sync.sync_events("u1"), sync.sync_events("u1"));
        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::AlreadyRunning)));
        assert!(sync.sync_events("u1").await.is_ok());
    }

    #[tokio::test]
    async fn test_export_during_sync_is_rejected() {
        let (sync, db, provider) = setup(FakeProvider {
            list_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let call = activity(&db, "Client Call", Some(due(1, 9)));

        let (synced, exported) =
            tokio::join!(sync.sync_events("u1"), sync.export_local_activities("u1"));
        assert_eq!(synced.unwrap().crm_to_google, 1);
        assert!(matches!(exported, Err(SyncError::AlreadyRunning)));
        assert_eq!(provider.inserted.lock().len(), 1);
        assert!(db.lock().get_activity("u1", &call.id).unwrap().is_linked());

        assert_eq!(sync.export_local_activities("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow() {
        let (mut sync, _db, _provider) = setup(FakeProvider::default());
        sync.settings.window_days = u32::MAX;
        assert!(sync.import_external_events("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_requires_connection() {
        let (sync, _db, _provider) = setup(FakeProvider::default());
        assert!(matches!(
            sync.sync_events("stranger").await,
            Err(SyncError::NotConnected)
        ));

        sync.disconnect("u1").unwrap();
        assert!(matches!(
            sync.export_local_activities("u1").await,
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_update_mirrors_linked_activity() {
        let (sync, db, provider) = setup(FakeProvider::default());
        let call = activity(&db, "Client Call", Some(due(1, 9)));
        sync.export_local_activities("u1").await.unwrap();

        let update = ActivityUpdate {
            title: Some("Client Call (remarcada)".to_string()),
            due_date: Some(due(1, 15)),
            ..Default::default()
        };
        let updated = sync
            .update_linked_activity("u1", &call.id, &update)
            .await
            .unwrap();
        assert_eq!(updated.title, "Client Call (remarcada)");

        let mirrored = provider.updated.lock();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(Some(mirrored[0].0.clone()), updated.google_event_id);
        assert_eq!(
            mirrored[0].1.end.date_time.as_deref(),
            Some("2024-06-01T16:00:00")
        );
    }

    #[tokio::test]
    async fn test_mirror_failure_keeps_local_update() {
        let (sync, db, _provider) = setup(FakeProvider {
            fail_updates: true,
            ..Default::default()
        });
        let call = activity(&db, "Client Call", Some(due(1, 9)));
        sync.export_local_activities("u1").await.unwrap();

        let update = ActivityUpdate {
            title: Some("Renamed".to_string()),
            ..Default::default()
        };
        sync.update_linked_activity("u1", &call.id, &update)
            .await
            .unwrap();
        assert_eq!(db.lock().get_activity("u1", &call.id).unwrap().title, "Renamed");
    }

    #[tokio::test]
    async fn test_preserve_remote_never_rewrites_events() {
        let db = test_db().into_shared();
        db.lock()
            .upsert_calendar_tokens("u1", "access", None, None)
            .unwrap();
        let provider = Arc::new(FakeProvider::default());
        let sync = CalendarSync::new(
            Arc::clone(&db),
            provider.clone(),
            reqwest::Client::new(),
            None,
            SyncSettings {
                conflict_policy: ConflictPolicy::PreserveRemote,
                ..Default::default()
            },
        );
        let call = activity(&db, "Client Call", Some(due(1, 9)));
        sync.export_local_activities("u1").await.unwrap();

        let update = ActivityUpdate {
            title: Some("Renamed".to_string()),
            ..Default::default()
        };
        sync.update_linked_activity("u1", &call.id, &update)
            .await
            .unwrap();
        assert!(provider.updated.lock().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_remote_then_local_even_on_remote_failure() {
        let (sync, db, provider) = setup(FakeProvider::default());
        let call = activity(&db, "Client Call", Some(due(1, 9)));
        sync.export_local_activities("u1").await.unwrap();
        let event_id = db
            .lock()
            .get_activity("u1", &call.id)
            .unwrap()
            .google_event_id
            .unwrap();

        sync.delete_linked_activity("u1", &call.id).await.unwrap();
        assert_eq!(provider.deleted.lock().as_slice(), &[event_id]);
        assert!(db.lock().get_activity("u1", &call.id).is_err());

        let (failing, db, _provider) = setup(FakeProvider {
            fail_deletes: true,
            ..Default::default()
        });
        let other = activity(&db, "Other", Some(due(2, 9)));
        failing.export_local_activities("u1").await.unwrap();
        failing.delete_linked_activity("u1", &other.id).await.unwrap();
        assert!(db.lock().get_activity("u1", &other.id).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_links_and_clears_display_state() {
        let (sync, db, _provider) = setup(FakeProvider::default());
        let call = activity(&db, "Client Call", Some(due(1, 9)));
        sync.sync_events("u1").await.unwrap();
        sync.list_calendars("u1").await.unwrap();
        assert!(sync.status("u1").unwrap().calendars.is_some());

        sync.disconnect("u1").unwrap();

        let status = sync.status("u1").unwrap();
        assert!(!status.connected);
        assert!(status.calendars.is_none());
        assert!(status.last_sync.is_none());
        assert_eq!(status.last_sync_label, "Nunca");

        let row = db.lock().get_calendar_integration("u1").unwrap().unwrap();
        assert!(!row.sync_enabled);
        assert!(db.lock().get_activity("u1", &call.id).unwrap().is_linked());
    }

    #[tokio::test]
    async fn test_expired_token_without_oauth_client_is_auth_error() {
        let (sync, db, _provider) = setup(FakeProvider::default());
        db.lock()
            .update_calendar_access_token("u1", "stale", None, Some("2000-01-01T00:00:00Z"))
            .unwrap();
        let err = sync.export_local_activities("u1").await.unwrap_err();
        assert!(matches!(err, SyncError::NotConfigured(_)));
    }

    #[test]
    fn test_change_calendar_and_status_label() {
        let (sync, _db, _provider) = setup(FakeProvider::default());
        sync.change_calendar("u1", "team@group.calendar.google.com")
            .unwrap();
        let status = sync.status("u1").unwrap();
        assert!(status.connected);
        assert!(!status.configured);
        assert_eq!(
            status.calendar_id.as_deref(),
            Some("team@group.calendar.google.com")
        );
        assert_eq!(status.last_sync_label, "Nunca");

        assert!(matches!(
            sync.change_calendar("stranger", "primary"),
            Err(SyncError::NotConnected)
        ));
        assert_eq!(
            last_sync_label(Some("2024-06-01T15:30:00Z"), chrono_tz::America::Sao_Paulo),
            "01/06/2024 12:30"
        );
    }
}
