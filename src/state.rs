//! Process-wide application context shared by the CLI and the server.

use std::time::Duration;

use crate::config::ConfigStore;
use crate::db::{CrmDb, SharedDb};
use crate::error::CrmError;
use crate::google_api::GoogleApiError;
use crate::integrations::IntegrationDispatcher;
use crate::notifications::NotificationService;
use crate::sync::CalendarSync;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AppContext {
    pub config: ConfigStore,
    pub db: SharedDb,
    pub http: reqwest::Client,
    pub calendar: CalendarSync,
    pub notifications: NotificationService,
    pub integrations: IntegrationDispatcher,
}

impl AppContext {
    /// Load `~/.nuvra/config.json` and open the configured database.
    pub fn init() -> Result<Self, CrmError> {
        Self::from_store(ConfigStore::load()?)
    }

    pub fn from_store(config: ConfigStore) -> Result<Self, CrmError> {
        let path = config.snapshot().database_path();
        let db = CrmDb::open_at(path)?.into_shared();
        Self::with_db(config, db)
    }

    pub fn with_db(config: ConfigStore, db: SharedDb) -> Result<Self, CrmError> {
        let snapshot = config.snapshot();
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(GoogleApiError::from)?;

        let notifications = NotificationService::new(db.clone());
        let integrations = IntegrationDispatcher::new(db.clone(), http.clone())
            .with_notifications(notifications.clone());
        let calendar = CalendarSync::from_config(db.clone(), http.clone(), &snapshot)?;

        if !snapshot.google.status().configured {
            log::info!("Google Calendar not configured; calendar commands are disabled");
        }

        Ok(Self {
            config,
            db,
            http,
            calendar,
            notifications,
            integrations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    #[test]
    fn test_context_without_google_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load_from(dir.path().join("config.json")).unwrap();
        let ctx = AppContext::with_db(store, test_db().into_shared()).unwrap();

        let status = ctx.calendar.status("u1").unwrap();
        assert!(!status.connected);
        assert_eq!(status.last_sync_label, "Nunca");
    }
}
