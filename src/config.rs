//! Application configuration.
//!
//! One serializable `AppConfig` owned by a process-wide `ConfigStore`.
//! The store loads `~/.nuvra/config.json` at session start (defaults when the
//! file is missing) and rewrites it atomically on every mutation. Environment
//! variables override the Google OAuth client and webhook secrets without
//! ever being written back to disk.

use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::google_api::{OAuthClient, RetryPolicy};
use crate::util::{atomic_write_str, nuvra_home};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),
    #[error("syncWindowDays must be between 1 and {MAX_SYNC_WINDOW_DAYS}, got {0}")]
    InvalidSyncWindow(u32),
    #[error("Google Calendar is not configured, missing: {}", .0.join(", "))]
    GoogleNotConfigured(Vec<&'static str>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    #[serde(default)]
    pub settings: UserSettings,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

/// Per-user presentation settings (theme, language, timezone).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default)]
    pub theme: Theme,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub notifications: bool,
}

fn default_language() -> String {
    "pt-BR".to_string()
}
fn default_timezone() -> String {
    "America/Sao_Paulo".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            language: default_language(),
            timezone: default_timezone(),
            notifications: true,
        }
    }
}

/// How edits on a linked Activity reach the external calendar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Local fields overwrite the external event on every mirrored update.
    /// The external side is only ever read.
    #[default]
    LocalWins,
    /// Linked events are created once and never rewritten afterwards.
    PreserveRemote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default = "default_sync_window_days")]
    pub sync_window_days: u32,
    #[serde(default = "default_duration_minutes")]
    pub default_duration_minutes: u32,
}

pub const MAX_SYNC_WINDOW_DAYS: u32 = 366;

fn default_sync_window_days() -> u32 {
    30
}
fn default_duration_minutes() -> u32 {
    60
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            conflict_policy: ConflictPolicy::default(),
            sync_window_days: default_sync_window_days(),
            default_duration_minutes: default_duration_minutes(),
        }
    }
}

/// Presence check for the OAuth client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigStatus {
    pub configured: bool,
    pub missing: Vec<&'static str>,
}

impl GoogleConfig {
    pub fn status(&self) -> ConfigStatus {
        let mut missing = Vec::new();
        if is_blank(&self.client_id) {
            missing.push("GOOGLE_CLIENT_ID");
        }
        if is_blank(&self.client_secret) {
            missing.push("GOOGLE_CLIENT_SECRET");
        }
        if is_blank(&self.redirect_uri) {
            missing.push("GOOGLE_REDIRECT_URI");
        }
        ConfigStatus {
            configured: missing.is_empty(),
            missing,
        }
    }

    /// Build the OAuth client, or report which settings are absent.
    pub fn oauth_client(&self) -> Result<OAuthClient, ConfigError> {
        let status = self.status();
        if !status.configured {
            return Err(ConfigError::GoogleNotConfigured(status.missing));
        }
        Ok(OAuthClient::google(
            self.client_id.clone().unwrap_or_default(),
            self.client_secret.clone().unwrap_or_default(),
            self.redirect_uri.clone().unwrap_or_default(),
        ))
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_token: Option<String>,
    /// Enables `X-Hub-Signature-256` checks on inbound deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,
    /// User whose chat inbox receives inbound WhatsApp messages. Deliveries
    /// are acknowledged without being stored when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3000
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            verify_token: None,
            app_secret: None,
            owner_user_id: None,
            port: default_port(),
        }
    }
}

impl AppConfig {
    /// Overlay environment-provided values using `lookup` (normally `std::env::var`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("GOOGLE_CLIENT_ID") {
            self.google.client_id = Some(v);
        }
        if let Some(v) = get("GOOGLE_CLIENT_SECRET") {
            self.google.client_secret = Some(v);
        }
        if let Some(v) = get("GOOGLE_REDIRECT_URI") {
            self.google.redirect_uri = Some(v);
        }
        if let Some(v) = get("WHATSAPP_VERIFY_TOKEN") {
            self.webhook.verify_token = Some(v);
        }
        if let Some(v) = get("WHATSAPP_APP_SECRET") {
            self.webhook.app_secret = Some(v);
        }
        if let Some(v) = get("WHATSAPP_OWNER_USER_ID") {
            self.webhook.owner_user_id = Some(v);
        }
        if let Some(port) = get("PORT").and_then(|v| v.parse().ok()) {
            self.webhook.port = port;
        }
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => nuvra_home().join("nuvra.db"),
        }
    }

    /// Reject values the sync bridge cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timezone()?;
        let window = self.google.sync_window_days;
        if !(1..=MAX_SYNC_WINDOW_DAYS).contains(&window) {
            return Err(ConfigError::InvalidSyncWindow(window));
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.settings
            .timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.settings.timezone.clone()))
    }
}

pub fn config_path() -> PathBuf {
    nuvra_home().join("config.json")
}

/// Read a config file. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig =
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

/// Process-wide owner of the configuration.
pub struct ConfigStore {
    path: PathBuf,
    stored: Mutex<AppConfig>,
}

impl ConfigStore {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(config_path())
    }

    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let stored = load_config_from(&path)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(Self {
            path,
            stored: Mutex::new(stored),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The effective configuration: stored values plus environment overrides.
    pub fn snapshot(&self) -> AppConfig {
        let mut config = self.stored.lock().clone();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Apply `mutator` to the stored config and persist it before returning.
    pub fn update(&self, mutator: impl FnOnce(&mut AppConfig)) -> Result<AppConfig, ConfigError> {
        let mut guard = self.stored.lock();
        let mut next = guard.clone();
        mutator(&mut next);
        next.validate()?;

        let content = serde_json::to_string_pretty(&next)?;
        atomic_write_str(&self.path, &content)?;
        *guard = next;
        drop(guard);

        Ok(self.snapshot())
    }
}
