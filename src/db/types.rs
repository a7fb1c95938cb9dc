use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Errors specific to database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Validation(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Closed set of lowercase values stored in a TEXT column.
macro_rules! text_enum {
    (@label ActivityType) => { "type" };
    (@label NotificationType) => { "type" };
    (@label IntegrationKind) => { "type" };
    (@label InterestLevel) => { "interest level" };
    (@label NotificationCategory) => { "category" };
    (@label Priority) => { "priority" };
    (@label ChatPlatform) => { "platform" };
    (@label SenderType) => { "sender type" };
    (@label MessageType) => { "message type" };
    (@label $other:ident) => { "status" };
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            fn allowed() -> String {
                Self::ALL.iter().map(|v| v.as_str()).collect::<Vec<_>>().join(", ")
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DbError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(DbError::Validation(format!(
                        "Invalid {}. Must be one of: {}",
                        text_enum!(@label $name),
                        Self::allowed()
                    ))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: DbError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

// =============================================================================
// CRM entities
// =============================================================================

text_enum!(ContactStatus { Active => "active", Inactive => "inactive" });

text_enum!(LeadStatus {
    New => "new",
    Contacted => "contacted",
    Qualified => "qualified",
    Lost => "lost",
});

text_enum!(InterestLevel {
    MuitoFrio => "muito_frio",
    Frio => "frio",
    Morno => "morno",
    Quente => "quente",
    MuitoQuente => "muito_quente",
});

text_enum!(DealStatus {
    Prospecting => "prospecting",
    Negotiation => "negotiation",
    ClosedWon => "closed_won",
    ClosedLost => "closed_lost",
});

text_enum!(ActivityType {
    Call => "call",
    Email => "email",
    Meeting => "meeting",
    Task => "task",
});

text_enum!(ActivityStatus {
    Pending => "pending",
    Completed => "completed",
    Cancelled => "cancelled",
});

/// Storage and wire format for `Activity::due_date`: local wall-clock time.
pub const DUE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Accepts `YYYY-MM-DDTHH:MM:SS` and the seconds-less `YYYY-MM-DDTHH:MM`.
pub fn parse_due_date(value: &str) -> Result<NaiveDateTime, DbError> {
    let trimmed = value.trim();
    NaiveDateTime::parse_from_str(trimmed, DUE_DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M"))
        .map_err(|_| DbError::Validation(format!("Invalid due date: {}", value)))
}

pub fn format_due_date(value: &NaiveDateTime) -> String {
    value.format(DUE_DATE_FORMAT).to_string()
}

fn email_regex() -> &'static Regex {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE.get_or_init(|| {
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex should compile")
    })
}

pub fn validate_email(email: &str) -> Result<(), DbError> {
    if email_regex().is_match(email.trim()) {
        Ok(())
    } else {
        Err(DbError::Validation("Invalid email format".to_string()))
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub position: Option<String>,
    pub status: ContactStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub status: Option<ContactStatus>,
}

impl NewContact {
    pub fn validate(&self) -> Result<(), DbError> {
        if is_blank(&self.name) || is_blank(&self.email) {
            return Err(DbError::Validation(
                "Name and email are required fields".to_string(),
            ));
        }
        validate_email(&self.email)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub position: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContactFilter {
    pub status: Option<ContactStatus>,
    /// Case-insensitive match on name, email or company.
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub source: String,
    pub status: LeadStatus,
    pub interest_level: InterestLevel,
    pub value: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLead {
    pub name: String,
    pub email: String,
    pub source: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub status: Option<LeadStatus>,
    #[serde(default)]
    pub interest_level: Option<InterestLevel>,
    #[serde(default)]
    pub value: Option<f64>,
}

impl NewLead {
    pub fn validate(&self) -> Result<(), DbError> {
        if is_blank(&self.name) || is_blank(&self.email) || is_blank(&self.source) {
            return Err(DbError::Validation(
                "Name, email and source are required fields".to_string(),
            ));
        }
        validate_email(&self.email)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub source: Option<String>,
    pub interest_level: Option<InterestLevel>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct LeadFilter {
    pub status: Option<LeadStatus>,
    pub interest_level: Option<InterestLevel>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub value: f64,
    pub status: DealStatus,
    pub contact_id: String,
    pub expected_close_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Deal {
    /// Value formatted for notification text, e.g. `R$ 15000.00`.
    pub fn value_label(&self) -> String {
        format!("R$ {:.2}", self.value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDeal {
    pub title: String,
    pub value: f64,
    pub contact_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<DealStatus>,
    #[serde(default)]
    pub expected_close_date: Option<String>,
}

fn validate_close_date(date: Option<&str>) -> Result<(), DbError> {
    match date {
        Some(d) if chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").is_err() => Err(
            DbError::Validation(format!("Invalid expected close date: {}", d)),
        ),
        _ => Ok(()),
    }
}

fn validate_deal_value(value: f64) -> Result<(), DbError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DbError::Validation(
            "Value must be a positive number".to_string(),
        ))
    }
}

impl NewDeal {
    pub fn validate(&self) -> Result<(), DbError> {
        if is_blank(&self.title) {
            return Err(DbError::Validation(
                "Title and value are required fields".to_string(),
            ));
        }
        validate_deal_value(self.value)?;
        validate_close_date(self.expected_close_date.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub value: Option<f64>,
    pub contact_id: Option<String>,
    pub expected_close_date: Option<String>,
}

impl DealUpdate {
    pub fn validate(&self) -> Result<(), DbError> {
        if let Some(value) = self.value {
            validate_deal_value(value)?;
        }
        validate_close_date(self.expected_close_date.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DealFilter {
    pub status: Option<DealStatus>,
    pub contact_id: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub status: ActivityStatus,
    pub due_date: Option<NaiveDateTime>,
    pub contact_id: Option<String>,
    pub deal_id: Option<String>,
    pub google_event_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Activity {
    /// Linked to exactly one external calendar event.
    pub fn is_linked(&self) -> bool {
        self.google_event_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewActivity {
    pub title: String,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<ActivityStatus>,
    #[serde(default)]
    pub due_date: Option<NaiveDateTime>,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub deal_id: Option<String>,
}

impl NewActivity {
    pub fn new(title: impl Into<String>, activity_type: ActivityType) -> Self {
        Self {
            title: title.into(),
            activity_type,
            description: None,
            status: None,
            due_date: None,
            contact_id: None,
            deal_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if is_blank(&self.title) {
            return Err(DbError::Validation(
                "Title and type are required fields".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub activity_type: Option<ActivityType>,
    pub status: Option<ActivityStatus>,
    pub due_date: Option<NaiveDateTime>,
    pub contact_id: Option<String>,
    pub deal_id: Option<String>,
}

impl ActivityUpdate {
    /// Whether the change is visible on the external calendar event.
    pub fn touches_calendar_fields(&self) -> bool {
        self.title.is_some() || self.description.is_some() || self.due_date.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub status: Option<ActivityStatus>,
    pub activity_type: Option<ActivityType>,
    pub contact_id: Option<String>,
    pub deal_id: Option<String>,
    pub title: Option<String>,
    pub due_after: Option<NaiveDateTime>,
    pub due_before: Option<NaiveDateTime>,
}

// =============================================================================
// Calendar integration config
// =============================================================================

/// One row per user. Tokens never leave the backend through serialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarIntegration {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expiry: Option<String>,
    pub calendar_id: String,
    pub sync_enabled: bool,
    pub last_sync: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// =============================================================================
// Integrations
// =============================================================================

text_enum!(IntegrationKind {
    Whatsapp => "whatsapp",
    N8n => "n8n",
    Zapier => "zapier",
    Slack => "slack",
    Sendgrid => "sendgrid",
    Webhook => "webhook",
});

text_enum!(IntegrationStatus {
    Active => "active",
    Inactive => "inactive",
    Error => "error",
});

text_enum!(LogStatus { Success => "success", Error => "error" });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: IntegrationKind,
    pub config: serde_json::Value,
    pub status: IntegrationStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl Integration {
    /// String field from the JSON config, if present and non-empty.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIntegration {
    pub name: String,
    pub kind: IntegrationKind,
    pub config: serde_json::Value,
    pub status: IntegrationStatus,
}

impl NewIntegration {
    /// Validate raw input: name and type required, type and status in range.
    pub fn parse(
        name: Option<&str>,
        kind: Option<&str>,
        config: Option<serde_json::Value>,
        status: Option<&str>,
    ) -> Result<Self, DbError> {
        let (Some(name), Some(kind)) = (
            name.filter(|s| !is_blank(s)),
            kind.filter(|s| !is_blank(s)),
        ) else {
            return Err(DbError::Validation(
                "Name and type are required fields".to_string(),
            ));
        };
        let kind: IntegrationKind = kind.parse()?;
        let status = match status {
            Some(s) => s.parse()?,
            None => IntegrationStatus::Inactive,
        };
        Ok(Self {
            name: name.trim().to_string(),
            kind,
            config: config.unwrap_or_else(|| serde_json::json!({})),
            status,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationLog {
    pub id: String,
    pub integration_id: String,
    pub action: String,
    pub status: LogStatus,
    pub request_data: Option<serde_json::Value>,
    pub response_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: String,
}

// =============================================================================
// Notifications
// =============================================================================

text_enum!(NotificationType {
    Info => "info",
    Success => "success",
    Warning => "warning",
    Error => "error",
    Reminder => "reminder",
});

text_enum!(NotificationCategory {
    Lead => "lead",
    Contact => "contact",
    Deal => "deal",
    Activity => "activity",
    System => "system",
    Integration => "integration",
});

text_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: NotificationCategory,
    pub priority: Priority,
    pub read: bool,
    pub action_url: Option<String>,
    pub action_label: Option<String>,
    pub metadata: serde_json::Value,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    pub user_id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: NotificationCategory,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub action_label: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub expires_at: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl NewNotification {
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        notification_type: NotificationType,
        category: NotificationCategory,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            title: title.into(),
            message: message.into(),
            notification_type,
            category,
            priority: Priority::default(),
            action_url: None,
            action_label: None,
            metadata: empty_object(),
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationTemplate {
    pub id: String,
    pub name: String,
    pub title_template: String,
    pub message_template: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: NotificationCategory,
    pub priority: Priority,
    pub action_url_template: Option<String>,
    pub action_label: Option<String>,
    /// Declared placeholder names, informational only.
    pub variables: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelToggles {
    pub email: bool,
    pub push: bool,
    pub in_app: bool,
}

impl Default for ChannelToggles {
    fn default() -> Self {
        Self {
            email: true,
            push: true,
            in_app: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    pub user_id: String,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub in_app_enabled: bool,
    pub categories: BTreeMap<NotificationCategory, ChannelToggles>,
    pub quiet_hours_start: String,
    pub quiet_hours_end: String,
    pub timezone: String,
}

impl NotificationPreferences {
    pub fn defaults_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            email_enabled: true,
            push_enabled: true,
            in_app_enabled: true,
            categories: NotificationCategory::ALL
                .iter()
                .map(|c| (*c, ChannelToggles::default()))
                .collect(),
            quiet_hours_start: "22:00".to_string(),
            quiet_hours_end: "08:00".to_string(),
            timezone: "America/Sao_Paulo".to_string(),
        }
    }

    pub fn apply(&mut self, update: PreferencesUpdate) {
        if let Some(v) = update.email_enabled {
            self.email_enabled = v;
        }
        if let Some(v) = update.push_enabled {
            self.push_enabled = v;
        }
        if let Some(v) = update.in_app_enabled {
            self.in_app_enabled = v;
        }
        if let Some(categories) = update.categories {
            self.categories.extend(categories);
        }
        if let Some(v) = update.quiet_hours_start {
            self.quiet_hours_start = v;
        }
        if let Some(v) = update.quiet_hours_end {
            self.quiet_hours_end = v;
        }
        if let Some(v) = update.timezone {
            self.timezone = v;
        }
    }
}

/// Partial preferences; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesUpdate {
    pub email_enabled: Option<bool>,
    pub push_enabled: Option<bool>,
    pub in_app_enabled: Option<bool>,
    pub categories: Option<BTreeMap<NotificationCategory, ChannelToggles>>,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub timezone: Option<String>,
}

// =============================================================================
// Chat
// =============================================================================

text_enum!(ChatPlatform {
    Whatsapp => "whatsapp",
    Instagram => "instagram",
    Telegram => "telegram",
    Internal => "internal",
});

text_enum!(SenderType { User => "user", Contact => "contact" });

text_enum!(MessageType {
    Text => "text",
    Image => "image",
    File => "file",
    Audio => "audio",
    Video => "video",
});

text_enum!(ConversationStatus {
    Active => "active",
    Archived => "archived",
    Blocked => "blocked",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub contact_avatar: Option<String>,
    pub platform: ChatPlatform,
    pub platform_contact_id: Option<String>,
    pub last_message: Option<String>,
    pub last_message_time: Option<String>,
    pub unread_count: u32,
    pub status: ConversationStatus,
    pub contact_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub contact_name: String,
    pub contact_phone: String,
    pub platform: ChatPlatform,
    #[serde(default)]
    pub contact_avatar: Option<String>,
    #[serde(default)]
    pub platform_contact_id: Option<String>,
    #[serde(default)]
    pub status: Option<ConversationStatus>,
    #[serde(default)]
    pub contact_id: Option<String>,
}

impl NewConversation {
    pub fn new(
        contact_name: impl Into<String>,
        contact_phone: impl Into<String>,
        platform: ChatPlatform,
    ) -> Self {
        Self {
            contact_name: contact_name.into(),
            contact_phone: contact_phone.into(),
            platform,
            contact_avatar: None,
            platform_contact_id: None,
            status: None,
            contact_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if is_blank(&self.contact_name) || is_blank(&self.contact_phone) {
            return Err(DbError::Validation(
                "Contact name and phone are required fields".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub platform: Option<ChatPlatform>,
    pub status: Option<ConversationStatus>,
    /// Case-insensitive match on contact name or last message.
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub content: String,
    pub sender_type: SenderType,
    pub sender_name: String,
    pub sender_id: Option<String>,
    pub message_type: MessageType,
    pub platform: ChatPlatform,
    pub platform_message_id: Option<String>,
    pub metadata: serde_json::Value,
    pub read: bool,
    pub created_at: String,
}

/// A message about to be stored. The platform comes from the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChatMessage {
    pub content: String,
    pub sender_type: SenderType,
    pub sender_name: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub platform_message_id: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

impl NewChatMessage {
    pub fn new(
        content: impl Into<String>,
        sender_type: SenderType,
        sender_name: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            sender_type,
            sender_name: sender_name.into(),
            sender_id: None,
            message_type: None,
            platform_message_id: None,
            metadata: empty_object(),
        }
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if is_blank(&self.content) || is_blank(&self.sender_name) {
            return Err(DbError::Validation(
                "Content and sender name are required fields".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub unread_only: bool,
    pub category: Option<NotificationCategory>,
    pub notification_type: Option<NotificationType>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    /// Total matching rows, ignoring limit and offset.
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_round_trip_and_error() {
        assert_eq!("closed_won".parse::<DealStatus>().unwrap(), DealStatus::ClosedWon);
        assert_eq!(InterestLevel::MuitoQuente.as_str(), "muito_quente");

        let err = "lunch".parse::<ActivityType>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid type. Must be one of: call, email, meeting, task"
        );
        let err = "done".parse::<ActivityStatus>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid status. Must be one of: pending, completed, cancelled"
        );
    }

    #[test]
    fn test_due_date_parsing() {
        let dt = parse_due_date("2024-06-01T09:00:00").unwrap();
        assert_eq!(format_due_date(&dt), "2024-06-01T09:00:00");
        let short = parse_due_date("2024-06-01T09:00").unwrap();
        assert_eq!(short, dt);
        assert!(parse_due_date("01/06/2024").is_err());
    }

    #[test]
    fn test_activity_serializes_type_and_due_date() {
        let activity = Activity {
            id: "a1".to_string(),
            user_id: "u1".to_string(),
            title: "Client Call".to_string(),
            description: None,
            activity_type: ActivityType::Call,
            status: ActivityStatus::Pending,
            due_date: Some(parse_due_date("2024-06-01T09:00:00").unwrap()),
            contact_id: None,
            deal_id: None,
            google_event_id: None,
            created_at: "2024-05-01T00:00:00Z".to_string(),
            updated_at: "2024-05-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_value(&activity).unwrap();
        assert_eq!(json["type"], "call");
        assert_eq!(json["dueDate"], "2024-06-01T09:00:00");
        assert!(!activity.is_linked());
    }

    #[test]
    fn test_new_contact_validation() {
        let mut contact = NewContact {
            name: "Ana".to_string(),
            email: "ana@exemplo.com".to_string(),
            ..Default::default()
        };
        assert!(contact.validate().is_ok());

        contact.email = "ana-at-exemplo".to_string();
        assert_eq!(
            contact.validate().unwrap_err().to_string(),
            "Invalid email format"
        );
        contact.name = " ".to_string();
        assert_eq!(
            contact.validate().unwrap_err().to_string(),
            "Name and email are required fields"
        );
    }

    #[test]
    fn test_new_deal_rejects_non_positive_value() {
        let deal = NewDeal {
            title: "Plano anual".to_string(),
            value: 0.0,
            contact_id: "c1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            deal.validate().unwrap_err().to_string(),
            "Value must be a positive number"
        );
    }

    #[test]
    fn test_new_integration_parse() {
        let ok = NewIntegration::parse(Some("Zap"), Some("zapier"), None, None).unwrap();
        assert_eq!(ok.status, IntegrationStatus::Inactive);
        assert_eq!(ok.config, serde_json::json!({}));

        let missing = NewIntegration::parse(Some("Zap"), None, None, None).unwrap_err();
        assert_eq!(missing.to_string(), "Name and type are required fields");

        let bad_type = NewIntegration::parse(Some("X"), Some("fax"), None, None).unwrap_err();
        assert_eq!(
            bad_type.to_string(),
            "Invalid type. Must be one of: whatsapp, n8n, zapier, slack, sendgrid, webhook"
        );

        let bad_status =
            NewIntegration::parse(Some("X"), Some("slack"), None, Some("paused")).unwrap_err();
        assert_eq!(
            bad_status.to_string(),
            "Invalid status. Must be one of: active, inactive, error"
        );
    }

    #[test]
    fn test_preferences_apply_partial_update() {
        let mut prefs = NotificationPreferences::defaults_for("u1");
        assert_eq!(prefs.categories.len(), NotificationCategory::ALL.len());

        let mut categories = BTreeMap::new();
        categories.insert(
            NotificationCategory::Deal,
            ChannelToggles {
                email: false,
                push: true,
                in_app: true,
            },
        );
        prefs.apply(PreferencesUpdate {
            push_enabled: Some(false),
            categories: Some(categories),
            ..Default::default()
        });

        assert!(!prefs.push_enabled);
        assert!(prefs.email_enabled);
        assert!(!prefs.categories[&NotificationCategory::Deal].email);
        assert!(prefs.categories[&NotificationCategory::Lead].email);
        assert_eq!(prefs.quiet_hours_start, "22:00");
    }
}
