//! Notification pipeline: persist, then publish in-process.
//!
//! Creation never fails the caller. A store failure is logged and yields
//! `None`; a notification with no live subscriber is simply not delivered
//! in real time. Subscribers that fall behind lose messages and re-list.

pub mod emitters;
pub mod template;

use tokio::sync::broadcast;

use crate::db::{
    DbError, NewNotification, Notification, NotificationPage, NotificationPreferences,
    NotificationQuery, PreferencesUpdate, SharedDb,
};

pub use template::{render, TemplateVars};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Database: {0}")]
    Db(#[from] DbError),
    #[error("{0}")]
    Validation(String),
}

#[derive(Clone)]
pub struct NotificationService {
    db: SharedDb,
    tx: broadcast::Sender<Notification>,
}

impl NotificationService {
    pub fn new(db: SharedDb) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { db, tx }
    }

    /// Live feed of notifications created after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn create(&self, input: &NewNotification) -> Option<Notification> {
        let stored = self.db.lock().insert_notification(input);
        match stored {
            Ok(notification) => {
                self.publish(&notification);
                Some(notification)
            }
            Err(e) => {
                log::error!(
                    "Failed to create notification for user {}: {}",
                    input.user_id,
                    e
                );
                None
            }
        }
    }

    /// Render the active template `template_name` and create the result.
    ///
    /// The metadata records the template name and the variables used.
    pub fn create_from_template(
        &self,
        user_id: &str,
        template_name: &str,
        variables: &TemplateVars,
        expires_at: Option<&str>,
    ) -> Option<Notification> {
        let found = self.db.lock().get_active_template(template_name);
        let template = match found {
            Ok(Some(template)) => template,
            Ok(None) => {
                log::error!("Notification template not found: {}", template_name);
                return None;
            }
            Err(e) => {
                log::error!("Failed to load template {}: {}", template_name, e);
                return None;
            }
        };

        let title = render(&template.title_template, variables);
        let message = render(&template.message_template, variables);
        let action_url = template
            .action_url_template
            .as_deref()
            .map(|url| render(url, variables));

        let missing = template::unresolved(&format!("{} {}", title, message));
        if !missing.is_empty() {
            log::warn!(
                "Template {} rendered with unresolved placeholders: {}",
                template_name,
                missing.join(", ")
            );
        }

        self.create(&NewNotification {
            user_id: user_id.to_string(),
            title,
            message,
            notification_type: template.notification_type,
            category: template.category,
            priority: template.priority,
            action_url,
            action_label: template.action_label,
            metadata: serde_json::json!({
                "template_name": template_name,
                "variables": variables,
            }),
            expires_at: expires_at.map(str::to_string),
        })
    }

    fn publish(&self, notification: &Notification) {
        // Err only means nobody is listening right now.
        if self.tx.send(notification.clone()).is_err() {
            log::debug!(
                "No live subscribers for notification {}",
                notification.id
            );
        }
    }

    // =========================================================================
    // Reads and state changes
    // =========================================================================

    pub fn list(
        &self,
        user_id: &str,
        query: &NotificationQuery,
    ) -> Result<NotificationPage, NotificationError> {
        Ok(self.db.lock().list_notifications(user_id, query)?)
    }

    pub fn mark_as_read(&self, notification_id: &str) -> Result<bool, NotificationError> {
        Ok(self.db.lock().mark_notification_read(notification_id)?)
    }

    pub fn mark_all_as_read(&self, user_id: &str) -> Result<usize, NotificationError> {
        Ok(self.db.lock().mark_all_notifications_read(user_id)?)
    }

    pub fn delete(&self, notification_id: &str) -> Result<bool, NotificationError> {
        Ok(self.db.lock().delete_notification(notification_id)?)
    }

    pub fn unread_count(&self, user_id: &str) -> Result<u64, NotificationError> {
        Ok(self.db.lock().unread_notification_count(user_id)?)
    }

    /// Remove notifications past their `expires_at`. Returns how many went.
    pub fn cleanup_expired(&self) -> Result<usize, NotificationError> {
        let removed = self
            .db
            .lock()
            .delete_expired_notifications(&crate::util::now_rfc3339())?;
        if removed > 0 {
            log::info!("Removed {} expired notifications", removed);
        }
        Ok(removed)
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    /// Stored preferences, or the defaults when the user never saved any.
    pub fn get_preferences(&self, user_id: &str) -> Result<NotificationPreferences, NotificationError> {
        let stored = self.db.lock().get_notification_preferences(user_id)?;
        Ok(stored.unwrap_or_else(|| NotificationPreferences::defaults_for(user_id)))
    }

    pub fn update_preferences(
        &self,
        user_id: &str,
        update: PreferencesUpdate,
    ) -> Result<NotificationPreferences, NotificationError> {
        for value in [&update.quiet_hours_start, &update.quiet_hours_end]
            .into_iter()
            .flatten()
        {
            if chrono::NaiveTime::parse_from_str(value, "%H:%M").is_err() {
                return Err(NotificationError::Validation(format!(
                    "Invalid quiet hours time: {}",
                    value
                )));
            }
        }
        if let Some(tz) = update.timezone.as_deref() {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                return Err(NotificationError::Validation(format!(
                    "Unknown timezone: {}",
                    tz
                )));
            }
        }

        let mut prefs = self.get_preferences(user_id)?;
        prefs.apply(update);
        self.db.lock().upsert_notification_preferences(&prefs)?;
        Ok(prefs)
    }
}

#[cfg(test)]
mod tests {
    use super::template::vars;
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{NotificationCategory, NotificationType, Priority};

    fn service() -> NotificationService {
        NotificationService::new(test_db().into_shared())
    }

    #[tokio::test]
    async fn test_create_publishes_to_subscribers() {
        let service = service();
        let mut rx = service.subscribe();

        let created = service
            .create(&NewNotification::new(
                "u1",
                "Olá",
                "Bem-vindo",
                NotificationType::Info,
                NotificationCategory::System,
            ))
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, created.id);
    }

    #[test]
    fn test_create_without_subscribers_still_persists() {
        let service = service();
        let created = service.create(&NewNotification::new(
            "u1",
            "Olá",
            "m",
            NotificationType::Info,
            NotificationCategory::System,
        ));
        assert!(created.is_some());
        assert_eq!(service.unread_count("u1").unwrap(), 1);
    }

    #[test]
    fn test_create_from_template_renders_and_records_metadata() {
        let service = service();
        let created = service
            .create_from_template(
                "u1",
                "new_lead",
                &vars([
                    ("lead_name", "Maria Souza".to_string()),
                    ("lead_id", "lead-1".to_string()),
                ]),
                None,
            )
            .unwrap();

        assert_eq!(created.title, "Novo lead: Maria Souza");
        assert_eq!(created.category, NotificationCategory::Lead);
        assert_eq!(created.metadata["template_name"], "new_lead");
        assert_eq!(created.metadata["variables"]["lead_id"], "lead-1");
        assert!(created.action_url.unwrap_or_default().contains("lead-1"));
    }

    #[test]
    fn test_missing_template_yields_none() {
        let service = service();
        assert!(service
            .create_from_template("u1", "nope", &TemplateVars::new(), None)
            .is_none());
        assert_eq!(service.unread_count("u1").unwrap(), 0);
    }

    #[test]
    fn test_preferences_default_then_update() {
        let service = service();
        let prefs = service.get_preferences("u1").unwrap();
        assert!(prefs.in_app_enabled);
        assert_eq!(prefs.quiet_hours_start, "22:00");

        let updated = service
            .update_preferences(
                "u1",
                PreferencesUpdate {
                    push_enabled: Some(false),
                    quiet_hours_end: Some("07:30".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!updated.push_enabled);
        assert_eq!(service.get_preferences("u1").unwrap(), updated);

        let err = service
            .update_preferences(
                "u1",
                PreferencesUpdate {
                    quiet_hours_start: Some("25h".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, NotificationError::Validation(_)));
    }

    #[test]
    fn test_priority_comes_from_template() {
        let service = service();
        let created = service
            .create_from_template(
                "u1",
                "integration_error",
                &vars([
                    ("integration_name", "Slack".to_string()),
                    ("error_message", "timeout".to_string()),
                ]),
                None,
            )
            .unwrap();
        assert_eq!(created.notification_type, NotificationType::Error);
        assert_eq!(created.priority, Priority::High);
    }
}
