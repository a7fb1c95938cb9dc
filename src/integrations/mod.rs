//! Outbound dispatch to user-configured integrations.
//!
//! Every call resolves an active integration of the expected type, performs
//! one HTTP request, and records the attempt in `integration_logs` whatever
//! the outcome. Failures are returned to the caller and also raised as an
//! `integration_error` notification.

mod channels;

use std::future::Future;

use serde::Serialize;
use serde_json::Value;

use crate::db::{
    DbError, Integration, IntegrationKind, IntegrationStatus, LogStatus, SharedDb,
};
use crate::notifications::NotificationService;

pub use channels::IntegrationTest;

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("Database: {0}")]
    Db(#[from] DbError),
    #[error("{0}")]
    Validation(String),
    #[error("Integration not found: {0}")]
    NotFound(String),
    #[error("Integration {0} is not active")]
    Inactive(String),
    #[error("Integration is {actual}, expected {expected}")]
    WrongType {
        expected: IntegrationKind,
        actual: IntegrationKind,
    },
    #[error("Integration {integration} is missing config key {key}")]
    MissingConfig { integration: String, key: &'static str },
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Remote returned {status}: {message}")]
    Remote { status: u16, message: String },
}

/// Base URLs of the hosted APIs, overridable for tests and proxies.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub whatsapp_graph: String,
    pub slack_api: String,
    pub sendgrid_api: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            whatsapp_graph: "https://graph.facebook.com/v17.0".to_string(),
            slack_api: "https://slack.com/api".to_string(),
            sendgrid_api: "https://api.sendgrid.com/v3".to_string(),
        }
    }
}

/// Outcome of one target in a webhook fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub integration_id: String,
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct IntegrationDispatcher {
    db: SharedDb,
    http: reqwest::Client,
    notifications: Option<NotificationService>,
    endpoints: Endpoints,
}

impl IntegrationDispatcher {
    pub fn new(db: SharedDb, http: reqwest::Client) -> Self {
        Self {
            db,
            http,
            notifications: None,
            endpoints: Endpoints::default(),
        }
    }

    /// Raise `integration_error` notifications on failed dispatches.
    pub fn with_notifications(mut self, notifications: NotificationService) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Load `integration_id` and check it is active and of `kind`.
    fn active_integration(
        &self,
        integration_id: &str,
        kind: IntegrationKind,
    ) -> Result<Integration, IntegrationError> {
        let found = self.db.lock().get_integration(integration_id);
        let integration = match found {
            Ok(integration) => integration,
            Err(DbError::NotFound { .. }) => {
                return Err(IntegrationError::NotFound(integration_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if integration.kind != kind {
            return Err(IntegrationError::WrongType {
                expected: kind,
                actual: integration.kind,
            });
        }
        if integration.status != IntegrationStatus::Active {
            return Err(IntegrationError::Inactive(integration.name));
        }
        Ok(integration)
    }

    /// Await `call`, log the attempt, and report a failure.
    async fn dispatch(
        &self,
        integration: &Integration,
        action: &str,
        request: Value,
        call: impl Future<Output = Result<Value, IntegrationError>>,
    ) -> Result<Value, IntegrationError> {
        let outcome = call.await;
        match &outcome {
            Ok(response) => {
                self.record(&integration.id, action, LogStatus::Success, &request, Some(response), None)
            }
            Err(e) => {
                let message = e.to_string();
                self.record(&integration.id, action, LogStatus::Error, &request, None, Some(&message));
                log::warn!(
                    "Integration {} ({}) {} failed: {}",
                    integration.name,
                    integration.kind,
                    action,
                    message
                );
                if let Some(notifications) = &self.notifications {
                    notifications.notify_integration_error(
                        &integration.user_id,
                        &integration.name,
                        &message,
                    );
                }
            }
        }
        outcome
    }

    fn record(
        &self,
        integration_id: &str,
        action: &str,
        status: LogStatus,
        request: &Value,
        response: Option<&Value>,
        error: Option<&str>,
    ) {
        let inserted = self.db.lock().insert_integration_log(
            integration_id,
            action,
            status,
            Some(request),
            response,
            error,
        );
        if let Err(e) = inserted {
            log::error!("Failed to log integration {} {}: {}", integration_id, action, e);
        }
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// POST `payload` to every active webhook and Zapier integration of the
    /// user at once. One failing target does not affect the others.
    pub async fn broadcast_webhooks(
        &self,
        user_id: &str,
        payload: &Value,
    ) -> Result<Vec<WebhookDelivery>, IntegrationError> {
        let targets: Vec<Integration> = self
            .db
            .lock()
            .list_integrations(user_id, None, Some(IntegrationStatus::Active))?
            .into_iter()
            .filter(|i| matches!(i.kind, IntegrationKind::Webhook | IntegrationKind::Zapier))
            .collect();

        let deliveries = targets.iter().map(|target| self.deliver(target, payload));
        Ok(futures::future::join_all(deliveries).await)
    }

    async fn deliver(&self, target: &Integration, payload: &Value) -> WebhookDelivery {
        let mut delivery = WebhookDelivery {
            integration_id: target.id.clone(),
            name: target.name.clone(),
            success: false,
            status: None,
            error: None,
        };
        let url = match webhook_url(target) {
            Ok(url) => url.to_string(),
            Err(e) => {
                delivery.error = Some(e.to_string());
                return delivery;
            }
        };

        let request = serde_json::json!({"url": url, "data": payload});
        let outcome = self
            .dispatch(target, "broadcast_webhook", request, self.post_json(&url, payload))
            .await;
        match outcome {
            Ok(response) => {
                delivery.success = true;
                delivery.status = response.get("status").and_then(Value::as_u64).map(|s| s as u16);
            }
            Err(IntegrationError::Remote { status, message }) => {
                delivery.status = Some(status);
                delivery.error = Some(message);
            }
            Err(e) => delivery.error = Some(e.to_string()),
        }
        delivery
    }

    async fn post_json(&self, url: &str, payload: &Value) -> Result<Value, IntegrationError> {
        let resp = self.http.post(url).json(payload).send().await?;
        read_response(resp).await
    }
}

/// Target URL of a webhook-style integration.
fn webhook_url(integration: &Integration) -> Result<&str, IntegrationError> {
    let key = match integration.kind {
        IntegrationKind::Zapier => "webhookUrl",
        _ => "url",
    };
    integration
        .config_str(key)
        .or_else(|| integration.config_str("url"))
        .ok_or_else(|| IntegrationError::MissingConfig {
            integration: integration.name.clone(),
            key,
        })
}

fn require_config<'a>(
    integration: &'a Integration,
    key: &'static str,
) -> Result<&'a str, IntegrationError> {
    integration
        .config_str(key)
        .ok_or_else(|| IntegrationError::MissingConfig {
            integration: integration.name.clone(),
            key,
        })
}

/// `{status, body}` on 2xx, `Remote` otherwise. Non-JSON bodies are kept as text.
async fn read_response(resp: reqwest::Response) -> Result<Value, IntegrationError> {
    let status = resp.status();
    let text = resp.text().await?;
    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    if !status.is_success() {
        return Err(IntegrationError::Remote {
            status: status.as_u16(),
            message: match body {
                Value::String(s) => s,
                other => other.to_string(),
            },
        });
    }
    Ok(serde_json::json!({"status": status.as_u16(), "body": body}))
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    /// Local HTTP target: `/ok` answers 200, `/fail` 500, `/mail/send` 202.
    /// The `/slack/*` and `/phone-1/messages` routes mimic Slack and WhatsApp.
    pub async fn spawn_target() -> String {
        let app = Router::new()
            .route("/ok", post(|| async { Json(serde_json::json!({"received": true})) }))
            .route("/fail", post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
            .route("/mail/send", post(|| async { StatusCode::ACCEPTED }))
            .route(
                "/slack/chat.postMessage",
                post(|Json(body): Json<serde_json::Value>| async move {
                    if body["channel"] == "#vendas" {
                        Json(serde_json::json!({"ok": true, "ts": "1"}))
                    } else {
                        Json(serde_json::json!({"ok": false, "error": "channel_not_found"}))
                    }
                }),
            )
            .route(
                "/slack/auth.test",
                get(|| async { Json(serde_json::json!({"ok": true})) }),
            )
            .route(
                "/phone-1/messages",
                post(|| async { Json(serde_json::json!({"messages": [{"id": "wamid.1"}]})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }
}
