use serde::Serialize;
use serde_json::{json, Value};

use super::{read_response, require_config, webhook_url, IntegrationDispatcher, IntegrationError};
use crate::db::{Integration, IntegrationKind};

/// Result of a connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrationTest {
    pub success: bool,
    pub message: String,
}

impl IntegrationTest {
    fn from_status(ok: bool) -> Self {
        Self {
            success: ok,
            message: if ok {
                "Conexão bem-sucedida".to_string()
            } else {
                "Falha na conexão".to_string()
            },
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl IntegrationDispatcher {
    /// Text message through the WhatsApp Cloud API.
    pub async fn send_whatsapp(
        &self,
        integration_id: &str,
        to: &str,
        message: &str,
    ) -> Result<Value, IntegrationError> {
        let integration = self.active_integration(integration_id, IntegrationKind::Whatsapp)?;
        let request = json!({"to": to, "message": message});
        let call = self.post_whatsapp(&integration, to, message);
        self.dispatch(&integration, "send_message", request, call).await
    }

    async fn post_whatsapp(
        &self,
        integration: &Integration,
        to: &str,
        message: &str,
    ) -> Result<Value, IntegrationError> {
        let token = require_config(integration, "accessToken")?;
        let phone_id = require_config(integration, "phoneNumberId")?;
        let resp = self
            .http
            .post(format!("{}/{}/messages", self.endpoints.whatsapp_graph, phone_id))
            .bearer_auth(token)
            .json(&json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "text",
                "text": {"body": message},
            }))
            .send()
            .await?;
        read_response(resp).await
    }

    pub async fn trigger_n8n(
        &self,
        integration_id: &str,
        workflow_id: &str,
        payload: &Value,
    ) -> Result<Value, IntegrationError> {
        let integration = self.active_integration(integration_id, IntegrationKind::N8n)?;
        let request = json!({"workflowId": workflow_id, "data": payload});
        let call = self.post_n8n(&integration, workflow_id, payload);
        self.dispatch(&integration, "trigger_workflow", request, call).await
    }

    async fn post_n8n(
        &self,
        integration: &Integration,
        workflow_id: &str,
        payload: &Value,
    ) -> Result<Value, IntegrationError> {
        let base = require_config(integration, "baseUrl")?;
        let api_key = require_config(integration, "apiKey")?;
        let resp = self
            .http
            .post(format!(
                "{}/api/v1/workflows/{}/execute",
                base.trim_end_matches('/'),
                workflow_id
            ))
            .header("X-N8N-API-KEY", api_key)
            .json(payload)
            .send()
            .await?;
        read_response(resp).await
    }

    /// POST `payload` to a Zapier catch hook: `hook_url` when given, else
    /// the URL stored on the integration.
    pub async fn trigger_zapier(
        &self,
        integration_id: &str,
        hook_url: Option<&str>,
        payload: &Value,
    ) -> Result<Value, IntegrationError> {
        let integration = self.active_integration(integration_id, IntegrationKind::Zapier)?;
        let url = match hook_url.filter(|u| !u.trim().is_empty()) {
            Some(url) => url.to_string(),
            None => webhook_url(&integration)?.to_string(),
        };
        let request = json!({"webhookUrl": url, "data": payload});
        let call = self.post_json(&url, payload);
        self.dispatch(&integration, "trigger_webhook", request, call).await
    }

    /// `chat.postMessage`. Slack answers 200 with `ok: false` on failure.
    pub async fn send_slack(
        &self,
        integration_id: &str,
        channel: &str,
        message: &str,
    ) -> Result<Value, IntegrationError> {
        let integration = self.active_integration(integration_id, IntegrationKind::Slack)?;
        let request = json!({"channel": channel, "message": message});
        let call = self.post_slack(&integration, channel, message);
        self.dispatch(&integration, "send_message", request, call).await
    }

    async fn post_slack(
        &self,
        integration: &Integration,
        channel: &str,
        message: &str,
    ) -> Result<Value, IntegrationError> {
        let token = require_config(integration, "botToken")?;
        let resp = self
            .http
            .post(format!("{}/chat.postMessage", self.endpoints.slack_api))
            .bearer_auth(token)
            .json(&json!({"channel": channel, "text": message}))
            .send()
            .await?;
        let response = read_response(resp).await?;
        slack_ok(&response)?;
        Ok(response)
    }

    /// HTML e-mail through SendGrid. Only 202 counts as sent.
    pub async fn send_email(
        &self,
        integration_id: &str,
        to: &str,
        subject: &str,
        html: &str,
    ) -> Result<Value, IntegrationError> {
        let integration = self.active_integration(integration_id, IntegrationKind::Sendgrid)?;
        let request = json!({"to": to, "subject": subject});
        let call = self.post_sendgrid(&integration, to, subject, html);
        self.dispatch(&integration, "send_email", request, call).await
    }

    async fn post_sendgrid(
        &self,
        integration: &Integration,
        to: &str,
        subject: &str,
        html: &str,
    ) -> Result<Value, IntegrationError> {
        let api_key = require_config(integration, "apiKey")?;
        let from = require_config(integration, "fromEmail")?;
        let resp = self
            .http
            .post(format!("{}/mail/send", self.endpoints.sendgrid_api))
            .bearer_auth(api_key)
            .json(&json!({
                "personalizations": [{"to": [{"email": to}]}],
                "from": {"email": from},
                "subject": subject,
                "content": [{"type": "text/html", "value": html}],
            }))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(json!({"success": true}));
        }
        let status = resp.status().as_u16();
        let message = match read_response(resp).await {
            Ok(response) => response["body"].to_string(),
            Err(IntegrationError::Remote { message, .. }) => message,
            Err(e) => return Err(e),
        };
        Err(IntegrationError::Remote { status, message })
    }

    /// Connectivity check per type. Never sends a message to a real recipient
    /// and never records a log entry.
    pub async fn test_integration(&self, integration: &Integration) -> IntegrationTest {
        match self.check_connectivity(integration).await {
            Ok(result) => result,
            Err(e) => IntegrationTest::failed(e.to_string()),
        }
    }

    async fn check_connectivity(
        &self,
        integration: &Integration,
    ) -> Result<IntegrationTest, IntegrationError> {
        let resp = match integration.kind {
            IntegrationKind::Whatsapp => {
                let token = require_config(integration, "accessToken")?;
                let phone_id = require_config(integration, "phoneNumberId")?;
                self.http
                    .get(format!("{}/{}", self.endpoints.whatsapp_graph, phone_id))
                    .bearer_auth(token)
                    .send()
                    .await?
            }
            IntegrationKind::N8n => {
                let base = require_config(integration, "baseUrl")?;
                let api_key = require_config(integration, "apiKey")?;
                self.http
                    .get(format!("{}/api/v1/workflows", base.trim_end_matches('/')))
                    .header("X-N8N-API-KEY", api_key)
                    .send()
                    .await?
            }
            IntegrationKind::Slack => {
                let token = require_config(integration, "botToken")?;
                let resp = self
                    .http
                    .get(format!("{}/auth.test", self.endpoints.slack_api))
                    .bearer_auth(token)
                    .send()
                    .await?;
                let response = read_response(resp).await?;
                return Ok(match slack_ok(&response) {
                    Ok(()) => IntegrationTest::from_status(true),
                    Err(e) => IntegrationTest::failed(e.to_string()),
                });
            }
            IntegrationKind::Sendgrid => {
                let api_key = require_config(integration, "apiKey")?;
                self.http
                    .get(format!("{}/scopes", self.endpoints.sendgrid_api))
                    .bearer_auth(api_key)
                    .send()
                    .await?
            }
            IntegrationKind::Webhook => {
                let url = webhook_url(integration)?;
                self.http.get(url).send().await?
            }
            IntegrationKind::Zapier => {
                return Ok(IntegrationTest::failed(
                    "Tipo de integração não suportado para teste",
                ))
            }
        };
        Ok(IntegrationTest::from_status(resp.status().is_success()))
    }
}

fn slack_ok(response: &Value) -> Result<(), IntegrationError> {
    let body = &response["body"];
    if body["ok"].as_bool() == Some(true) {
        return Ok(());
    }
    Err(IntegrationError::Remote {
        status: response["status"].as_u64().unwrap_or(200) as u16,
        message: body["error"].as_str().unwrap_or("unknown error").to_string(),
    })
}
