//! Google API client for the calendar bridge.
//!
//! Direct HTTP via reqwest. Tokens live in the `google_calendar_integrations`
//! table rather than on disk, so this module only deals with the wire side:
//! OAuth code exchange and refresh, retrying sends, and calendar v3 calls.
//!
//! Modules:
//! - auth: consent URL, code exchange, loopback redirect capture
//! - calendar: Google Calendar API v3 and the `CalendarProvider` seam

pub mod auth;
pub mod calendar;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// OAuth2 scopes requested by the calendar bridge.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/calendar",
    "https://www.googleapis.com/auth/calendar.events",
];

pub const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

// ============================================================================
// OAuth client + token wire types
// ============================================================================

/// OAuth2 web client settings. Only ever used server-side or from the CLI.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_uri: String,
    pub token_uri: String,
}

impl OAuthClient {
    pub fn google(client_id: String, client_secret: String, redirect_uri: String) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri,
            auth_uri: GOOGLE_AUTH_URI.to_string(),
            token_uri: GOOGLE_TOKEN_URI.to_string(),
        }
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    /// Absolute expiry (RFC 3339) derived from `expires_in`.
    pub fn expiry(&self) -> Option<String> {
        self.expires_in
            .map(|secs| (chrono::Utc::now() + chrono::Duration::seconds(secs)).to_rfc3339())
    }
}

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token expired or revoked")]
    AuthExpired,
    #[error("Token exchange failed: {0}")]
    ExchangeFailed(String),
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("OAuth flow cancelled")]
    FlowCancelled,
    #[error("Google Calendar not configured: {0}")]
    NotConfigured(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl GoogleApiError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, GoogleApiError::AuthExpired)
    }
}

// ============================================================================
// Retrying send
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    NonRetryable,
}

fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, GoogleApiError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(GoogleApiError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                let decision = retry_decision_for_status(status);
                if decision == RetryDecision::Retryable && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "google_api retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "google_api retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(GoogleApiError::Http(err));
            }
        }
    }

    Err(GoogleApiError::ApiError {
        status: 0,
        message: "request exhausted retries".to_string(),
    })
}

/// Map a non-success response to an error, consuming the body for the message.
pub(crate) async fn error_for_response(resp: reqwest::Response) -> GoogleApiError {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return GoogleApiError::AuthExpired;
    }
    let body = resp.text().await.unwrap_or_default();
    GoogleApiError::ApiError {
        status: status.as_u16(),
        message: body,
    }
}

// ============================================================================
// Token refresh
// ============================================================================

/// Whether a stored expiry is in the past (with a 60 second margin).
///
/// Unknown expiry is treated as valid; the API answers 401 if it is not.
pub fn is_token_expired(expiry: Option<&str>) -> bool {
    let Some(expiry_str) = expiry.filter(|s| !s.trim().is_empty()) else {
        return false;
    };
    match chrono::DateTime::parse_from_rfc3339(expiry_str) {
        Ok(expiry) => expiry <= chrono::Utc::now() + chrono::Duration::seconds(60),
        Err(_) => true,
    }
}

/// Exchange a refresh token for a new access token.
pub async fn refresh_access_token(
    http: &reqwest::Client,
    oauth: &OAuthClient,
    refresh_token: &str,
) -> Result<TokenResponse, GoogleApiError> {
    let resp = http
        .post(&oauth.token_uri)
        .form(&[
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await?;

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(map_refresh_error(status.as_u16(), &body));
    }

    let mut token: TokenResponse = serde_json::from_str(&body)?;
    // Google omits the refresh token on refresh; keep the one we used.
    if token.refresh_token.is_none() {
        token.refresh_token = Some(refresh_token.to_string());
    }
    Ok(token)
}

fn map_refresh_error(status: u16, body: &str) -> GoogleApiError {
    let lowered = body.to_lowercase();
    if (status == 400 || status == 401)
        && (lowered.contains("invalid_grant") || lowered.contains("token has been expired"))
    {
        return GoogleApiError::AuthExpired;
    }
    GoogleApiError::RefreshFailed(format!("HTTP {}: {}", status, body))
}
