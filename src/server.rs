//! Webhook and function server.
//!
//! Routes:
//! - `GET  /health`
//! - `GET  /api/webhook`: WhatsApp subscription handshake
//! - `POST /api/webhook`: inbound deliveries, HMAC-checked when an app secret is set
//! - `POST /functions/v1/google_calendar_oauth`: code exchange for a signed-in user
//! - `GET  /functions/v1/reports?days=N`: pipeline overview
//! - `GET  /functions/v1/chat/conversations`
//! - `GET  /functions/v1/chat/conversations/:id/messages`
//! - `POST /functions/v1/chat/conversations/:id/messages`
//! - `POST /functions/v1/chat/conversations/:id/read`
//!
//! Every `/functions/v1` route needs a `Bearer` session token.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::WebhookConfig;
use crate::db::{ConversationFilter, ConversationStatus, DbError, SharedDb};
use crate::google_api::auth::exchange_code;
use crate::google_api::OAuthClient;
use crate::integrations::IntegrationDispatcher;
use crate::reports::{self, DEFAULT_REPORT_DAYS};
use crate::services::chat;
use crate::state::AppContext;
use crate::sync::store_calendar_tokens;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub struct ServerState {
    db: SharedDb,
    http: reqwest::Client,
    oauth: Option<OAuthClient>,
    webhook: WebhookConfig,
    integrations: IntegrationDispatcher,
}

impl ServerState {
    pub fn new(
        db: SharedDb,
        http: reqwest::Client,
        oauth: Option<OAuthClient>,
        webhook: WebhookConfig,
    ) -> Self {
        let integrations = IntegrationDispatcher::new(db.clone(), http.clone());
        Self {
            db,
            http,
            oauth,
            webhook,
            integrations,
        }
    }

    /// Replace the dispatcher used for chat replies.
    pub fn with_integrations(mut self, integrations: IntegrationDispatcher) -> Self {
        self.integrations = integrations;
        self
    }

    pub fn from_context(ctx: &AppContext) -> Self {
        let config = ctx.config.snapshot();
        Self::new(
            ctx.db.clone(),
            ctx.http.clone(),
            config.google.oauth_client().ok(),
            config.webhook,
        )
        .with_integrations(ctx.integrations.clone())
    }
}

pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let functions = Router::new()
        .route("/functions/v1/google_calendar_oauth", post(google_calendar_oauth))
        .route("/functions/v1/reports", get(report_overview))
        .route("/functions/v1/chat/conversations", get(list_conversations))
        .route(
            "/functions/v1/chat/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/functions/v1/chat/conversations/:id/read", post(mark_read))
        .layer(cors);

    Router::new()
        .route("/health", get(health))
        .route("/api/webhook", get(verify_webhook).post(receive_webhook))
        .merge(functions)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Bind `0.0.0.0:port` and serve until Ctrl-C.
pub async fn serve(state: ServerState, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Webhook server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for shutdown signal: {err}");
            }
        })
        .await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

// ---------------------------------------------------------------------------
// WhatsApp webhook
// ---------------------------------------------------------------------------

async fn verify_webhook(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let expected = state.webhook.verify_token.as_deref();

    match (mode, token, expected) {
        (Some("subscribe"), Some(token), Some(expected)) if token == expected => {
            tracing::info!("Webhook verified");
            let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
            (StatusCode::OK, challenge).into_response()
        }
        _ => StatusCode::FORBIDDEN.into_response(),
    }
}

async fn receive_webhook(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = state.webhook.app_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !signature_matches(secret, &body, signature) {
            tracing::warn!("Rejected webhook delivery with a bad signature");
            return StatusCode::FORBIDDEN;
        }
    }

    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => payload,
        Err(_) => {
            tracing::info!(bytes = body.len(), "Webhook received with a non-JSON body");
            return StatusCode::OK;
        }
    };
    tracing::info!(%payload, "Webhook received");

    let Some(owner) = state.webhook.owner_user_id.as_deref() else {
        return StatusCode::OK;
    };
    for inbound in chat::parse_whatsapp_delivery(&payload) {
        match chat::record_inbound(&state.db, owner, &inbound) {
            Ok(Some(message)) => {
                tracing::info!(message_id = %message.id, from = %inbound.wa_id, "Chat message stored")
            }
            Ok(None) => {
                tracing::debug!(wamid = %inbound.platform_message_id, "Duplicate delivery")
            }
            // A non-2xx answer makes the sender redeliver.
            Err(err) => {
                tracing::error!(
                    wamid = %inbound.platform_message_id,
                    "Failed to store message: {err}"
                );
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }
    StatusCode::OK
}

/// `signature` is `sha256=<hex>` over the raw body.
fn signature_matches(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// ---------------------------------------------------------------------------
// Google Calendar OAuth function
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OAuthCodeRequest {
    code: Option<String>,
    redirect_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct OAuthCodeResponse {
    access_token: String,
    expires_in: Option<i64>,
    token_type: String,
}

fn error_response(status: StatusCode, error: &str, detail: Option<String>) -> Response {
    let mut body = json!({ "error": error });
    if let Some(detail) = detail {
        body["detail"] = Value::String(detail);
    }
    (status, Json(body)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the session user, or the 401 to answer with.
fn authenticate(state: &ServerState, headers: &HeaderMap) -> Result<String, Response> {
    let user = match bearer_token(headers) {
        Some(token) => state.db.lock().user_for_token(token),
        None => Ok(None),
    };
    match user {
        Ok(Some(user_id)) => Ok(user_id),
        Ok(None) => Err(error_response(StatusCode::UNAUTHORIZED, "Unauthorized", None)),
        Err(err) => {
            tracing::error!("Session lookup failed: {err}");
            Err(error_response(StatusCode::UNAUTHORIZED, "Unauthorized", None))
        }
    }
}

fn db_error_response(err: DbError) -> Response {
    match err {
        DbError::NotFound { .. } => error_response(StatusCode::NOT_FOUND, "Not found", None),
        DbError::Validation(msg) => error_response(StatusCode::BAD_REQUEST, &msg, None),
        other => {
            tracing::error!("Storage error: {other}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Storage error",
                Some(other.to_string()),
            )
        }
    }
}

async fn google_calendar_oauth(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Option<Json<OAuthCodeRequest>>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    let request = body.map(|Json(request)| request);
    let Some(code) = request
        .as_ref()
        .and_then(|r| r.code.as_deref())
        .filter(|c| !c.trim().is_empty())
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing code", None);
    };

    let Some(mut oauth) = state.oauth.clone() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Google Calendar is not configured",
            None,
        );
    };
    if let Some(uri) = request
        .as_ref()
        .and_then(|r| r.redirect_uri.as_deref())
        .filter(|u| !u.trim().is_empty())
    {
        oauth.redirect_uri = uri.to_string();
    }

    let tokens = match exchange_code(&state.http, &oauth, code).await {
        Ok(tokens) => tokens,
        Err(err) => {
            tracing::warn!(user_id = %user_id, "Token exchange failed: {err}");
            return error_response(
                StatusCode::BAD_REQUEST,
                "Token exchange failed",
                Some(err.to_string()),
            );
        }
    };

    if let Err(err) = store_calendar_tokens(&state.db, &user_id, &tokens) {
        tracing::error!(user_id = %user_id, "Failed to persist calendar tokens: {err}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Persist failed",
            Some(err.to_string()),
        );
    }

    tracing::info!(user_id = %user_id, "Google Calendar connected");
    Json(OAuthCodeResponse {
        access_token: tokens.access_token,
        expires_in: tokens.expires_in,
        token_type: tokens.token_type,
    })
    .into_response()
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReportQuery {
    days: Option<u32>,
}

async fn report_overview(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<ReportQuery>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let days = query.days.unwrap_or(DEFAULT_REPORT_DAYS);
    let report = reports::overview(&state.db.lock(), &user_id, days, chrono::Utc::now());
    match report {
        Ok(report) => Json(report).into_response(),
        Err(err) => db_error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    status: Option<ConversationStatus>,
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    content: Option<String>,
    sender_name: Option<String>,
}

async fn list_conversations(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<ConversationQuery>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let filter = ConversationFilter {
        status: query.status,
        search: query.search,
        ..Default::default()
    };
    let db = state.db.lock();
    let listed = db
        .list_conversations(&user_id, &filter)
        .and_then(|conversations| Ok((conversations, db.unread_chat_count(&user_id)?)));
    match listed {
        Ok((conversations, unread)) => {
            Json(json!({ "conversations": conversations, "unread": unread })).into_response()
        }
        Err(err) => db_error_response(err),
    }
}

async fn list_messages(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let messages = state.db.lock().list_chat_messages(&user_id, &conversation_id);
    match messages {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => db_error_response(err),
    }
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    body: Option<Json<SendMessageRequest>>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let request = body.map(|Json(request)| request);
    let content = request.as_ref().and_then(|r| r.content.as_deref()).unwrap_or_default();
    let sender = request
        .as_ref()
        .and_then(|r| r.sender_name.as_deref())
        .unwrap_or("Nuvra");

    let sent = chat::send_message(
        &state.db,
        &state.integrations,
        &user_id,
        &conversation_id,
        sender,
        content,
    )
    .await;
    match sent {
        Ok(sent) => (StatusCode::CREATED, Json(sent)).into_response(),
        Err(err) => db_error_response(err),
    }
}

async fn mark_read(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Response {
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };
    let marked = state.db.lock().mark_conversation_read(&user_id, &conversation_id);
    match marked {
        Ok(marked) => Json(json!({ "marked": marked })).into_response(),
        Err(err) => db_error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Form;
    use tower::ServiceExt;
    use tracing_test::traced_test;

    fn webhook_config(app_secret: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            verify_token: Some("teste".to_string()),
            app_secret: app_secret.map(str::to_string),
            owner_user_id: Some("u1".to_string()),
            port: 3000,
        }
    }

    fn app(db: SharedDb, oauth: Option<OAuthClient>, app_secret: Option<&str>) -> Router {
        router(ServerState::new(
            db,
            reqwest::Client::new(),
            oauth,
            webhook_config(app_secret),
        ))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Token endpoint that accepts the code "good" only.
    async fn spawn_token_endpoint() -> String {
        async fn token(Form(form): Form<HashMap<String, String>>) -> Response {
            if form.get("code").map(String::as_str) == Some("good") {
                Json(json!({
                    "access_token": "ya29.new",
                    "refresh_token": "1//refresh",
                    "expires_in": 3599,
                    "token_type": "Bearer",
                }))
                .into_response()
            } else {
                (StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#).into_response()
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/token", post(token));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/token", addr)
    }

    fn oauth(token_uri: &str) -> OAuthClient {
        let mut oauth = OAuthClient::google(
            "client".to_string(),
            "secret".to_string(),
            "http://localhost:5173/agenda".to_string(),
        );
        oauth.token_uri = token_uri.to_string();
        oauth
    }

    fn oauth_request(token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/functions/v1/google_calendar_oauth")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(test_db().into_shared(), None, None)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_verify_returns_challenge_on_matching_token() {
        let response = app(test_db().into_shared(), None, None)
            .oneshot(
                Request::get(
                    "/api/webhook?hub.mode=subscribe&hub.verify_token=teste&hub.challenge=12345",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "12345");
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_token_or_mode() {
        for query in [
            "hub.mode=subscribe&hub.verify_token=errado&hub.challenge=1",
            "hub.mode=unsubscribe&hub.verify_token=teste&hub.challenge=1",
            "hub.challenge=1",
        ] {
            let response = app(test_db().into_shared(), None, None)
                .oneshot(
                    Request::get(format!("/api/webhook?{}", query))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", query);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_delivery_is_logged_and_acknowledged() {
        let response = app(test_db().into_shared(), None, None)
            .oneshot(
                Request::post("/api/webhook")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"object":"whatsapp_business_account"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(logs_contain("Webhook received"));
    }

    #[tokio::test]
    async fn test_delivery_signature_is_checked_when_secret_set() {
        let body = r#"{"entry":[]}"#;
        let mut mac = HmacSha256::new_from_slice(b"app-secret").unwrap();
        mac.update(body.as_bytes());
        let good = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        let db = test_db().into_shared();
        let signed = app(db.clone(), None, Some("app-secret"))
            .oneshot(
                Request::post("/api/webhook")
                    .header(SIGNATURE_HEADER, good)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(signed.status(), StatusCode::OK);

        let forged = app(db, None, Some("app-secret"))
            .oneshot(
                Request::post("/api/webhook")
                    .header(SIGNATURE_HEADER, "sha256=00")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::FORBIDDEN);
    }

    fn whatsapp_delivery(wamid: &str, text: &str) -> String {
        json!({"entry": [{"changes": [{"value": {
            "contacts": [{"wa_id": "5511988887777", "profile": {"name": "Bruno"}}],
            "messages": [{"from": "5511988887777", "id": wamid, "type": "text",
                          "text": {"body": text}}]
        }}]}]})
        .to_string()
    }

    fn authed(method: &str, uri: &str, session: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", session))
            .header(header::CONTENT_TYPE, "application/json");
        match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> Value {
        serde_json::from_str(&body_string(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_inbound_whatsapp_lands_in_owner_inbox_once() {
        let db = test_db().into_shared();
        for _ in 0..2 {
            let response = app(db.clone(), None, None)
                .oneshot(
                    Request::post("/api/webhook")
                        .body(Body::from(whatsapp_delivery("wamid.A", "Tem desconto?")))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let conversations = db
            .lock()
            .list_conversations("u1", &ConversationFilter::default())
            .unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].contact_name, "Bruno");
        assert_eq!(conversations[0].unread_count, 1);
        assert_eq!(db.lock().unread_chat_count("u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_chat_routes_list_reply_and_mark_read() {
        let db = test_db().into_shared();
        let session = db.lock().create_session("u1").unwrap();
        let other = db.lock().create_session("u2").unwrap();
        app(db.clone(), None, None)
            .oneshot(
                Request::post("/api/webhook")
                    .body(Body::from(whatsapp_delivery("wamid.B", "Oi")))
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app(db.clone(), None, None)
            .oneshot(authed("GET", "/functions/v1/chat/conversations", &session, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = json_body(response).await;
        assert_eq!(listed["unread"], 1);
        let id = listed["conversations"][0]["id"].as_str().unwrap().to_string();
        let messages_uri = format!("/functions/v1/chat/conversations/{}/messages", id);

        let response = app(db.clone(), None, None)
            .oneshot(authed(
                "POST",
                &messages_uri,
                &session,
                Some(json!({"content": "Temos sim!", "senderName": "Carla"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        // No WhatsApp integration is configured for u1.
        assert_eq!(json_body(response).await["delivered"], false);

        let response = app(db.clone(), None, None)
            .oneshot(authed("POST", &messages_uri, &session, Some(json!({"content": " "}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(db.clone(), None, None)
            .oneshot(authed(
                "POST",
                &format!("/functions/v1/chat/conversations/{}/read", id),
                &session,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["marked"], 1);

        let response = app(db.clone(), None, None)
            .oneshot(authed("GET", &messages_uri, &session, None))
            .await
            .unwrap();
        let messages = json_body(response).await;
        assert_eq!(messages["messages"].as_array().unwrap().len(), 2);
        assert_eq!(messages["messages"][1]["senderName"], "Carla");

        let response = app(db, None, None)
            .oneshot(authed("GET", &messages_uri, &other, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_report_route_validates_days() {
        let db = test_db().into_shared();
        let session = db.lock().create_session("u1").unwrap();

        let response = app(db.clone(), None, None)
            .oneshot(authed("GET", "/functions/v1/reports?days=90", &session, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["period"]["days"], 90);
        assert_eq!(report["summary"]["conversionRate"], 0.0);

        let response = app(db.clone(), None, None)
            .oneshot(authed("GET", "/functions/v1/reports?days=0", &session, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(db, None, None)
            .oneshot(
                Request::get("/functions/v1/reports")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_oauth_requires_a_session() {
        let response = app(test_db().into_shared(), None, None)
            .oneshot(oauth_request(Some("nvr_unknown"), json!({"code": "good"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(test_db().into_shared(), None, None)
            .oneshot(oauth_request(None, json!({"code": "good"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_oauth_missing_code_or_failed_exchange_is_400() {
        let token_uri = spawn_token_endpoint().await;
        let db = test_db().into_shared();
        let session = db.lock().create_session("u1").unwrap();

        let response = app(db.clone(), Some(oauth(&token_uri)), None)
            .oneshot(oauth_request(Some(&session), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("Missing code"));

        let response = app(db.clone(), Some(oauth(&token_uri)), None)
            .oneshot(oauth_request(Some(&session), json!({"code": "bad"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(db.lock().get_calendar_integration("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oauth_exchange_persists_tokens() {
        let token_uri = spawn_token_endpoint().await;
        let db = test_db().into_shared();
        let session = db.lock().create_session("u1").unwrap();

        let response = app(db.clone(), Some(oauth(&token_uri)), None)
            .oneshot(oauth_request(
                Some(&session),
                json!({"code": "good", "redirect_uri": "http://localhost:8080/cb"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            body,
            json!({"access_token": "ya29.new", "expires_in": 3599, "token_type": "Bearer"})
        );

        let row = db.lock().get_calendar_integration("u1").unwrap().unwrap();
        assert_eq!(row.access_token, "ya29.new");
        assert_eq!(row.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(row.calendar_id, "primary");
        assert!(row.sync_enabled);
        assert!(row.last_sync.is_none());
    }
}
