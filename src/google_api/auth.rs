//! OAuth2 authorization code flow for Google Calendar.
//!
//! The server path receives the code from the web client and only needs
//! `exchange_code`. The CLI path runs a loopback consent: it binds a
//! localhost listener, opens the browser, and captures the redirect.

use std::io::{Read, Write};
use std::net::TcpListener;

use super::{GoogleApiError, OAuthClient, TokenResponse, SCOPES};

/// Consent URL requesting offline access so a refresh token is issued.
pub fn authorization_url(oauth: &OAuthClient, state: Option<&str>) -> String {
    let mut url = format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
        oauth.auth_uri,
        urlencoding(&oauth.client_id),
        urlencoding(&oauth.redirect_uri),
        urlencoding(&SCOPES.join(" ")),
    );
    if let Some(state) = state {
        url.push_str("&state=");
        url.push_str(&urlencoding(state));
    }
    url
}

/// Trade an authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    oauth: &OAuthClient,
    code: &str,
) -> Result<TokenResponse, GoogleApiError> {
    let resp = http
        .post(&oauth.token_uri)
        .form(&[
            ("code", code),
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
            ("redirect_uri", oauth.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await?;

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(GoogleApiError::ExchangeFailed(body));
    }

    let body = resp.text().await?;
    let token: TokenResponse = serde_json::from_str(&body)
        .map_err(|_| GoogleApiError::ExchangeFailed("No access_token in response".into()))?;
    Ok(token)
}

/// Run the browser consent against a loopback redirect and return the tokens.
///
/// The configured redirect URI is replaced by `http://localhost:<port>` for
/// this flow, so the OAuth client must allow loopback redirects.
pub async fn run_loopback_consent(
    http: &reqwest::Client,
    oauth: &OAuthClient,
) -> Result<TokenResponse, GoogleApiError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let mut loopback = oauth.clone();
    loopback.redirect_uri = format!("http://localhost:{}", port);

    let auth_url = authorization_url(&loopback, None);
    log::info!("Opening browser for Google Calendar consent...");
    if let Err(e) = open::that(&auth_url) {
        log::warn!("Failed to open browser: {}. URL: {}", e, auth_url);
    }

    let code = tokio::task::spawn_blocking(move || wait_for_auth_code(&listener))
        .await
        .map_err(|_| GoogleApiError::FlowCancelled)??;

    exchange_code(http, &loopback, &code).await
}

fn wait_for_auth_code(listener: &TcpListener) -> Result<String, GoogleApiError> {
    let (mut stream, _) = listener.accept()?;

    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer)?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    match extract_code(&request) {
        Some(code) => {
            send_response(
                &mut stream,
                "Agenda conectada! Você pode fechar esta aba.",
            );
            Ok(code)
        }
        None => {
            let message = if request.contains("error=") {
                "Autorização negada. Você pode fechar esta aba."
            } else {
                "Nenhum código de autorização recebido."
            };
            send_response(&mut stream, message);
            Err(GoogleApiError::FlowCancelled)
        }
    }
}

/// Pull `code` out of `GET /?code=...&scope=... HTTP/1.1`.
fn extract_code(request: &str) -> Option<String> {
    let path = request.lines().next()?.split_whitespace().nth(1)?;
    let query = path.split_once('?')?.1;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty())
}

fn send_response(stream: &mut impl Write, message: &str) {
    let body = format!(
        "<html><body style=\"font-family: system-ui; text-align: center; padding: 40px;\">\
         <h2>{}</h2></body></html>",
        message
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

fn urlencoding(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
