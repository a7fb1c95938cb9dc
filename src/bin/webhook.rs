//! `nuvra-webhook`: WhatsApp webhook and calendar OAuth function server.
//!
//! Listens on `PORT` (default 3000). The verify token and app secret come
//! from `WHATSAPP_VERIFY_TOKEN` / `WHATSAPP_APP_SECRET` or the config file.

use std::process::ExitCode;

use nuvra_lib::server::{serve, ServerState};
use nuvra_lib::state::AppContext;
use nuvra_lib::ErrorReport;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let ctx = match AppContext::init() {
        Ok(ctx) => ctx,
        Err(err) => {
            let report = ErrorReport::from(&err);
            tracing::error!("Startup failed: {}", report.message);
            eprintln!("{}", report.user_message);
            return ExitCode::FAILURE;
        }
    };

    let config = ctx.config.snapshot();
    if config.webhook.verify_token.is_none() {
        tracing::warn!("No verify token configured; subscription handshakes will be rejected");
    }

    match serve(ServerState::from_context(&ctx), config.webhook.port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("Server error: {err}");
            ExitCode::FAILURE
        }
    }
}
