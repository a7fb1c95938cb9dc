//! Top-level error classification.
//!
//! Subsystems return their own `thiserror` enums; `CrmError` folds them into
//! the categories the CLI and HTTP layer act on:
//! - Retryable: transport failures, rate limits
//! - RequiresUserAction: missing Google configuration, expired authorization,
//!   calendar not connected
//! - NonRetryable: not found, invalid input, storage failures

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;
use crate::google_api::GoogleApiError;
use crate::integrations::IntegrationError;
use crate::notifications::NotificationError;
use crate::sync::SyncError;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Transport(String),

    #[error("API rate limit exceeded")]
    ApiRateLimit,

    #[error("Google authorization expired or revoked")]
    AuthExpired,

    #[error("Google Calendar is not connected")]
    NotConnected,

    #[error("A calendar sync is already running for this user")]
    SyncInProgress,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CrmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrmError::Transport(_) | CrmError::ApiRateLimit | CrmError::SyncInProgress
        )
    }

    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            CrmError::Configuration(_) | CrmError::AuthExpired | CrmError::NotConnected
        )
    }

    /// Status-line text shown to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            CrmError::Configuration(_) => {
                "Google Calendar não está configurado. Verifique as variáveis de ambiente."
            }
            CrmError::Transport(_) => "Erro de conexão. Verifique sua internet e tente novamente.",
            CrmError::ApiRateLimit => "Limite de requisições atingido. Aguarde alguns minutos.",
            CrmError::AuthExpired => "Autorização do Google expirada. Conecte a agenda novamente.",
            CrmError::NotConnected => "Google Calendar não conectado.",
            CrmError::SyncInProgress => "Uma sincronização já está em andamento.",
            CrmError::NotFound(_) => "Registro não encontrado.",
            CrmError::Validation(_) => "Dados inválidos. Revise os campos e tente novamente.",
            CrmError::Storage(_) => "Erro ao salvar os dados. Tente novamente.",
        }
    }
}

impl From<DbError> for CrmError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { .. } => CrmError::NotFound(err.to_string()),
            DbError::Validation(msg) => CrmError::Validation(msg),
            other => CrmError::Storage(other.to_string()),
        }
    }
}

impl From<GoogleApiError> for CrmError {
    fn from(err: GoogleApiError) -> Self {
        match err {
            GoogleApiError::AuthExpired => CrmError::AuthExpired,
            GoogleApiError::NotConfigured(msg) => CrmError::Configuration(msg),
            GoogleApiError::ApiError { status: 429, .. } => CrmError::ApiRateLimit,
            GoogleApiError::ApiError { status: 404, message } => CrmError::NotFound(message),
            GoogleApiError::ExchangeFailed(msg) => CrmError::Validation(msg),
            GoogleApiError::Io(e) => CrmError::Storage(e.to_string()),
            other => CrmError::Transport(other.to_string()),
        }
    }
}

impl From<ConfigError> for CrmError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidTimezone(tz) => {
                CrmError::Validation(format!("Unknown timezone: {}", tz))
            }
            other => CrmError::Configuration(other.to_string()),
        }
    }
}

impl From<SyncError> for CrmError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotConnected => CrmError::NotConnected,
            SyncError::AlreadyRunning => CrmError::SyncInProgress,
            SyncError::NotConfigured(e) => e.into(),
            SyncError::Db(e) => e.into(),
            SyncError::Google(e) => e.into(),
        }
    }
}

impl From<NotificationError> for CrmError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::Db(e) => e.into(),
            NotificationError::Validation(msg) => CrmError::Validation(msg),
        }
    }
}

impl From<IntegrationError> for CrmError {
    fn from(err: IntegrationError) -> Self {
        match err {
            IntegrationError::Db(e) => e.into(),
            IntegrationError::Validation(msg) => CrmError::Validation(msg),
            IntegrationError::NotFound(id) => CrmError::NotFound(format!("integration {}", id)),
            IntegrationError::Inactive(_) | IntegrationError::WrongType { .. } => {
                CrmError::Configuration(err.to_string())
            }
            IntegrationError::Remote { status: 429, .. } => CrmError::ApiRateLimit,
            other => CrmError::Transport(other.to_string()),
        }
    }
}

/// Serializable error for the CLI and HTTP surfaces.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub user_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&CrmError> for ErrorReport {
    fn from(err: &CrmError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ErrorReport {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            user_message: err.user_message().to_string(),
        }
    }
}
