use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Failure kinds raised by the collaborators the monitor depends on
/// (ledger explorer, refund submission service, deposit store).
///
/// Provider-specific status codes are mapped into one of these variants once,
/// at the collaborator boundary, and never travel further than that.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Network errors, timeouts, 5xx and rate limiting. Retried with backoff.
    #[error("Transient upstream failure: {0}")]
    Transient(String),

    /// Explorer quota or payment required. Puts the monitor into cooldown.
    #[error("Upstream quota exhausted: {0}")]
    QuotaExceeded(String),

    /// The upstream understood the request and refused it.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Duplicate key or already-existing record.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Transient(_))
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, ReconcileError::QuotaExceeded(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Transient(_) => "transient",
            ReconcileError::QuotaExceeded(_) => "quota_exceeded",
            ReconcileError::Rejected(_) => "rejected",
            ReconcileError::Conflict(_) => "conflict",
            ReconcileError::Fatal(_) => "fatal",
        }
    }
}

/// Postgres unique_violation
const PG_UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for ReconcileError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION) => {
                ReconcileError::Conflict(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ReconcileError::Transient(format!("Database unavailable: {}", error))
            }
            _ => ReconcileError::Fatal(format!("Database error: {}", error)),
        }
    }
}

impl From<reqwest::Error> for ReconcileError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            ReconcileError::Transient(format!("HTTP request error: {}", error))
        } else if error.is_decode() {
            ReconcileError::Fatal(format!("Unexpected response body: {}", error))
        } else {
            ReconcileError::Transient(format!("HTTP error: {}", error))
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Top-level error type for the HTTP surface and process bootstrap
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg, None),
            AppError::InvalidAddress(address) => (
                StatusCode::BAD_REQUEST,
                "INVALID_ADDRESS",
                format!("Invalid address: {}", address),
                None,
            ),
            AppError::Reconcile(ReconcileError::Conflict(msg)) => {
                (StatusCode::CONFLICT, "CONFLICT", msg, None)
            }
            AppError::Reconcile(ReconcileError::Rejected(msg)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "REJECTED", msg, None)
            }
            AppError::Reconcile(ReconcileError::QuotaExceeded(msg)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UPSTREAM_QUOTA_EXCEEDED",
                "Ledger explorer quota exhausted".to_string(),
                Some(serde_json::json!({ "upstream": msg })),
            ),
            AppError::Reconcile(ReconcileError::Transient(msg)) => (
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_UNAVAILABLE",
                "Upstream temporarily unavailable".to_string(),
                Some(serde_json::json!({ "upstream": msg })),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
