//! Error handling for the orchestration core.
//!
//! This module provides:
//! - A machine-readable [`ErrorCode`] taxonomy shared by workers and the API
//! - HTTP status code mapping for API responses
//! - Retryability classification (drives broker retry vs. terminal failures)
//! - User-facing messages kept separate from internal diagnostics

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// A specialized Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses and worker diagnostics.
///
/// These codes are stable and can be used by clients for programmatic error
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request errors
    Validation,
    Unauthorized,
    NotOwned,

    // Job lifecycle errors
    JobNotFound,
    InvalidJobState,
    OrphanedParent,
    JobDataLost,

    // Credit errors
    InsufficientCredits,

    // Broker / stage errors
    DispatchFailure,
    StageExecutionError,
    LlmApiError,

    // Infrastructure errors
    DatabaseError,
    QueueError,
    SerializationError,
    ConfigurationError,
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation | Self::InvalidJobState => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            Self::NotOwned => StatusCode::FORBIDDEN,
            Self::JobNotFound | Self::OrphanedParent => StatusCode::NOT_FOUND,
            Self::JobDataLost => StatusCode::GONE,
            Self::DispatchFailure => StatusCode::SERVICE_UNAVAILABLE,
            Self::LlmApiError => StatusCode::BAD_GATEWAY,
            Self::StageExecutionError
            | Self::DatabaseError
            | Self::QueueError
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable by the broker's backoff policy.
    ///
    /// Orphaned-parent and data-lost failures are intentionally terminal;
    /// credit exhaustion is only resumable after an explicit recharge.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DispatchFailure
                | Self::StageExecutionError
                | Self::LlmApiError
                | Self::DatabaseError
                | Self::QueueError
        )
    }

    /// The stable `code` string exposed to API clients.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotOwned => "FORBIDDEN",
            Self::JobNotFound => "NOT_FOUND",
            Self::InvalidJobState => "INVALID_STATE",
            Self::OrphanedParent => "PROJECT_CRITICAL_ERROR",
            Self::JobDataLost => "JOB_DATA_LOST",
            Self::InsufficientCredits => "INSUFFICIENT_CREDITS",
            Self::DispatchFailure => "DISPATCH_FAILURE",
            Self::StageExecutionError => "STAGE_ERROR",
            Self::LlmApiError => "LLM_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::QueueError => "QUEUE_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::ConfigurationError => "CONFIG_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Get the error category for metrics grouping.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Validation | Self::Unauthorized | Self::NotOwned => "request",
            Self::JobNotFound | Self::InvalidJobState | Self::OrphanedParent | Self::JobDataLost => {
                "job"
            }
            Self::InsufficientCredits => "credits",
            Self::DispatchFailure | Self::QueueError => "queue",
            Self::StageExecutionError | Self::LlmApiError => "stage",
            Self::DatabaseError => "database",
            Self::SerializationError => "serialization",
            Self::ConfigurationError | Self::InternalError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the orchestration core.
///
/// Carries a user-facing message (safe to return from the API) separately
/// from an optional internal message used only for logging.
#[derive(Error, Debug)]
pub struct CoreError {
    code: ErrorCode,
    user_message: Cow<'static, str>,
    internal_message: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl CoreError {
    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Log this error at a level appropriate for its status class.
    pub fn log(&self) {
        let code = self.code.as_str();
        let status = self.http_status().as_u16();
        if self.http_status().is_server_error() {
            error!(
                error_code = %code,
                http_status = status,
                user_message = %self.user_message,
                internal_message = ?self.internal_message,
                source = ?self.source,
                "Request failed"
            );
        } else {
            warn!(
                error_code = %code,
                http_status = status,
                user_message = %self.user_message,
                "Request rejected"
            );
        }
    }

    fn record_metrics(&self) {
        counter!(
            "litrev_errors_total",
            "code" => self.code.as_str(),
            "category" => self.code.category()
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response envelope for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorInfo,
}

/// Error information for API responses. Never carries internal detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&CoreError> for ErrorResponse {
    fn from(error: &CoreError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code.as_str().to_string(),
                message: error.user_message.to_string(),
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.http_status();
        let response = ErrorResponse::from(&self);
        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::with_internal(ErrorCode::DatabaseError, "A database error occurred", e.to_string())
            .with_source(e)
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::with_internal(ErrorCode::QueueError, "A queue error occurred", e.to_string())
            .with_source(e)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to (de)serialize data",
            e.to_string(),
        )
        .with_source(e)
    }
}
