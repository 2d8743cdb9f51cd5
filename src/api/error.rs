//! Unified API error handling.
//!
//! All errors are returned in a standard JSON format with appropriate HTTP
//! status codes: `{"error": {"code": "...", "message": "..."}}`. Messages are
//! fixed per failure kind and never carry keys, tokens or ciphertext.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::crypto::CryptoError;
use crate::db::VaultError;
use crate::events::EventError;
use crate::github::{GitHubError, LifecycleError, WebhookError};

/// Error codes for API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Client errors (4xx)
    BadRequest,
    Unauthorized,
    NotFound,
    ValidationError,

    // Server errors (5xx)
    InternalError,
    ServiceUnavailable,
    DatabaseError,
    CryptoError,
    UpstreamError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::CryptoError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the string representation of the error code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::NotFound => "not_found",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::DatabaseError => "database_error",
            ErrorCode::CryptoError => "crypto_error",
            ErrorCode::UpstreamError => "upstream_error",
        }
    }
}

/// The inner error object in the response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// The full error response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Unified API error type
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Create a new API error with a specific code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code(),
            code,
            message: message.into(),
        }
    }

    /// Create an API error with a custom HTTP status code
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    // -------------------------------------------------------------------------
    // Convenience constructors for common error types
    // -------------------------------------------------------------------------

    /// Bad request error (400)
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Unauthorized error (401) - authentication required
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Not found error (404)
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Validation error (400)
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Internal server error (500)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Database error (500)
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Service unavailable error (503)
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    /// Upstream failure, surfaced with the upstream status where it is meaningful
    pub fn upstream(message: impl Into<String>, upstream_status: Option<u16>) -> Self {
        Self::new(ErrorCode::UpstreamError, message).with_status(surfaced_status(upstream_status))
    }
}

/// Upstream 4xx/5xx statuses pass through, except 401 which would read as a
/// failed session to our own clients. Anything else becomes 502.
fn surfaced_status(upstream_status: Option<u16>) -> StatusCode {
    upstream_status
        .filter(|status| *status != 401)
        .and_then(|status| StatusCode::from_u16(status).ok())
        .filter(|status| status.is_client_error() || status.is_server_error())
        .unwrap_or(StatusCode::BAD_GATEWAY)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let response = ErrorResponse {
            error: ErrorBody {
                code: self.code.as_str().to_string(),
                message: self.message,
            },
        };

        (self.status, Json(response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

// -------------------------------------------------------------------------
// Conversion implementations for component errors
// -------------------------------------------------------------------------

impl From<GitHubError> for ApiError {
    fn from(err: GitHubError) -> Self {
        tracing::error!(error = %err, "GitHub request failed");

        match err {
            GitHubError::SigningFailed(_) => ApiError::internal("Failed to authenticate with GitHub"),
            GitHubError::UpstreamAuthFailed { status } => {
                ApiError::upstream("Failed to authenticate with GitHub", Some(status))
            }
            GitHubError::UpstreamRequestFailed { status } => {
                ApiError::upstream("GitHub request failed", Some(status))
            }
            GitHubError::Transport(_) | GitHubError::InvalidResponse(_) => {
                ApiError::upstream("GitHub request failed", None)
            }
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound(_) => ApiError::not_found("GitHub integration not found"),
            VaultError::InvalidMetadata(reason) => {
                tracing::warn!(reason = %reason, "Rejected installation metadata");
                ApiError::validation("Invalid installation metadata")
            }
            VaultError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                ApiError::database("A database error occurred")
            }
            VaultError::CorruptRow { id, reason } => {
                tracing::error!(installation_id = %id, reason = %reason, "Corrupt installation row");
                ApiError::database("A database error occurred")
            }
        }
    }
}

impl From<CryptoError> for ApiError {
    fn from(err: CryptoError) -> Self {
        tracing::error!(error = %err, "Credential encryption failure");
        ApiError::new(ErrorCode::CryptoError, "Stored credentials could not be processed")
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::MissingSignature => ApiError::bad_request("Missing signature"),
            WebhookError::MissingEventType => ApiError::bad_request("Missing event type"),
            WebhookError::InvalidSignature => ApiError::unauthorized("Invalid signature"),
            WebhookError::MalformedPayload(_) => ApiError::validation("Malformed webhook payload"),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::InstallationNotFound(_) => ApiError::not_found("Installation not found"),
            LifecycleError::Vault(e) => e.into(),
        }
    }
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        tracing::error!(error = %err, "Failed to queue event");
        match err {
            EventError::QueueClosed => ApiError::service_unavailable("Event processing is unavailable"),
            EventError::Encoding(_) => ApiError::internal("Failed to queue event"),
        }
    }
}
