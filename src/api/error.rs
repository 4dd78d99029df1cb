//! API error types with structured JSON responses.
//!
//! Every surfaced error carries exactly one code from the closed set.
//! Bodies are `{error, code, timestamp, details?}`; rate-limit
//! rejections additionally carry `X-RateLimit-Remaining` and
//! `X-RateLimit-Reset` headers. Internal causes are logged, never
//! leaked.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::imaging::ImagingError;
use crate::llm::LlmError;
use crate::session::SessionError;
use crate::tools::ToolError;

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Input errors (client)
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid field: {0}")]
    InvalidField(String),
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    // Auth errors (client)
    #[error("No session token supplied")]
    NoSessionToken,
    #[error("Session is invalid")]
    InvalidSession,
    #[error("Session has expired")]
    SessionExpired,

    // Throttling (client)
    #[error("Rate limit exceeded")]
    RateLimited { remaining: u32, reset_at_ms: i64 },

    // Upstream errors (server, recoverable)
    #[error("Tool unavailable")]
    ToolUnavailable,
    #[error("Tool call timed out")]
    ToolTimeout,
    #[error("Tool returned an error: {0}")]
    ToolReturnedError(String),
    #[error("Language model unavailable")]
    LlmUnavailable,
    #[error("Language model timed out")]
    LlmTimeout,

    // System errors (server)
    #[error("Service misconfigured")]
    Configuration,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::MissingField(_) => (StatusCode::BAD_REQUEST, "MISSING_FIELD"),
            ApiError::InvalidField(_) => (StatusCode::BAD_REQUEST, "INVALID_FIELD"),
            ApiError::UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE")
            }
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            ApiError::InvalidImage(_) => (StatusCode::BAD_REQUEST, "INVALID_IMAGE"),
            ApiError::NoSessionToken => (StatusCode::UNAUTHORIZED, "NO_SESSION_TOKEN"),
            ApiError::InvalidSession => (StatusCode::UNAUTHORIZED, "INVALID_SESSION"),
            ApiError::SessionExpired => (StatusCode::UNAUTHORIZED, "SESSION_EXPIRED"),
            ApiError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            ApiError::ToolUnavailable => {
                (StatusCode::INTERNAL_SERVER_ERROR, "TOOL_UNAVAILABLE")
            }
            ApiError::ToolTimeout => (StatusCode::INTERNAL_SERVER_ERROR, "TOOL_TIMEOUT"),
            ApiError::ToolReturnedError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "TOOL_RETURNED_ERROR")
            }
            ApiError::LlmUnavailable => (StatusCode::INTERNAL_SERVER_ERROR, "LLM_UNAVAILABLE"),
            ApiError::LlmTimeout => (StatusCode::INTERNAL_SERVER_ERROR, "LLM_TIMEOUT"),
            // Configuration problems surface as plain internal errors;
            // the cause stays in the logs.
            ApiError::Configuration => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let (message, details) = match &self {
            ApiError::Internal(cause) => {
                tracing::error!(cause, "internal API error");
                ("An internal error occurred".to_string(), None)
            }
            ApiError::Configuration => {
                tracing::error!("configuration error reached a request path");
                ("An internal error occurred".to_string(), None)
            }
            ApiError::MissingField(field) | ApiError::InvalidField(field) => {
                (self.to_string(), Some(field.clone()))
            }
            other => (other.to_string(), None),
        };

        let body = ErrorBody {
            error: message,
            code,
            timestamp: chrono::Utc::now().to_rfc3339(),
            details,
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { remaining, reset_at_ms } = &self {
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
                headers.insert("X-RateLimit-Remaining", value);
            }
            if let Ok(value) = HeaderValue::from_str(&reset_at_ms.to_string()) {
                headers.insert("X-RateLimit-Reset", value);
            }
        }
        response
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NoToken => ApiError::NoSessionToken,
            SessionError::Expired => ApiError::SessionExpired,
            SessionError::BadSignature
            | SessionError::UnknownSession
            | SessionError::Inactive => ApiError::InvalidSession,
        }
    }
}

impl From<ToolError> for ApiError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Unavailable
            | ToolError::Shutdown
            | ToolError::PendingCapExceeded => ApiError::ToolUnavailable,
            ToolError::DeadlineExceeded => ApiError::ToolTimeout,
            ToolError::Remote { message, .. } => ApiError::ToolReturnedError(message),
            ToolError::Transport(_) => ApiError::ToolUnavailable,
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout => ApiError::LlmTimeout,
            LlmError::Unavailable(_) | LlmError::BadResponse(_) | LlmError::NotConfigured => {
                ApiError::LlmUnavailable
            }
        }
    }
}

impl From<ImagingError> for ApiError {
    fn from(err: ImagingError) -> Self {
        match err {
            ImagingError::TooLarge { .. } => ApiError::PayloadTooLarge,
            ImagingError::UnsupportedFormat(what) => ApiError::UnsupportedMediaType(what),
            ImagingError::InvalidImage(cause) => ApiError::InvalidImage(cause),
            ImagingError::TranscodeFailed(cause) => ApiError::Internal(cause),
        }
    }
}
