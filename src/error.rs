// SPDX-License-Identifier: MIT

//! Application error types with consistent API responses.
//!
//! Two layers: `AuthError` is the closed domain taxonomy produced at the
//! identity-adapter boundary (no vendor error shape crosses it), and
//! `AppError` is the HTTP-facing type every handler returns.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Closed set of auth failure codes. Everything the vendor can throw is
/// normalized into one of these before it reaches the state machine or
/// a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorCode {
    /// Malformed input (bad email, missing field, code format)
    InvalidInput,
    /// Phone number failed E.164 normalization
    InvalidPhone,
    /// Wrong OTP code or mismatched magic link
    InvalidCode,
    /// Verification expired or was superseded
    ExpiredCode,
    /// Too many attempts; retry-after attached on the error
    RateLimited,
    /// Credential identifier already bound to a different account
    ProviderConflict,
    /// Transient network/vendor failure, retryable
    NetworkError,
    /// Silent refresh failed; session is gone
    SessionExpired,
    /// Catch-all; message is never shown verbatim to the user
    Unknown,
}

/// Normalized auth failure: a code plus a short, non-blaming message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AuthError {
    pub code: AuthErrorCode,
    pub message: String,
    /// Only set for `RateLimited`
    pub retry_after_seconds: Option<i64>,
}

impl AuthError {
    pub fn new(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::InvalidInput, message)
    }

    pub fn invalid_phone() -> Self {
        Self::new(
            AuthErrorCode::InvalidPhone,
            "That phone number doesn't look right. Try the full number with country code.",
        )
    }

    pub fn invalid_code() -> Self {
        Self::new(
            AuthErrorCode::InvalidCode,
            "That code didn't match. Give it another try.",
        )
    }

    pub fn expired_code() -> Self {
        Self::new(
            AuthErrorCode::ExpiredCode,
            "That code has expired. We can send you a fresh one.",
        )
    }

    pub fn rate_limited(retry_after_seconds: Option<i64>) -> Self {
        Self {
            code: AuthErrorCode::RateLimited,
            message: "Too many tries for now. Take a break and come back in a bit.".to_string(),
            retry_after_seconds,
        }
    }

    pub fn provider_conflict(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::ProviderConflict, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::NetworkError, message)
    }

    pub fn session_expired() -> Self {
        Self::new(
            AuthErrorCode::SessionExpired,
            "Your session ended. Sign in again when you're ready.",
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::Unknown, message)
    }

    /// Message safe to show the user. `Unknown` internals stay internal.
    pub fn user_message(&self) -> &str {
        match self.code {
            AuthErrorCode::Unknown => "Something went wrong on our side. Please try again.",
            _ => &self.message,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.code,
            AuthErrorCode::NetworkError | AuthErrorCode::SessionExpired
        )
    }
}

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<i64>,
}

fn auth_status(code: AuthErrorCode) -> (StatusCode, &'static str) {
    match code {
        AuthErrorCode::InvalidInput => (StatusCode::BAD_REQUEST, "invalid_input"),
        AuthErrorCode::InvalidPhone => (StatusCode::BAD_REQUEST, "invalid_phone"),
        AuthErrorCode::InvalidCode => (StatusCode::BAD_REQUEST, "invalid_code"),
        AuthErrorCode::ExpiredCode => (StatusCode::BAD_REQUEST, "expired_code"),
        AuthErrorCode::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        AuthErrorCode::ProviderConflict => (StatusCode::CONFLICT, "provider_conflict"),
        AuthErrorCode::NetworkError => (StatusCode::BAD_GATEWAY, "network_error"),
        AuthErrorCode::SessionExpired => (StatusCode::UNAUTHORIZED, "session_expired"),
        AuthErrorCode::Unknown => (StatusCode::INTERNAL_SERVER_ERROR, "unknown"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details, retry_after) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None, None),
            AppError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid_token", None, None),
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, "not_found", Some(msg.clone()), None)
            }
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "bad_request",
                Some(msg.clone()),
                None,
            ),
            AppError::Auth(err) => {
                let (status, code) = auth_status(err.code);
                if err.code == AuthErrorCode::Unknown {
                    tracing::error!(error = %err.message, "Unhandled auth error");
                }
                (
                    status,
                    code,
                    Some(err.user_message().to_string()),
                    err.retry_after_seconds,
                )
            }
            AppError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    None,
                    None,
                )
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    None,
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
            retry_after_seconds: retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
