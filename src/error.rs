//! # Error Handling
//!
//! HTTP-facing error type. Library errors (`SessionError`, `AudioError`,
//! `RemoteError`) stay plain enums; they only become HTTP responses here.
//!
//! ## Key Rust Concepts:
//! - **From trait**: lets handlers use `?` on library results
//! - **ResponseError trait**: actix calls `error_response` when a handler
//!   returns `Err(AppError)`
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "mic_access_denied",
//!     "message": "Microphone access error: Microphone access denied: Permission denied",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use live_voice::session::SessionError;

#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The live session refused or failed the request
    Session(SessionError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Session(err) => write!(f, "Session error: {}", err),
        }
    }
}

impl AppError {
    /// Status code, machine-readable type and message for the response body.
    ///
    /// Session errors use the session's error sub-code as their type, so
    /// clients see the same codes as in status events.
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::Session(err) => {
                let status = match err {
                    SessionError::AlreadyActive => StatusCode::CONFLICT,
                    SessionError::Cancelled => StatusCode::CONFLICT,
                    SessionError::ConnectFailed(_) | SessionError::Remote(_) | SessionError::AudioSend(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    SessionError::ApiKeyMissing
                    | SessionError::SdkInit(_)
                    | SessionError::AudioContext(_)
                    | SessionError::MicAccessDenied(_)
                    | SessionError::DriverUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                };
                let error_type = match err {
                    SessionError::AlreadyActive => "already_active",
                    SessionError::Cancelled => "activation_cancelled",
                    SessionError::DriverUnavailable => "session_unavailable",
                    other => other.code().map(|c| c.as_str()).unwrap_or("session_error"),
                };
                (status, error_type, err.to_string())
            }
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        AppError::Session(err)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_session_error_status_codes() {
        assert_eq!(AppError::from(SessionError::AlreadyActive).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::from(SessionError::ConnectFailed("refused".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::from(SessionError::MicAccessDenied("denied".into())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::ValidationError("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[actix_web::test]
    async fn test_error_body_uses_session_code() {
        let response = AppError::from(SessionError::ApiKeyMissing).error_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "api_key_missing");
        assert!(value["error"]["timestamp"].is_string());
    }
}
