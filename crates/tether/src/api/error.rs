//! Unified API error handling with structured responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::CoreError;

/// API-facing error: HTTP status plus the stable core code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    detail: Option<String>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code: "VALIDATION", message: msg.into(), detail: None }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: msg.into(),
            detail: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, code: "NOT_FOUND", message: msg.into(), detail: None }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::CONFLICT, code: "CONFLICT", message: msg.into(), detail: None }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL",
            message: msg.into(),
            detail: None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let code = err.code();
        let message = err.to_string();
        let (status, detail) = match &err {
            CoreError::Validation(_) | CoreError::UnknownRecipient(_) => {
                (StatusCode::BAD_REQUEST, None)
            }
            CoreError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, None),
            CoreError::Forbidden(_) | CoreError::InvalidToken => (StatusCode::FORBIDDEN, None),
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, None),
            CoreError::StaleBase { current_hash } | CoreError::HashMismatch { current_hash } => {
                (StatusCode::CONFLICT, Some(format!("current hash is {current_hash}")))
            }
            CoreError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, None),
            CoreError::Busy(_) => (StatusCode::TOO_MANY_REQUESTS, None),
            CoreError::RunnerDisconnected(_) | CoreError::SandboxUnhealthy(_) => {
                (StatusCode::BAD_GATEWAY, None)
            }
            CoreError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        Self { status, code, message, detail }
    }
}

/// Structured error body: `{error, code, detail?}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.status {
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY => {
                error!(code = self.code, message = %self.message, "API error");
            }
            StatusCode::GATEWAY_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                warn!(code = self.code, message = %self.message, "API backpressure");
            }
            _ => {
                debug!(code = self.code, message = %self.message, "client error");
            }
        }

        let body = ErrorBody { error: self.message, code: self.code, detail: self.detail };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_codes_map_to_expected_statuses() {
        let cases = [
            (CoreError::validation("x"), StatusCode::BAD_REQUEST),
            (CoreError::not_found("x"), StatusCode::NOT_FOUND),
            (CoreError::conflict("x"), StatusCode::CONFLICT),
            (CoreError::InvalidToken, StatusCode::FORBIDDEN),
            (CoreError::Busy("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (CoreError::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (
                CoreError::SandboxUnhealthy("x".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                CoreError::UnknownRecipient("x".into()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (core, status) in cases {
            let api = ApiError::from(core);
            assert_eq!(api.status_code(), status, "code {}", api.code());
        }
    }

    #[test]
    fn hash_mismatch_carries_current_hash_detail() {
        let api = ApiError::from(CoreError::HashMismatch {
            current_hash: "sha256:abcd".into(),
        });
        assert_eq!(api.status_code(), StatusCode::CONFLICT);
        assert_eq!(api.code(), "HASH_MISMATCH");
        assert!(api.detail.as_deref().unwrap().contains("sha256:abcd"));
    }
}
