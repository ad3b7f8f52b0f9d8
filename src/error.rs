//! 领域错误与 API 错误类型及其转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::fmt;
use thiserror::Error;
use tracing::error;

/// 出错的对象种类，用于组织错误信息。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subject {
    File,
    Content,
    Passcode,
    Link,
    Account,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subject::File => "file",
            Subject::Content => "file content",
            Subject::Passcode => "one-time passcode",
            Subject::Link => "sharing link",
            Subject::Account => "account",
        };
        f.write_str(name)
    }
}

/// 访问控制各流程共用的错误。
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{0} not found")]
    NotFound(Subject),
    #[error("{0} expired")]
    Expired(Subject),
    #[error("invalid one-time passcode")]
    Mismatch,
    #[error("access denied")]
    Unauthorized,
    #[error("one-time passcode already used")]
    AlreadyConsumed,
    #[error("OTP verification required")]
    VerificationRequired,
    #[error("OTP required")]
    OtpRequired,
    #[error("too many failed attempts")]
    AttemptsExceeded,
    #[error("no free access code after {0} attempts")]
    CodeSpaceExhausted(u32),
    #[error("account already exists")]
    AccountExists,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("{0}")]
    InvalidInput(String),
    #[error("upload exceeds {0} bytes")]
    TooLarge(u64),
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

impl AccessError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        AccessError::InvalidInput(msg.into())
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Gone(String),
    Internal(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    PayloadTooLarge(String),
    TooManyRequests(u64),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Gone(msg) => (StatusCode::GONE, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (StatusCode::TOO_MANY_REQUESTS, headers, "too many requests").into_response()
            }
        }
    }
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        let msg = err.to_string();
        match err {
            AccessError::NotFound(_) => ApiError::NotFound(msg),
            AccessError::Expired(_) => ApiError::Gone(msg),
            AccessError::Mismatch | AccessError::InvalidCredentials => ApiError::Unauthorized(msg),
            AccessError::Unauthorized
            | AccessError::AlreadyConsumed
            | AccessError::VerificationRequired => ApiError::Forbidden(msg),
            AccessError::OtpRequired | AccessError::InvalidInput(_) => ApiError::BadRequest(msg),
            AccessError::AttemptsExceeded => ApiError::TooManyRequests(0),
            AccessError::AccountExists => ApiError::Conflict(msg),
            AccessError::TooLarge(_) => ApiError::PayloadTooLarge(msg),
            AccessError::CodeSpaceExhausted(attempts) => {
                error!(attempts, "access code space exhausted");
                ApiError::Internal("internal server error".into())
            }
            AccessError::Upstream(err) => {
                error!(error = ?err, "upstream failure");
                ApiError::Internal("internal server error".into())
            }
        }
    }
}
