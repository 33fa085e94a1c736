//! Error type shared by the token codec, guards and storage helpers.
//!
//! Every failure carries a kind (mapped to an HTTP status), a stable
//! machine-readable code, a human-readable message and optional metadata
//! (e.g. token expiry details or `Retry-After` seconds).

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

/// Broad failure classes, mapped 1:1 to HTTP statuses by the guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    TooManyRequests,
    InternalServerError,
}

impl ErrorKind {
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Library error: `(kind, code, message, meta)`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AuthError {
    kind: ErrorKind,
    code: &'static str,
    message: String,
    meta: Option<Value>,
}

impl AuthError {
    #[must_use]
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            meta: None,
        }
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, "UNAUTHORIZED", message)
    }

    #[must_use]
    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, code, message)
    }

    /// Forbidden specialization used by the codec and guards to trigger the
    /// failure-header response path.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, "PERMISSION_DENIED", message)
    }

    #[must_use]
    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalServerError, code, message)
    }

    /// Rate-limit denial carrying the seconds until the window resets.
    #[must_use]
    pub fn too_many_requests(retry_after_seconds: i64) -> Self {
        Self::new(
            ErrorKind::TooManyRequests,
            "TOO_MANY_REQUESTS",
            "Too many requests.",
        )
        .with_meta(json!({ "retryAfter": retry_after_seconds }))
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub const fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    /// Seconds until retry, when this is a rate-limit denial.
    #[must_use]
    pub fn retry_after(&self) -> Option<i64> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.get("retryAfter"))
            .and_then(Value::as_i64)
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.code,
            "message": self.message,
            "meta": self.meta,
        });
        (self.status(), Json(body)).into_response()
    }
}
