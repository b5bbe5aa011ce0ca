//! Crate-wide error taxonomy.
//!
//! Covers the error kinds every subsystem raises: validation failures, auth
//! failures, lock/duplicate conflicts, quota exhaustion, upstream
//! (provider/connector) failures, and internal bugs. Tool failures never
//! appear here: they stay inside the tool envelope (see
//! [`crate::zerg::tool_registry::ToolEnvelope`]) and are handed back to the
//! model, not raised as a Rust error.
//!
//! Kept as a hand-rolled `enum` implementing `std::error::Error` rather than
//! reaching for a derive-macro crate, matching the rest of this codebase's
//! existing error style (see [`crate::zerg::client_wrapper`]).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum ZergError {
    /// Input failed schema or semantic validation.
    Validation(String),
    /// Missing/invalid JWT, HMAC signature, or OIDC bearer token.
    Auth(String),
    /// Run lock already held, duplicate connector, or out-of-order resume.
    Conflict(String),
    /// A configured cap (daily runs, daily cost, model allowlist) was hit.
    Quota(String),
    /// An external API (LLM provider, Gmail, MCP server) failed.
    Upstream(String),
    /// A bug. The caller only ever sees a generic message; details are logged.
    Internal(String),
}

impl ZergError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn quota(msg: impl Into<String>) -> Self {
        Self::Quota(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ZergError::Validation(_) => StatusCode::BAD_REQUEST,
            ZergError::Auth(_) => StatusCode::UNAUTHORIZED,
            ZergError::Conflict(_) => StatusCode::CONFLICT,
            ZergError::Quota(msg) => {
                // Model-allowlist rejections are spec'd as 422, daily caps as 429.
                if msg.contains("model") {
                    StatusCode::UNPROCESSABLE_ENTITY
                } else {
                    StatusCode::TOO_MANY_REQUESTS
                }
            }
            ZergError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ZergError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ZergError::Validation(_) => "validation_error",
            ZergError::Auth(_) => "auth_error",
            ZergError::Conflict(_) => "conflict_error",
            ZergError::Quota(_) => "quota_error",
            ZergError::Upstream(_) => "upstream_error",
            ZergError::Internal(_) => "internal_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            ZergError::Validation(m)
            | ZergError::Auth(m)
            | ZergError::Conflict(m)
            | ZergError::Quota(m)
            | ZergError::Upstream(m) => m,
            // Never leak internal detail to the HTTP boundary; it is still
            // available via Display/logging for the server-side trace.
            ZergError::Internal(_) => "internal error",
        }
    }
}

impl fmt::Display for ZergError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZergError::Validation(m) => write!(f, "validation error: {m}"),
            ZergError::Auth(m) => write!(f, "auth error: {m}"),
            ZergError::Conflict(m) => write!(f, "conflict: {m}"),
            ZergError::Quota(m) => write!(f, "quota exceeded: {m}"),
            ZergError::Upstream(m) => write!(f, "upstream error: {m}"),
            ZergError::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl std::error::Error for ZergError {}

impl IntoResponse for ZergError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.kind(),
            "message": self.message(),
        });
        (status, axum::Json(body)).into_response()
    }
}

impl From<serde_json::Error> for ZergError {
    fn from(e: serde_json::Error) -> Self {
        ZergError::Validation(e.to_string())
    }
}
