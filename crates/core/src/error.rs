use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, InboxError>;

/// A single failed input constraint, accumulated during DTO validation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

/// The error taxonomy shared by handlers and workers. Handlers map each kind
/// to an HTTP status through the `IntoResponse` impl; workers use
/// `is_retryable` to decide between retry and the dead-letter bucket.
#[derive(Debug, Error)]
pub enum InboxError {
    #[error("validation failed")]
    Validation(Vec<Violation>),

    #[error("authentication required: {0}")]
    Authn(String),

    #[error("forbidden: {0}")]
    Authz(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider error {code}: {message}")]
    Provider { code: String, message: String },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl InboxError {
    pub fn validation(field: &str, message: &str) -> Self {
        InboxError::Validation(vec![Violation {
            field: field.to_string(),
            message: message.to_string(),
        }])
    }

    pub fn status(&self) -> StatusCode {
        match self {
            InboxError::Validation(_) => StatusCode::BAD_REQUEST,
            InboxError::Authn(_) => StatusCode::UNAUTHORIZED,
            InboxError::Authz(_) => StatusCode::FORBIDDEN,
            InboxError::NotFound(_) => StatusCode::NOT_FOUND,
            InboxError::Conflict(_) => StatusCode::CONFLICT,
            InboxError::Provider { .. } => StatusCode::BAD_GATEWAY,
            InboxError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            InboxError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Worker retry policy: transient and provider failures re-enter the
    /// queue; validation and conflict are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InboxError::Transient(_) | InboxError::Provider { .. })
    }
}

impl From<sqlx::Error> for InboxError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => InboxError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                InboxError::Transient(err.to_string())
            }
            other => InboxError::Fatal(other.into()),
        }
    }
}

impl IntoResponse for InboxError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self, "request failed");
        }

        let body = match &self {
            InboxError::Validation(violations) => json!({
                "message": "validation failed",
                "details": violations,
            }),
            InboxError::Provider { code, message } => json!({
                "message": message,
                "details": { "code": code },
            }),
            InboxError::Fatal(_) => json!({ "message": "internal error" }),
            other => json!({ "message": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(InboxError::validation("body", "empty").status(), StatusCode::BAD_REQUEST);
        assert_eq!(InboxError::Authn("no token".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(InboxError::Authz("not yours".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(InboxError::NotFound("conversation".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(InboxError::Conflict("not available".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            InboxError::Fatal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn retry_policy_spares_terminal_kinds() {
        assert!(InboxError::Transient("timeout".into()).is_retryable());
        assert!(InboxError::Provider { code: "131047".into(), message: "re-engage".into() }
            .is_retryable());
        assert!(!InboxError::Conflict("dup".into()).is_retryable());
        assert!(!InboxError::validation("to", "missing").is_retryable());
    }
}
