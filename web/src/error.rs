//! Error types for web handlers.
//!
//! [`AppError`] bridges protocol and handler failures to HTTP responses.
//! Protocol rejections (409 conflicts, 400 for an unusable key) render as
//! `{"message": "<reason>"}`; every other error also carries a `code`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use idempotency_core::{ConflictReason, IdempotencyError};
use serde::Serialize;
use std::fmt;

/// Application error type for web handlers.
///
/// Handlers running inside a stage can return an `AppError` through
/// `anyhow`; the stage's transaction is rolled back and the error reaches the
/// client unchanged.
///
/// # Examples
///
/// ```ignore
/// idempotent
///     .proceed_single(|tx| Box::pin(async move {
///         if quantity == 0 {
///             return Err(AppError::validation("quantity must be positive").into());
///         }
///         Ok(StageOutcome::finish(201, json!({"id": insert(tx).await?})))
///     }))
///     .await
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Error message (user-facing)
    message: String,
    /// Error code (for client error handling), empty for protocol rejections
    code: String,
    /// Internal error (for logging, not exposed to client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
            source: None,
        }
    }

    /// Create a protocol rejection whose body is only `{"message": ...}`.
    #[must_use]
    pub fn rejection(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, message.into(), String::new())
    }

    /// Attach the underlying error, logged but never sent to the client.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            message.into(),
            "BAD_REQUEST".to_string(),
        )
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
            "NOT_FOUND".to_string(),
        )
    }

    /// Create a 413 Payload Too Large error.
    #[must_use]
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            message.into(),
            "PAYLOAD_TOO_LARGE".to_string(),
        )
    }

    /// Create a 422 Unprocessable Entity error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            message.into(),
            "VALIDATION_ERROR".to_string(),
        )
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_SERVER_ERROR".to_string(),
        )
    }

    /// HTTP status this error renders with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// User-facing message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", self.code, self.message)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorResponse {
    /// Error code (for client error handling).
    #[serde(skip_serializing_if = "String::is_empty")]
    code: String,
    /// Human-readable error message.
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = %source,
                    "Internal server error"
                );
            } else {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Internal server error"
                );
            }
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };

        (self.status, Json(body)).into_response()
    }
}

/// Convert `anyhow::Error` to `AppError`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

/// A conflicting request is rejected with 409 and the reason.
impl From<ConflictReason> for AppError {
    fn from(reason: ConflictReason) -> Self {
        Self::rejection(StatusCode::CONFLICT, reason.message())
    }
}

/// Map protocol errors to responses.
///
/// A failed stage that carried an `AppError` keeps it; a lost lock is the
/// same conflict a late duplicate would see. Everything else is a 500.
impl From<IdempotencyError> for AppError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::Stage(source) => match source.downcast::<Self>() {
                Ok(app_error) => app_error,
                Err(source) => Self::from(source),
            },
            IdempotencyError::LockLost { .. } => ConflictReason::InProgress.into(),
            other => {
                if other.is_configuration_error() {
                    tracing::error!(error = %other, "Idempotent handler is misconfigured");
                }
                Self::internal("An internal error occurred").with_source(other.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idempotency_core::RecoveryPoint;

    #[test]
    fn test_error_display() {
        let err = AppError::bad_request("Invalid input");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Invalid input");
    }

    #[test]
    fn test_rejection_display_has_no_code() {
        let err = AppError::from(ConflictReason::ParameterMismatch);
        assert_eq!(err.to_string(), "parameter mismatch");
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_not_found() {
        let err = AppError::not_found("Order", "123");
        assert_eq!(err.to_string(), "[NOT_FOUND] Order with id 123 not found");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_stage_error_keeps_app_error() {
        let stage = IdempotencyError::Stage(AppError::validation("quantity").into());
        let err = AppError::from(stage);
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.code, "VALIDATION_ERROR");
    }

    #[test]
    fn test_other_stage_error_is_internal() {
        let stage = IdempotencyError::Stage(anyhow::anyhow!("card declined"));
        let err = AppError::from(stage);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "An internal error occurred");
    }

    #[test]
    fn test_lock_lost_is_in_progress_conflict() {
        let err = AppError::from(IdempotencyError::LockLost {
            expected: RecoveryPoint::STARTED,
            found: RecoveryPoint::FINISHED,
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.message(), "in progress");
    }

    #[test]
    fn test_missing_stage_is_internal() {
        let err = AppError::from(IdempotencyError::MissingStage(RecoveryPoint::STARTED));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
