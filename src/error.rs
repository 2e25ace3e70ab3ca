/// Unified error types for the Reelio auth service
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the auth service
#[derive(Error, Debug)]
pub enum AuthError {
    /// Malformed input, caught before any store access
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Duplicate email, provider mismatch
    #[error("{0}")]
    Conflict(String),

    /// Bad credentials, bad or expired token, failed third-party verification
    #[error("{0}")]
    Unauthorized(String),

    /// Blocked account, unverified email
    #[error("{0}")]
    Forbidden(String),

    /// Unknown token or entity
    #[error("{0}")]
    NotFound(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Convert a store error into `Conflict` when it is a unique-constraint rejection
    pub fn from_unique_violation(err: sqlx::Error, message: &str) -> Self {
        let is_unique = err
            .as_database_error()
            .map(|db_err| db_err.is_unique_violation())
            .unwrap_or(false);

        if is_unique {
            AuthError::Conflict(message.to_string())
        } else {
            AuthError::Database(err)
        }
    }

    /// HTTP status and stable error code for this error
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AuthError::Validation(_) => (StatusCode::BAD_REQUEST, "ValidationFailure"),
            AuthError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            AuthError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            AuthError::Forbidden(_) => (StatusCode::FORBIDDEN, "ForbiddenAction"),
            AuthError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            AuthError::Database(_) | AuthError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
            }
        }
    }
}

/// Unparseable or incomplete request bodies are validation failures
impl From<JsonRejection> for AuthError {
    fn from(rejection: JsonRejection) -> Self {
        AuthError::Validation(rejection.body_text())
    }
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub status_code: u16,
    pub error: String,
    pub message: String,
    pub timestamp: String,
}

/// Convert AuthError to HTTP response
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        let message = match &self {
            AuthError::Database(_) | AuthError::Internal(_) => {
                tracing::error!(error = %self, "request failed with internal error");
                "An unexpected error occurred".to_string() // Don't leak details
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            success: false,
            status_code: status.as_u16(),
            error: error_code.to_string(),
            message,
            timestamp: Utc::now().to_rfc3339(),
        });

        (status, body).into_response()
    }
}

/// Result type alias for auth operations
pub type AuthResult<T> = Result<T, AuthError>;
