// =============================================================================
// ERROR MODULE
// =============================================================================
// Custom error types and their HTTP responses.
//
// Caller-distinguishable categories:
// - NotFound: missing entity, or one owned by another organization
// - InvalidState: entity exists but forbids the requested transition
// - Forbidden / Unauthorized: role or identity problems
// - BadRequest / Conflict: boundary validation and unique keys
// - Database / Internal: unexpected, detail logged but never returned
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;
use crate::store::StoreError;

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Database query or transaction failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // -------------------------------------------------------------------------
    // BUSINESS LOGIC ERRORS
    // -------------------------------------------------------------------------
    /// Entity missing or outside the caller's organization
    #[error("{0}")]
    NotFound(String),

    /// Entity is not in a state that permits the transition
    #[error("{0}")]
    InvalidState(String),

    /// Caller's role (or trip ownership) does not allow the operation
    #[error("{0}")]
    Forbidden(String),

    /// Caller identity could not be resolved
    #[error("{0}")]
    Unauthorized(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Unique key violation (e.g. duplicate license plate)
    #[error("{0}")]
    Conflict(String),

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for the response body
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidState(_) => "INVALID_STATE",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True for failures the caller cannot act on (surfaced generically)
    pub fn is_unexpected(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Unexpected failures never expose internals to the caller
        let message = if self.is_unexpected() {
            tracing::error!(error_code, detail = %self, "Request failed");
            "An unexpected error occurred".to_string()
        } else {
            tracing::warn!(error_code, message = %self, "Request rejected");
            self.to_string()
        };

        let body = ErrorResponse::new(error_code, message);

        (status, Json(body)).into_response()
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================
pub type AppResult<T> = Result<T, AppError>;

// =============================================================================
// CONVERSION HELPERS
// =============================================================================

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// A stale conditional write is a lost race on the entity's state.
impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StaleState { .. } => AppError::InvalidState(err.to_string()),
            StoreError::Missing { .. } => AppError::NotFound(err.to_string()),
            StoreError::Database(db) => AppError::Database(db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn taxonomy_maps_to_distinct_statuses() {
        assert_eq!(
            AppError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::InvalidState("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn stale_state_becomes_invalid_state() {
        let id = Uuid::new_v4();
        let err: AppError = StoreError::stale("Vehicle", id, "AVAILABLE").into();
        match err {
            AppError::InvalidState(msg) => {
                assert_eq!(msg, format!("Vehicle {} is no longer AVAILABLE", id))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_row_becomes_not_found() {
        let id = Uuid::new_v4();
        let err: AppError = StoreError::missing("Driver", id).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), format!("Driver not found: {}", id));
    }

    #[test]
    fn unexpected_errors_hide_detail() {
        let response = AppError::Database(sqlx::Error::PoolTimedOut).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
