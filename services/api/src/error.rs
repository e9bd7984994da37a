//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service and how it is
//! rendered as an HTTP response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use study_core::error::ServiceError;
use study_core::ports::PortError;
use tracing::error;
use utoipa::ToSchema;

use crate::config::ConfigError;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An orchestrator failure carrying a stable error code.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller could not be identified.
    #[error("{0}")]
    Unauthorized(String),

    /// A malformed request that never reached the orchestrators.
    #[error("{0}")]
    BadRequest(String),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

/// JSON body of every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Stable machine-readable code, e.g. `INSUFFICIENT_CREDITS`.
    pub error: String,
    pub message: String,
    /// Whether repeating the same request later may succeed.
    pub retriable: bool,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Service(e) => e.code(),
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::BadRequest(_) => "INVALID_INPUT",
            ApiError::Port(PortError::SchemaMismatch(_)) => "PLANS_SCHEMA_MISMATCH",
            ApiError::Port(PortError::NotFound(_)) => "NOT_FOUND",
            ApiError::Config(_) => "SERVER_MISCONFIGURED",
            _ => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Service(e) => match e {
                ServiceError::PromptTooLong { .. }
                | ServiceError::TooManyFiles { .. }
                | ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
                ServiceError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Port(PortError::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retriable(&self) -> bool {
        match self {
            ApiError::Service(e) => e.is_retriable(),
            ApiError::Port(e) => e.is_retryable(),
            ApiError::Database(_) | ApiError::Io(_) => true,
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
            retriable: self.retriable(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_map_to_documented_statuses() {
        let cases = [
            (ServiceError::InsufficientCredits { balance: 0, cost: 1 }, StatusCode::PAYMENT_REQUIRED),
            (ServiceError::TooManyFiles { count: 11, max: 10 }, StatusCode::BAD_REQUEST),
            (ServiceError::PromptTooLong { len: 5000, max: 4000 }, StatusCode::BAD_REQUEST),
            (ServiceError::ModelKeyMissing, StatusCode::INTERNAL_SERVER_ERROR),
            (ServiceError::ModelTimeout, StatusCode::INTERNAL_SERVER_ERROR),
            (ServiceError::SchemaMismatch("generations".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn retriable_flag_follows_the_service_error() {
        assert!(ApiError::from(ServiceError::ModelTimeout).retriable());
        assert!(!ApiError::from(ServiceError::ModelKeyMissing).retriable());
        assert_eq!(ApiError::Unauthorized("x".into()).code(), "UNAUTHORIZED");
    }
}
