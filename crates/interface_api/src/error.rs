//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use domain_billing::{BillingError, ErrorKind};

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub kind: String,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Dependency => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Invariant => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, kind) = match &self {
            ApiError::Billing(e) => {
                if e.kind() == ErrorKind::Invariant {
                    error!(error = %e, "Request hit an invariant violation");
                }
                (status_for(e.kind()), e.code(), e.kind().as_str())
            }
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", ErrorKind::NotFound.as_str()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", ErrorKind::Validation.as_str()),
            ApiError::Validation(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_failed",
                ErrorKind::Validation.as_str(),
            ),
        };

        let message = match &self {
            ApiError::Billing(e) => e.to_string(),
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: error_code.to_string(),
            message,
            kind: kind.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
