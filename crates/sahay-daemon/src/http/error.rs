//! HTTP error mapping.
//!
//! Core errors carry stable kinds; this is the one place that maps a kind
//! to an HTTP status. Response bodies expose the kind and a short message,
//! never internal details — in particular, transient store errors collapse
//! to a generic body so nothing about the schema or filesystem leaks.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use sahay_core::Error;

/// Error wrapper implementing `IntoResponse`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// Wire form of an error.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden | Error::ConsentMissing { .. } => StatusCode::FORBIDDEN,
            Error::Validation(_) | Error::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) | Error::InvalidNonce { .. } | Error::StateInvalid { .. } => {
                StatusCode::CONFLICT
            },
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Gone => StatusCode::GONE,
            Error::Transient(_) | Error::ChainUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::ChainBroken { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self.0 {
            // Do not echo backend details to the client.
            Error::Transient(_) => "temporarily unavailable, retry later".to_string(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: self.0.kind(),
            message,
        };
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), error = %self.0, "request failed");
        }
        (status, Json(body)).into_response()
    }
}
