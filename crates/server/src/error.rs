//! API error types.

use axum::Json;
use axum::http::header::CONTENT_RANGE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use ferry_core::{ErrorBody, ErrorKind};
use uuid::Uuid;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Transfer(#[from] ferry_core::Error),

    /// A `Range` header that selects nothing inside a file of `total_size` bytes.
    #[error("range not satisfiable: {message}")]
    RangeNotSatisfiable { total_size: u64, message: String },
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transfer(e) => e.kind(),
            Self::RangeNotSatisfiable { .. } => ErrorKind::BadInput,
        }
    }

    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        if let Self::RangeNotSatisfiable { .. } = self {
            return StatusCode::RANGE_NOT_SATISFIABLE;
        }
        status_for(self.kind())
    }
}

/// HTTP status for each error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadInput => StatusCode::BAD_REQUEST,
        ErrorKind::HashMismatch => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::BadSequence => StatusCode::CONFLICT,
        ErrorKind::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::SealedAlready => StatusCode::CONFLICT,
        ErrorKind::IncompleteUpload => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Expired => StatusCode::GONE,
        ErrorKind::Cancelled => StatusCode::GONE,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        crate::metrics::record_error(self.code());

        let body = if self.kind() == ErrorKind::Internal {
            let correlation_id = Uuid::new_v4().to_string();
            tracing::error!(correlation_id = %correlation_id, error = %self, "Internal error");
            ErrorBody {
                code: self.code().to_string(),
                message: "internal error".to_string(),
                correlation_id: Some(correlation_id),
            }
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request failed");
            ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                correlation_id: None,
            }
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::RangeNotSatisfiable { total_size, .. } = self
            && let Ok(value) = HeaderValue::from_str(&format!("bytes */{total_size}"))
        {
            response.headers_mut().insert(CONTENT_RANGE, value);
        }
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
