//! Uniform error surface for every user-visible failure.
//!
//! Every non-2xx response body has the same shape regardless of which
//! subsystem produced it; the `type` field is drawn from a closed
//! enumeration so callers can switch on it without parsing messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of user-visible error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    RateLimitExceeded,
    ContentPolicyViolation,
    ServiceUnavailableError,
    NotImplementedError,
    NotFoundError,
    InternalServerError,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ContentPolicyViolation => StatusCode::FORBIDDEN,
            ErrorKind::ServiceUnavailableError => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::NotImplementedError => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::NotFoundError => StatusCode::NOT_FOUND,
            ErrorKind::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::RateLimitExceeded => "RateLimitExceeded",
            ErrorKind::ContentPolicyViolation => "ContentPolicyViolation",
            ErrorKind::ServiceUnavailableError => "ServiceUnavailableError",
            ErrorKind::NotImplementedError => "NotImplementedError",
            ErrorKind::NotFoundError => "NotFoundError",
            ErrorKind::InternalServerError => "InternalServerError",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// `{ error: { type, message, requestId, timestamp, details? } }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                kind,
                message: message.into(),
                request_id: request_id.into(),
                timestamp: Utc::now().to_rfc3339(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind
    }
}

impl IntoResponse for ErrorBody {
    fn into_response(self) -> Response {
        (self.kind().status(), Json(self)).into_response()
    }
}
