//! OpenAI-style error envelopes.
//!
//! Every failure surfaced to a caller uses the same
//! `{"error": {"message": ..., "type": ...}}` shape, whether it came from
//! routing (404), validation (400) or the upstream leg (502).

use crate::proxy::types::RelayError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Error type for caller mistakes (unknown path, malformed body, bad model).
pub const INVALID_REQUEST_ERROR: &str = "invalid_request_error";

/// Error type for failures on the upstream leg.
pub const UPSTREAM_ERROR: &str = "upstream_error";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.into(),
            },
        }
    }
}

/// Build a complete error response with the standard envelope.
pub fn error_response(
    status: StatusCode,
    message: impl Into<String>,
    error_type: &str,
) -> Response {
    (status, Json(ErrorEnvelope::new(message, error_type))).into_response()
}

/// Extension trait mapping relay failures onto the error surface.
pub trait ErrorResponseExt {
    fn status_code(&self) -> StatusCode;
    fn error_type(&self) -> &'static str;
    fn to_response(&self) -> Response;
}

impl ErrorResponseExt for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ClientRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamAuth(_)
            | Self::UpstreamUnavailable(_)
            | Self::UpstreamDropped
            | Self::ClientDisconnected => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::ClientRequest(_) => INVALID_REQUEST_ERROR,
            _ => UPSTREAM_ERROR,
        }
    }

    fn to_response(&self) -> Response {
        error_response(self.status_code(), self.to_string(), self.error_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_type_key() {
        let envelope = ErrorEnvelope::new("nope", INVALID_REQUEST_ERROR);
        let json = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(json["error"]["message"], "nope");
        assert_eq!(json["error"]["type"], "invalid_request_error");
    }

    #[test]
    fn client_errors_map_to_400() {
        let error = RelayError::ClientRequest("bad json".into());
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.error_type(), INVALID_REQUEST_ERROR);
    }

    #[test]
    fn upstream_errors_map_to_502() {
        let error = RelayError::UpstreamAuth("handshake refused".into());
        assert_eq!(error.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(error.error_type(), UPSTREAM_ERROR);
    }
}
