//! Type definitions for the proxy module

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ========== Identifier Types ==========

/// Request ID correlating the relay, the ledger, and the dashboard views
#[nutype(
    derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |id: &Uuid| id.get_version_num() == 7),
)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new RequestId with a v7 UUID
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("now_v7 always yields a version 7 UUID")
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Model identifier advertised by `/v1/models`
#[nutype(
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |s: &str| !s.is_empty()),
)]
pub struct ModelName(String);

/// Capacity of the observability ledger's ring
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |c: &usize| *c > 0),
)]
pub struct LedgerCapacity(usize);

// ========== Chat-Completion Wire Types ==========

/// The decoded chat-completions request body.
///
/// Only `model`, `messages` and `stream` carry meaning for the relay; every
/// other field is captured in `passthrough` and forwarded opaquely. The relay
/// forwards the client's original bytes, so this type exists for validation
/// and mode selection, not re-serialization.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub passthrough: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatCompletionRequest {
    /// Decode and validate a request body.
    pub fn parse(bytes: &[u8]) -> RelayResult<Self> {
        let request: Self = serde_json::from_slice(bytes)
            .map_err(|e| RelayError::ClientRequest(format!("invalid JSON in request body: {e}")))?;

        if request.model.is_empty() {
            return Err(RelayError::ClientRequest(
                "missing required field: model".to_string(),
            ));
        }
        if request.messages.is_empty() {
            return Err(RelayError::ClientRequest(
                "messages must contain at least one entry".to_string(),
            ));
        }

        Ok(request)
    }

    /// Whether the caller asked for a streamed response.
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

// ========== Error Taxonomy ==========

/// Terminal failure classification carried on each RequestRecord
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ClientRequestError,
    UpstreamAuthError,
    UpstreamUnavailable,
    UpstreamDropped,
    ClientDisconnected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ClientRequestError => "ClientRequestError",
            Self::UpstreamAuthError => "UpstreamAuthError",
            Self::UpstreamUnavailable => "UpstreamUnavailable",
            Self::UpstreamDropped => "UpstreamDropped",
            Self::ClientDisconnected => "ClientDisconnected",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while relaying a request
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed JSON, missing required field, or any other caller mistake.
    /// Surfaced as 4xx, never retried.
    #[error("invalid request: {0}")]
    ClientRequest(String),

    /// mTLS handshake rejected (certificate, CA mismatch, expiry).
    /// Non-retryable within the same request.
    #[error("upstream TLS authentication failed: {0}")]
    UpstreamAuth(String),

    /// Connection refused/reset before any response bytes arrived.
    /// The relay retries once with a fresh connection, then surfaces 502.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Connection lost mid-stream after headers were already flushed.
    /// Recorded for observability only; the sent status cannot change.
    #[error("upstream connection lost mid-stream")]
    UpstreamDropped,

    /// The caller went away. Nothing to surface, only to record.
    #[error("client disconnected before completion")]
    ClientDisconnected,
}

impl RelayError {
    /// The ledger classification for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ClientRequest(_) => ErrorKind::ClientRequestError,
            Self::UpstreamAuth(_) => ErrorKind::UpstreamAuthError,
            Self::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Self::UpstreamDropped => ErrorKind::UpstreamDropped,
            Self::ClientDisconnected => ErrorKind::ClientDisconnected,
        }
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_v7() {
        let id = RequestId::new();
        assert_eq!(id.as_ref().get_version_num(), 7);
    }

    #[test]
    fn parse_valid_request() {
        let body = br#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"#;
        let request = ChatCompletionRequest::parse(body).expect("valid request");
        assert_eq!(request.model, "gpt-4o-mini");
        assert!(!request.wants_stream());
    }

    #[test]
    fn parse_keeps_unknown_fields() {
        let body = br#"{"model":"m","messages":[{"role":"user","content":"x"}],"temperature":0.2,"max_tokens":64}"#;
        let request = ChatCompletionRequest::parse(body).expect("valid request");
        assert!(request.passthrough.contains_key("temperature"));
        assert!(request.passthrough.contains_key("max_tokens"));
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = ChatCompletionRequest::parse(b"not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientRequestError);
    }

    #[test]
    fn parse_rejects_empty_messages() {
        let body = br#"{"model":"m","messages":[]}"#;
        let err = ChatCompletionRequest::parse(body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientRequestError);
    }

    #[test]
    fn stream_flag_detection() {
        let body = br#"{"model":"m","messages":[{"role":"user","content":"x"}],"stream":true}"#;
        let request = ChatCompletionRequest::parse(body).expect("valid request");
        assert!(request.wants_stream());
    }

    #[test]
    fn error_kind_mapping() {
        assert_eq!(
            RelayError::UpstreamAuth("cert expired".into()).kind(),
            ErrorKind::UpstreamAuthError
        );
        assert_eq!(RelayError::UpstreamDropped.kind(), ErrorKind::UpstreamDropped);
    }
}
