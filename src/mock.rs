//! Mock upstream simulator: a test double, not production code.
//!
//! Answers the same surface the real upstream does: `/health`,
//! `/v1/models`, and `/v1/chat/completions` in both buffered and streamed
//! form. Responses are deterministic; streaming splits the canned
//! completion into `data:` frames with small inter-frame delays and closes
//! with `data: [DONE]`. An unknown model yields a 400 with the
//! `invalid_request_error` envelope, and `drop_after` forcibly kills the
//! connection mid-stream for the relay's failure-path tests.
//!
//! The simulator speaks plain HTTP so tests need no certificate fixtures;
//! the relay's transport is TLS-optional for exactly this reason.

use crate::proxy::error_response::{error_response, INVALID_REQUEST_ERROR};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::proxy::types::{ChatCompletionRequest, ChatMessage};

/// Canned reply content, split exactly as it will be streamed.
const DEFAULT_CHUNKS: [&str; 3] = [
    "Why did the programmer quit his job? ",
    "Because he didn't get arrays. ",
    "Thanks for asking!",
];

/// Deterministic chat-completions upstream.
#[derive(Clone, Debug)]
pub struct MockUpstream {
    models: Vec<String>,
    chunks: Vec<String>,
    chunk_delay: Duration,
    drop_after: Option<usize>,
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self {
            models: vec!["gpt-4o-mini".to_string(), "gpt-4o".to_string()],
            chunks: DEFAULT_CHUNKS.iter().map(|s| s.to_string()).collect(),
            chunk_delay: Duration::from_millis(10),
            drop_after: None,
        }
    }
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<String>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Kill the connection after `n` streamed content frames, before the
    /// terminal sentinel.
    pub fn with_drop_after(mut self, n: usize) -> Self {
        self.drop_after = Some(n);
        self
    }

    /// The full completion content, as a buffered response returns it.
    pub fn completion_text(&self) -> String {
        self.chunks.concat()
    }

    pub fn into_router(self) -> Router {
        let state = Arc::new(self);
        Router::new()
            .route("/health", get(health))
            .route("/v1/models", get(models))
            .route("/v1/chat/completions", post(chat_completions))
            .with_state(state)
    }

    /// Bind an ephemeral port and serve in a background task.
    pub async fn spawn(self) -> MockUpstreamHandle {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("mock upstream local addr");
        let router = self.into_router();

        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("mock upstream serve");
        });

        MockUpstreamHandle { addr, task }
    }
}

/// Handle to a running simulator; aborts the server task on drop.
pub struct MockUpstreamHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MockUpstreamHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` suitable for the upstream pool.
    pub fn authority(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for MockUpstreamHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ========== Response Wire Types ==========

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Debug, Serialize)]
struct Choice {
    index: usize,
    message: ResponseMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct ResponseMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

#[derive(Debug, Serialize)]
struct ChatCompletionChunk {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
struct ChunkChoice {
    index: usize,
    delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

// ========== Handlers ==========

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "mock-upstream"}))
}

async fn models(State(mock): State<Arc<MockUpstream>>) -> impl IntoResponse {
    let data: Vec<_> = mock
        .models
        .iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "mock"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

async fn chat_completions(State(mock): State<Arc<MockUpstream>>, body: Bytes) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Invalid JSON in request body",
                INVALID_REQUEST_ERROR,
            );
        }
    };

    if !mock.models.contains(&request.model) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("The model `{}` does not exist", request.model),
            INVALID_REQUEST_ERROR,
        );
    }

    if request.stream.unwrap_or(false) {
        streamed_completion(&mock, &request)
    } else {
        buffered_completion(&mock, &request)
    }
}

fn buffered_completion(mock: &MockUpstream, request: &ChatCompletionRequest) -> Response {
    let content = mock.completion_text();
    let completion_tokens = word_count(&content);
    let prompt_tokens = prompt_word_count(&request.messages);

    let response = ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion",
        created: Utc::now().timestamp(),
        model: request.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant",
                content,
            },
            finish_reason: "stop",
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    };

    Json(response).into_response()
}

fn streamed_completion(mock: &MockUpstream, request: &ChatCompletionRequest) -> Response {
    let id = completion_id();
    let created = Utc::now().timestamp();
    let model = request.model.clone();
    let last = mock.chunks.len().saturating_sub(1);

    // Pre-build the event sequence; the stream only paces it out. An
    // Err item makes hyper abort the connection, simulating a crashed
    // upstream mid-stream.
    let mut events: Vec<Result<Bytes, std::io::Error>> = Vec::new();
    for (i, chunk) in mock.chunks.iter().enumerate() {
        if mock.drop_after == Some(i) {
            events.push(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "mock upstream dropped the connection",
            )));
            break;
        }
        let frame = ChatCompletionChunk {
            id: id.clone(),
            object: "chat.completion.chunk",
            created,
            model: model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: (i == 0).then_some("assistant"),
                    content: Some(chunk.clone()),
                },
                finish_reason: (i == last).then_some("stop"),
            }],
        };
        let json = serde_json::to_string(&frame).expect("serializable chunk");
        events.push(Ok(Bytes::from(format!("data: {json}\n\n"))));
    }
    if mock.drop_after.is_none() || mock.drop_after > Some(last) {
        events.push(Ok(Bytes::from_static(b"data: [DONE]\n\n")));
    }

    let delay = mock.chunk_delay;
    let stream = futures_util::stream::iter(events).then(move |event| async move {
        tokio::time::sleep(delay).await;
        event
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static streaming response")
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::now_v7().simple())
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn prompt_word_count(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| word_count(&m.content)).sum()
}
