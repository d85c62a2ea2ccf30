//! Proxy service: the inbound listener's router and handlers.
//!
//! The router dispatches by exact path: chat completions go to the relay
//! engine, `/health` and `/v1/models` are answered locally, `/ui/*` is the
//! read-only dashboard layer, and everything else falls back to a 404 with
//! the standard error envelope. The router itself holds no mutable state;
//! all shared state lives in one [`AppState`] constructed at startup and
//! injected into every handler.

use crate::proxy::error_response::{error_response, INVALID_REQUEST_ERROR};
use crate::proxy::ledger::Ledger;
use crate::proxy::relay::RelayEngine;
use crate::proxy::types::ModelName;
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Well-known paths on the inbound surface.
pub mod paths {
    pub const HEALTH: &str = "/health";
    pub const MODELS: &str = "/v1/models";
    pub const CHAT_COMPLETIONS: &str = "/v1/chat/completions";
}

/// Shared state injected into every handler.
pub struct AppState {
    pub relay: RelayEngine,
    pub ledger: Arc<Ledger>,
    pub models: Vec<ModelName>,
}

/// The proxy service, turned into an axum router at startup.
pub struct ProxyService {
    state: Arc<AppState>,
    max_body_bytes: usize,
}

impl ProxyService {
    pub fn new(
        relay: RelayEngine,
        ledger: Arc<Ledger>,
        models: Vec<ModelName>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            state: Arc::new(AppState {
                relay,
                ledger,
                models,
            }),
            max_body_bytes,
        }
    }

    /// Build the router with all routes and middleware layers.
    pub fn into_router(self) -> Router {
        Router::new()
            .route(paths::HEALTH, get(health_handler))
            .route(paths::MODELS, get(models_handler))
            .route(paths::CHAT_COMPLETIONS, post(chat_completions_handler))
            .merge(crate::ui::router())
            .fallback(not_found_handler)
            .with_state(self.state)
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(RequestBodyLimitLayer::new(self.max_body_bytes))
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "tollbooth",
    }))
}

async fn models_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data: Vec<_> = state
        .models
        .iter()
        .map(|model| {
            json!({
                "id": model.as_ref(),
                "object": "model",
                "owned_by": "organization-owner",
            })
        })
        .collect();

    Json(json!({
        "object": "list",
        "data": data,
    }))
}

async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_json_content(&headers) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Content-Type must be application/json",
            INVALID_REQUEST_ERROR,
        );
    }
    state.relay.relay_chat(headers, body).await
}

fn is_json_content(headers: &HeaderMap) -> bool {
    match headers.get(header::CONTENT_TYPE) {
        // A missing Content-Type is tolerated; the body parse decides.
        None => true,
        Some(value) => value
            .to_str()
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false),
    }
}

async fn not_found_handler(request: Request) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!(
            "Unknown request path: {} {}",
            request.method(),
            request.uri().path()
        ),
        INVALID_REQUEST_ERROR,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_content_detection() {
        let mut headers = HeaderMap::new();
        assert!(is_json_content(&headers));

        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert!(is_json_content(&headers));

        headers.insert(
            header::CONTENT_TYPE,
            "application/json; charset=utf-8".parse().unwrap(),
        );
        assert!(is_json_content(&headers));

        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        assert!(!is_json_content(&headers));
    }

    #[test]
    fn paths_are_rooted() {
        assert!(paths::HEALTH.starts_with('/'));
        assert!(paths::MODELS.starts_with('/'));
        assert!(paths::CHAT_COMPLETIONS.starts_with('/'));
    }
}
