//! Dashboard HTTP handlers.

use crate::proxy::ledger::RequestRecord;
use crate::proxy::service::AppState;
use crate::ui::{static_files, templates};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_LOG_LIMIT: usize = 100;

pub async fn dashboard(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(templates::dashboard(&state.ledger.stats()))
}

pub async fn logs(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(templates::logs(&state.ledger.list(DEFAULT_LOG_LIMIT)))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(templates::health(&state.ledger.stats()))
}

/// `GET /ui/api/logs?limit=N` returns up to N most-recent records, newest first.
pub async fn api_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<RequestRecord>> {
    let limit = params
        .get("limit")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LOG_LIMIT);
    Json(state.ledger.list(limit))
}

/// `GET /ui/api/stats` returns the aggregate as the dashboard consumes it.
pub async fn api_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.ledger.stats();
    Json(json!({
        "total_requests": stats.total_requests,
        "success_rate": stats.success_rate(),
        "avg_response_time": stats.avg_response_time(),
    }))
}

pub async fn static_file(Path(file): Path<String>) -> Response {
    match file.as_str() {
        "style.css" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/css")],
            static_files::CSS,
        )
            .into_response(),
        _ => (StatusCode::NOT_FOUND, "404 Not Found").into_response(),
    }
}
