//! Operational dashboard: a read-only presentation layer over the ledger.
//!
//! Serves the HTML pages, the JSON APIs backing them, and the embedded
//! static assets. Nothing in this module mutates proxy state.

pub mod handlers;
pub mod static_files;
pub mod templates;

use crate::proxy::service::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ui", get(handlers::dashboard))
        .route("/ui/dashboard", get(handlers::dashboard))
        .route("/ui/logs", get(handlers::logs))
        .route("/ui/health", get(handlers::health))
        .route("/ui/api/logs", get(handlers::api_logs))
        .route("/ui/api/stats", get(handlers::api_stats))
        .route("/ui/static/{*file}", get(handlers::static_file))
}
