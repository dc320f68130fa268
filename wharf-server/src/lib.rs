//! # Wharf Server
//!
//! Single-process function host. User functions live in directories
//! under a watched root; each declares HTTP routes in
//! `route.config.json` and scheduled jobs in `cron.json`. The server
//! exposes every declared route on one shared port, runs the cron jobs,
//! and hot-reloads functions as their files change.
//!
//! Built on axum; the runtime components (registry, route table, reload
//! pipeline, scheduler, watcher, logging) live in `wharf-core`.

/// Host configuration
pub mod config;

/// Request dispatch and the health endpoint
pub mod dispatch;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use dispatch::AppState;

/// Assemble the HTTP surface: the fixed `/health` route plus the
/// multiplexer fallback.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(dispatch::health))
        .fallback(dispatch::dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
