//! EdgeAI Gateway - exposes an on-device streaming inference engine as a
//! synchronous HTTP API for a browser-hosted UI.

pub mod api;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod images;
pub mod middleware;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod state;
pub mod test_util;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// Build the full HTTP application.
pub fn build_router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.config.api.max_body_bytes;
    apply_layers(api::router(), max_body_bytes).with_state(state)
}

/// Wrap routes in the gateway's middleware stack: body limit, panic
/// recovery, request logging, CORS and tracing, innermost first.
fn apply_layers(routes: Router<Arc<AppState>>, max_body_bytes: usize) -> Router<Arc<AppState>> {
    routes
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .layer(axum::middleware::from_fn(middleware::request_logger))
        .layer(axum::middleware::from_fn(middleware::cors))
        .layer(TraceLayer::new_for_http())
}
