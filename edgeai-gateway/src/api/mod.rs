//! HTTP API consumed by the web UI.

pub mod body;
pub mod health;
pub mod image;
pub mod inference;
pub mod models;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::error::Error;
use crate::images::IMAGES_ROUTE;
use crate::state::AppState;

/// Build the API router.
///
/// Unknown paths and unsupported methods on known paths both answer
/// `404 Not Found`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health).fallback(not_found))
        .route("/models", get(models::list_models).fallback(not_found))
        .route("/edgeai", post(inference::generate).fallback(not_found))
        .route("/edgeai_chat", post(inference::chat).fallback(not_found))
        .route(
            "/edgeai_image_url",
            post(inference::image_url).fallback(not_found),
        )
        .route(
            "/edgeai_image",
            post(image::extract_attributes).fallback(not_found),
        )
        .route(
            "/edgeai_image_direct",
            post(image::describe).fallback(not_found),
        )
        .route(
            &format!("{}/:filename", IMAGES_ROUTE),
            get(image::serve_image).fallback(not_found),
        )
        .fallback(not_found)
}

async fn not_found() -> Error {
    Error::NotFound
}
