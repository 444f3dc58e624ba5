//! Models endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use edgeai_common::ModelsResponse;

use crate::state::AppState;

/// GET /models - List the registry, in resolution order.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let models = state.registry.all().to_vec();
    tracing::debug!("Listing {} models", models.len());
    Json(ModelsResponse { models })
}
