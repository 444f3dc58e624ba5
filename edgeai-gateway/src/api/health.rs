//! Health check endpoint.

/// GET /health - always `200 OK`, independent of model and session state.
pub async fn health() -> &'static str {
    "OK"
}
