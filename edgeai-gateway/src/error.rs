//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use edgeai_common::TextResponse;

/// Body returned when a request carries no usable JSON object.
pub const NO_JSON_DATA: &str = "No JSON data found";

/// Result text returned when no model can serve a request.
pub const NO_MODEL_AVAILABLE: &str = "No LLM model available";

/// Error taxonomy for gateway operations.
///
/// `ModelUnavailable`, `Init` and `Inference` are "soft" errors: the web UI
/// expects a conversational reply, so they are answered with `200` and the
/// message as result text. The rest map to HTTP failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed request data (bad JSON, bad image).
    #[error("{0}")]
    Parse(String),

    #[error("Not Found")]
    NotFound,

    #[error("No LLM model available")]
    ModelUnavailable,

    /// Engine or session could not be created.
    #[error("{0}")]
    Init(String),

    /// The engine failed while generating.
    #[error("Error during inference: {0}")]
    Inference(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn no_json() -> Self {
        Error::Parse(NO_JSON_DATA.to_string())
    }

    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Error::ModelUnavailable | Error::Init(_) | Error::Inference(_)
        )
    }

    /// Turn a soft error into result text, passing every other kind through.
    pub fn soft_text(self) -> Result<String> {
        if self.is_soft() {
            Ok(self.to_string())
        } else {
            Err(self)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", err))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Parse(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Error::NotFound => (StatusCode::NOT_FOUND, "Not Found").into_response(),
            Error::Internal(message) => {
                tracing::error!("Request failed: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", message)).into_response()
            }
            soft => (StatusCode::OK, Json(TextResponse::new(soft.to_string()))).into_response(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
