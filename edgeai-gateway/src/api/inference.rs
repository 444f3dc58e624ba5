//! Text-only inference endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use edgeai_common::{ChatRequest, ChatResponse, ImageUrlRequest, TextRequest, TextResponse};

use super::body::JsonBody;
use super::image::prompt_or_default;
use crate::error::{Error, Result};
use crate::pipeline::DEFAULT_IMAGE_URL_PROMPT;
use crate::state::AppState;

/// POST /edgeai - Plain prompt in, `{text}` out.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    body: JsonBody,
) -> Result<Json<TextResponse>> {
    let request: TextRequest = body.decode()?;

    let text = state
        .pipeline
        .run(request.model.as_deref(), &body.overrides(), &request.prompt, &[])
        .await
        .or_else(Error::soft_text)?;

    Ok(Json(TextResponse::new(text)))
}

/// POST /edgeai_chat - Answers the last message of a conversation.
///
/// Only text blocks are used; image blocks are ignored.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    body: JsonBody,
) -> Result<Json<ChatResponse>> {
    let request: ChatRequest = body.decode()?;
    let prompt = request
        .last_message_text()
        .ok_or_else(|| Error::Parse("Invalid request: messages must not be empty".to_string()))?;

    let text = state
        .pipeline
        .run(request.model.as_deref(), &body.overrides(), &prompt, &[])
        .await
        .or_else(Error::soft_text)?;

    Ok(Json(ChatResponse::assistant(text)))
}

/// POST /edgeai_image_url - The URL is embedded in the prompt, never fetched.
pub async fn image_url(
    State(state): State<Arc<AppState>>,
    body: JsonBody,
) -> Result<Json<TextResponse>> {
    let request: ImageUrlRequest = body.decode()?;
    let prompt = format!(
        "{} url:{}",
        prompt_or_default(request.prompt.as_deref(), DEFAULT_IMAGE_URL_PROMPT),
        request.image_url
    );

    let text = state
        .pipeline
        .run(request.model.as_deref(), &body.overrides(), &prompt, &[])
        .await
        .or_else(Error::soft_text)?;

    Ok(Json(TextResponse::new(text)))
}
