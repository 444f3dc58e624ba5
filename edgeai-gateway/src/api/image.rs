//! Image-bearing endpoints and stored image retrieval.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Json;
use edgeai_common::{ImageRequest, TextResponse};
use image::DynamicImage;
use tokio_util::io::ReaderStream;

use super::body::JsonBody;
use crate::error::{Error, Result};
use crate::images::decode_base64_image;
use crate::pipeline::DEFAULT_IMAGE_PROMPT;
use crate::state::AppState;

/// POST /edgeai_image - Two-stage description then attribute extraction.
///
/// Only the extracted attributes are returned as `text`.
pub async fn extract_attributes(
    State(state): State<Arc<AppState>>,
    body: JsonBody,
) -> Result<Json<TextResponse>> {
    let request: ImageRequest = body.decode()?;
    let image = decode_image(request.image).await?;
    let image_url = store_image(&state, &image).await;
    let prompt = prompt_or_default(request.prompt.as_deref(), DEFAULT_IMAGE_PROMPT);

    let text = match state
        .pipeline
        .extract_attributes(request.model.as_deref(), &body.overrides(), prompt, &image)
        .await
    {
        Ok(extraction) => extraction.attributes,
        Err(e) => e.soft_text()?,
    };

    Ok(Json(text_response(text, image_url)))
}

/// POST /edgeai_image_direct - Single inference with the image attached.
pub async fn describe(
    State(state): State<Arc<AppState>>,
    body: JsonBody,
) -> Result<Json<TextResponse>> {
    let request: ImageRequest = body.decode()?;
    let image = decode_image(request.image).await?;
    let image_url = store_image(&state, &image).await;
    let prompt = prompt_or_default(request.prompt.as_deref(), DEFAULT_IMAGE_PROMPT);

    let text = state
        .pipeline
        .run(
            request.model.as_deref(),
            &body.overrides(),
            prompt,
            std::slice::from_ref(&image),
        )
        .await
        .or_else(Error::soft_text)?;

    Ok(Json(text_response(text, image_url)))
}

/// GET /images/:filename - Stream a stored PNG.
pub async fn serve_image(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response> {
    let path = state.images.resolve(&filename).await.ok_or(Error::NotFound)?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| Error::NotFound)?;

    let body = Body::from_stream(ReaderStream::new(file));
    Ok(([(CONTENT_TYPE, "image/png")], body).into_response())
}

/// The request prompt, or `default` when absent or blank.
pub(crate) fn prompt_or_default<'a>(prompt: Option<&'a str>, default: &'a str) -> &'a str {
    prompt.filter(|p| !p.trim().is_empty()).unwrap_or(default)
}

async fn decode_image(payload: String) -> Result<DynamicImage> {
    let image = tokio::task::spawn_blocking(move || decode_base64_image(&payload)).await??;
    tracing::debug!(width = image.width(), height = image.height(), "Decoded request image");
    Ok(image)
}

/// Persist the request image. Storage failures do not fail the request.
async fn store_image(state: &AppState, image: &DynamicImage) -> Option<String> {
    match state.images.save_png(image).await {
        Ok(stored) => Some(stored.url()),
        Err(e) => {
            tracing::warn!("Failed to store request image: {}", e);
            None
        }
    }
}

fn text_response(text: String, image_url: Option<String>) -> TextResponse {
    match image_url {
        Some(url) => TextResponse::new(text).with_image_url(url),
        None => TextResponse::new(text),
    }
}
