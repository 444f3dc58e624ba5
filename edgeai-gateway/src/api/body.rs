//! Lenient JSON body extraction.

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::response::{IntoResponse, Response};
use edgeai_common::GenerationOverrides;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// A request body holding a JSON object.
///
/// The web UI posts without a reliable `Content-Type`, so the raw bytes are
/// parsed whatever the header says. Anything that is not a JSON object is
/// rejected with `400 No JSON data found`.
#[derive(Debug, Clone)]
pub struct JsonBody(pub Value);

#[async_trait]
impl<S> FromRequest<S> for JsonBody
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(IntoResponse::into_response)?;

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) if value.is_object() => Ok(Self(value)),
            _ => Err(Error::no_json().into_response()),
        }
    }
}

impl JsonBody {
    /// Deserialize the endpoint-specific request type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.0).map_err(|e| Error::Parse(format!("Invalid request: {}", e)))
    }

    /// Generation overrides carried next to the request fields.
    pub fn overrides(&self) -> GenerationOverrides {
        GenerationOverrides::from_json(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use edgeai_common::TextRequest;
    use serde_json::json;

    async fn extract(body: &'static str) -> std::result::Result<JsonBody, Response> {
        let request = Request::builder()
            .method("POST")
            .uri("/edgeai")
            .body(Body::from(body))
            .unwrap();
        JsonBody::from_request(request, &()).await
    }

    #[tokio::test]
    async fn test_accepts_object_without_content_type() {
        let body = extract(r#"{"prompt": "hi"}"#).await.unwrap();
        let request: TextRequest = body.decode().unwrap();
        assert_eq!(request.prompt, "hi");
        assert!(request.model.is_none());
    }

    #[tokio::test]
    async fn test_rejects_non_objects() {
        for body in ["", "not json", "[1, 2]", "\"text\"", "null"] {
            let rejection = extract(body).await.unwrap_err();
            assert_eq!(rejection.status(), StatusCode::BAD_REQUEST, "body {:?}", body);
        }
    }

    #[test]
    fn test_decode_reports_missing_field() {
        let body = JsonBody(json!({ "model": "gemma" }));
        let err = body.decode::<TextRequest>().unwrap_err();
        assert!(matches!(err, Error::Parse(ref m) if m.starts_with("Invalid request:")));
    }

    #[test]
    fn test_overrides_read_from_body() {
        let body = JsonBody(json!({ "prompt": "hi", "temperature": "0.4", "topK": 7 }));
        let overrides = body.overrides();
        assert_eq!(overrides.temperature, Some(0.4));
        assert_eq!(overrides.top_k, Some(7));
    }
}
