//! Integration tests for the gateway HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body, Bytes},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use edgeai_common::ModelDescriptor;
use edgeai_gateway::test_util::{sample_png_base64, test_config, ScriptedBinding, TEST_MODEL};
use edgeai_gateway::{build_router, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    binding: ScriptedBinding,
    state: Arc<AppState>,
    _dir: TempDir,
}

fn test_app() -> TestApp {
    app_with_models(None)
}

/// Gateway whose registry holds no model usable for inference.
fn app_without_llm() -> TestApp {
    app_with_models(Some(vec![ModelDescriptor::new("classifier")]))
}

fn app_with_models(models: Option<Vec<ModelDescriptor>>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let binding = ScriptedBinding::new();
    let mut config = test_config(&dir.path().join("images"));
    if let Some(models) = models {
        config.models = models;
    }
    let state = Arc::new(AppState::new(config, Arc::new(binding.clone())));
    TestApp {
        app: build_router(state.clone()),
        binding,
        state,
        _dir: dir,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post(&self, uri: &str, body: impl Into<Body>) -> (StatusCode, HeaderMap, Bytes) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(body.into())
                .unwrap(),
        )
        .await
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let (status, _, bytes) = self.post(uri, body.to_string()).await;
        assert_eq!(status, StatusCode::OK, "body: {}", String::from_utf8_lossy(&bytes));
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    /// No request left a session behind.
    fn assert_released(&self) {
        assert!(self.state.sessions.live_models().is_empty());
        assert_eq!(self.binding.live_sessions(), 0);
    }
}

fn text(body: &Bytes) -> &str {
    std::str::from_utf8(body).unwrap()
}

fn assert_cors(headers: &HeaderMap) {
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["access-control-allow-methods"], "GET, POST, OPTIONS");
    assert!(headers.contains_key("access-control-allow-headers"));
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();
    let (status, headers, body) = app.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), "OK");
    assert!(headers["content-type"].to_str().unwrap().starts_with("text/plain"));
    assert_cors(&headers);
}

#[tokio::test]
async fn test_health_ignores_model_state() {
    let app = app_without_llm();
    let (status, _, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), "OK");
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let app = test_app();

    let (status, headers, body) = app.get("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(text(&body), "Not Found");
    assert_cors(&headers);

    // Known path, wrong method.
    let (status, _, body) = app.get("/edgeai").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(text(&body), "Not Found");
}

#[tokio::test]
async fn test_options_preflight_short_circuits() {
    let app = test_app();

    for uri in ["/edgeai_image", "/nope", "/images/whatever.png"] {
        let (status, headers, body) = app
            .send(
                Request::builder()
                    .method("OPTIONS")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "uri {}", uri);
        assert!(body.is_empty());
        assert_eq!(headers["access-control-max-age"], "3600");
        assert_cors(&headers);
    }
    assert!(app.binding.lifecycle().is_empty());
}

#[tokio::test]
async fn test_text_inference() {
    let app = test_app();
    let (_, body) = app.post_json("/edgeai", json!({ "prompt": "hello" })).await;

    assert_eq!(body["text"], "echo: hello");
    assert!(body.get("imageUrl").is_none());

    let generations = app.binding.generations();
    assert_eq!(generations.len(), 1);
    assert_eq!(generations[0].model, TEST_MODEL);
    app.assert_released();
}

#[tokio::test]
async fn test_missing_json_is_bad_request() {
    let app = test_app();

    for body in ["", "not json", "[]"] {
        let (status, headers, bytes) = app.post("/edgeai", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text(&bytes), "No JSON data found");
        assert!(headers["content-type"].to_str().unwrap().starts_with("text/plain"));
    }

    let (status, _, bytes) = app.post("/edgeai", json!({ "model": TEST_MODEL }).to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(text(&bytes).starts_with("Invalid request:"));
    assert!(app.binding.lifecycle().is_empty());
}

#[tokio::test]
async fn test_no_model_is_soft_result() {
    let app = app_without_llm();
    let image = sample_png_base64(4, 4);

    for (uri, body) in [
        ("/edgeai", json!({ "prompt": "hi" })),
        ("/edgeai_image", json!({ "image": image })),
        ("/edgeai_image_direct", json!({ "image": image })),
        ("/edgeai_image_url", json!({ "imageUrl": "http://example.com/a.png" })),
    ] {
        let (_, body) = app.post_json(uri, body).await;
        assert_eq!(body["text"], "No LLM model available", "uri {}", uri);
    }

    let (_, body) = app
        .post_json(
            "/edgeai_chat",
            json!({ "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;
    assert_eq!(
        body["messages"][0]["content"][0]["text"],
        "No LLM model available"
    );

    let (_, body) = app
        .post_json("/edgeai", json!({ "prompt": "hi", "model": "missing" }))
        .await;
    assert_eq!(body["text"], "No LLM model available");
    assert!(app.binding.lifecycle().is_empty());
}

#[tokio::test]
async fn test_image_missing_field_is_bad_request() {
    let app = test_app();
    let (status, _, body) = app
        .post("/edgeai_image", json!({ "prompt": "describe" }).to_string())
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(text(&body).contains("image"));
    assert!(app.binding.lifecycle().is_empty());
}

#[tokio::test]
async fn test_corrupt_image_never_reaches_engine() {
    let app = test_app();

    for image in ["!!!definitely not base64!!!", "aGVsbG8gd29ybGQ="] {
        for uri in ["/edgeai_image", "/edgeai_image_direct"] {
            let (status, _, body) = app.post(uri, json!({ "image": image }).to_string()).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(text(&body).starts_with("Invalid image"), "body {}", text(&body));
        }
    }

    assert!(app.binding.lifecycle().is_empty());
    assert!(app.binding.generations().is_empty());
}

#[tokio::test]
async fn test_image_direct_round_trips_dimensions() {
    let app = test_app();
    let (_, body) = app
        .post_json(
            "/edgeai_image_direct",
            json!({ "image": sample_png_base64(13, 7), "prompt": "What is this?" }),
        )
        .await;

    assert_eq!(body["text"], "echo: What is this?");
    let generations = app.binding.generations();
    assert_eq!(generations.len(), 1);
    assert_eq!(generations[0].images, vec![(13, 7)]);
    app.assert_released();
}

#[tokio::test]
async fn test_image_direct_accepts_data_url_and_default_prompt() {
    let app = test_app();
    let payload = format!("data:image/png;base64,{}", sample_png_base64(2, 3));
    app.post_json("/edgeai_image_direct", json!({ "image": payload }))
        .await;

    let generations = app.binding.generations();
    assert_eq!(generations[0].images, vec![(2, 3)]);
    assert_eq!(
        generations[0].prompt(),
        edgeai_gateway::pipeline::DEFAULT_IMAGE_PROMPT
    );
}

#[tokio::test]
async fn test_image_pipeline_feeds_stage_one_into_stage_two() {
    let app = test_app();
    app.binding.respond_with(|_, images| {
        if images > 0 {
            vec!["A woman with ".into(), "long red hair.".into()]
        } else {
            vec!["{\"hair_color\": \"red\"}".into()]
        }
    });

    let (_, body) = app
        .post_json("/edgeai_image", json!({ "image": sample_png_base64(8, 8) }))
        .await;
    assert_eq!(body["text"], "{\"hair_color\": \"red\"}");

    let generations = app.binding.generations();
    assert_eq!(generations.len(), 2);
    assert_eq!(generations[0].images, vec![(8, 8)]);
    assert!(generations[1].images.is_empty());
    assert!(generations[1].prompt().contains("A woman with long red hair."));
    app.assert_released();
}

#[tokio::test]
async fn test_stored_image_is_served() {
    let app = test_app();
    let (_, body) = app
        .post_json("/edgeai_image", json!({ "image": sample_png_base64(5, 9) }))
        .await;

    let url = body["imageUrl"].as_str().unwrap();
    assert!(url.starts_with("/images/") && url.ends_with(".png"));

    let (status, headers, bytes) = app.get(url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "image/png");
    let image = image::load_from_memory(&bytes).unwrap();
    assert_eq!((image.width(), image.height()), (5, 9));
}

#[tokio::test]
async fn test_image_route_rejects_missing_and_traversal() {
    let app = test_app();
    std::fs::create_dir_all(app.state.images.root()).unwrap();
    std::fs::write(app.state.images.root().join("../secret.txt"), b"secret").unwrap();

    for uri in [
        "/images/missing.png",
        "/images/..%2Fsecret.txt",
        "/images/%2E%2E%2Fsecret.txt",
    ] {
        let (status, _, body) = app.get(uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "uri {}", uri);
        assert_eq!(text(&body), "Not Found");
    }
}

#[tokio::test]
async fn test_chat_uses_last_message_text_blocks() {
    let app = test_app();
    let (_, body) = app
        .post_json(
            "/edgeai_chat",
            json!({
                "messages": [
                    { "role": "user", "content": "earlier question" },
                    { "role": "assistant", "content": "earlier answer" },
                    { "role": "user", "content": [
                        { "type": "text", "text": "Hello" },
                        { "type": "image", "image": "ignored" },
                        { "type": "text", "text": "World" }
                    ]}
                ]
            }),
        )
        .await;

    assert_eq!(
        body,
        json!({
            "messages": [{
                "role": "assistant",
                "content": [{ "type": "text", "text": "echo: Hello\nWorld" }]
            }]
        })
    );
    assert_eq!(app.binding.generations()[0].prompt(), "Hello\nWorld");
}

#[tokio::test]
async fn test_chat_without_messages_is_bad_request() {
    let app = test_app();
    let (status, _, _) = app
        .post("/edgeai_chat", json!({ "messages": [] }).to_string())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_image_url_is_embedded_in_prompt() {
    let app = test_app();
    app.post_json(
        "/edgeai_image_url",
        json!({ "imageUrl": "http://example.com/cat.png", "prompt": "What animal?" }),
    )
    .await;
    app.post_json(
        "/edgeai_image_url",
        json!({ "imageUrl": "http://example.com/dog.png" }),
    )
    .await;

    let generations = app.binding.generations();
    assert_eq!(
        generations[0].prompt(),
        "What animal? url:http://example.com/cat.png"
    );
    assert_eq!(
        generations[1].prompt(),
        "Describe this image. url:http://example.com/dog.png"
    );
    assert!(generations[0].images.is_empty());
}

#[tokio::test]
async fn test_generation_overrides_apply_per_request() {
    let app = test_app();
    app.post_json(
        "/edgeai_image_direct",
        json!({ "image": sample_png_base64(2, 2), "temperature": "0.3", "top_p": 0.5 }),
    )
    .await;
    app.post_json("/edgeai", json!({ "prompt": "again" })).await;

    let generations = app.binding.generations();
    assert_eq!(generations[0].options.temperature, 0.3);
    assert_eq!(generations[0].options.top_p, 0.5);

    // The registry's defaults are untouched for the next request.
    let defaults = &app.state.registry.get(TEST_MODEL).unwrap().generation_config;
    assert_eq!(generations[1].options.temperature, defaults.temperature);
    assert_eq!(generations[1].options.top_p, defaults.top_p);
}

#[tokio::test]
async fn test_engine_faults_are_soft_results() {
    let app = test_app();
    app.binding
        .fail_init("Failed to create engine\n=== Source Location Trace ===\nengine.cc:42");
    let (_, body) = app.post_json("/edgeai", json!({ "prompt": "hi" })).await;
    assert_eq!(body["text"], "Failed to create engine");
    app.assert_released();

    let app = test_app();
    app.binding.fail_generation("GPU delegate lost");
    let (_, body) = app.post_json("/edgeai", json!({ "prompt": "hi" })).await;
    assert_eq!(body["text"], "Error during inference: GPU delegate lost");
    app.assert_released();
}

#[tokio::test]
async fn test_models_endpoint() {
    let app = test_app();
    let (status, _, bytes) = app.get("/models").await;
    assert_eq!(status, StatusCode::OK);

    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["models"][0]["name"], TEST_MODEL);
    assert_eq!(body["models"][0]["supportsImage"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_serialized_per_model() {
    let app = Arc::new(test_app());
    app.binding.delta_delay(Duration::from_millis(2));
    app.binding
        .respond_with(|prompt, _| prompt.chars().map(|c| c.to_string()).collect());

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let app = app.clone();
            tokio::spawn(async move {
                let prompt = format!("request number {}", i);
                let (_, body) = app.post_json("/edgeai", json!({ "prompt": prompt })).await;
                (prompt, body["text"].as_str().unwrap().to_string())
            })
        })
        .collect();

    for task in tasks {
        let (prompt, text) = task.await.unwrap();
        assert_eq!(text, prompt);
    }

    assert_eq!(app.binding.generations().len(), 8);
    assert_eq!(app.binding.max_live_sessions(), 1);
    app.assert_released();
}
