//! Ollama engine binding.
//!
//! Maps the engine/session model onto a local Ollama server: creating an
//! engine warms the model with `keep_alive`, a session accumulates its
//! transcript locally and each generation streams `/api/generate`.

use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use edgeai_common::ModelDescriptor;
use futures_util::StreamExt;
use image::DynamicImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use super::{
    Engine, EngineBinding, EngineError, EngineOptions, EngineResult, ResultListener, Session,
    SessionOptions, StreamEvent,
};
use crate::images::encode_png;

/// How long Ollama keeps a warmed model resident.
const KEEP_ALIVE: &str = "10m";

/// Binding that serves models from an Ollama server.
pub struct OllamaBinding {
    http_client: Client,
    base_url: String,
    runtime: Handle,
}

impl OllamaBinding {
    /// Create a binding. Must be called from within a tokio runtime, which
    /// is used to drive streaming generations.
    pub fn new(base_url: &str) -> Self {
        Self::with_runtime(base_url, Handle::current())
    }

    pub fn with_runtime(base_url: &str, runtime: Handle) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            runtime,
        }
    }
}

// ============================================================================
// Ollama API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_k: u32,
    top_p: f32,
    num_predict: u32,
}

/// One NDJSON line of a streaming `/api/generate` response.
#[derive(Debug, Deserialize, PartialEq)]
struct OllamaGenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Splits a byte stream into NDJSON chunks.
#[derive(Debug, Default)]
struct ChunkDecoder {
    buffer: Vec<u8>,
}

impl ChunkDecoder {
    /// Feed bytes, returning every complete line decoded so far.
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<OllamaGenerateChunk, String>> {
        self.buffer.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(chunk) = decode_line(&line) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Decode whatever is left once the stream has ended.
    fn finish(&mut self) -> Option<Result<OllamaGenerateChunk, String>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<OllamaGenerateChunk, String>> {
    let line = std::str::from_utf8(line).map(str::trim);
    match line {
        Ok("") => None,
        Ok(text) => Some(
            serde_json::from_str(text).map_err(|e| format!("Malformed stream line: {}", e)),
        ),
        Err(e) => Some(Err(format!("Malformed stream line: {}", e))),
    }
}

// ============================================================================
// Binding / engine / session
// ============================================================================

impl EngineBinding for OllamaBinding {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn create_engine(
        &self,
        descriptor: &ModelDescriptor,
        options: &EngineOptions,
    ) -> EngineResult<Arc<dyn Engine>> {
        let url = format!("{}/api/generate", self.base_url);
        let request = OllamaGenerateRequest {
            model: options.model.clone(),
            prompt: String::new(),
            stream: false,
            images: Vec::new(),
            options: None,
            keep_alive: Some(KEEP_ALIVE.to_string()),
        };

        // Warm the model so load failures surface as initialization errors.
        let client = self.http_client.clone();
        self.runtime.block_on(async move {
            let response = client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| EngineError::new(format!("Ollama unreachable: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(EngineError::new(format!(
                    "Failed to load model {}: Ollama returned {}: {}",
                    request.model, status, body
                )));
            }
            Ok(())
        })?;

        tracing::info!(
            model = %descriptor.name,
            engine_model = %options.model,
            accelerator = %options.accelerator,
            "Ollama model warmed"
        );

        Ok(Arc::new(OllamaEngine {
            http_client: self.http_client.clone(),
            base_url: self.base_url.clone(),
            options: options.clone(),
            runtime: self.runtime.clone(),
        }))
    }
}

struct OllamaEngine {
    http_client: Client,
    base_url: String,
    options: EngineOptions,
    runtime: Handle,
}

impl Engine for OllamaEngine {
    fn create_session(&self, options: &SessionOptions) -> EngineResult<Box<dyn Session>> {
        Ok(Box::new(OllamaSession {
            http_client: self.http_client.clone(),
            url: format!("{}/api/generate", self.base_url),
            engine: self.options.clone(),
            options: *options,
            transcript: Arc::new(Mutex::new(String::new())),
            images: Vec::new(),
            generation: None,
            runtime: self.runtime.clone(),
            closed: false,
        }))
    }

    fn close(&self) -> EngineResult<()> {
        let url = format!("{}/api/generate", self.base_url);
        let request = OllamaGenerateRequest {
            model: self.options.model.clone(),
            prompt: String::new(),
            stream: false,
            images: Vec::new(),
            options: None,
            keep_alive: Some("0".to_string()),
        };
        let client = self.http_client.clone();

        // Unloading is best effort and must not block the caller.
        self.runtime.spawn(async move {
            match client.post(&url).json(&request).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Ollama model {} unloaded", request.model);
                }
                Ok(response) => {
                    tracing::warn!(
                        "Failed to unload Ollama model {}: {}",
                        request.model,
                        response.status()
                    );
                }
                Err(e) => tracing::warn!("Failed to unload Ollama model {}: {}", request.model, e),
            }
        });
        Ok(())
    }
}

struct OllamaSession {
    http_client: Client,
    url: String,
    engine: EngineOptions,
    options: SessionOptions,
    /// Prompt text so far, including previous replies.
    transcript: Arc<Mutex<String>>,
    /// Base64 PNGs attached to this session.
    images: Vec<String>,
    generation: Option<AbortHandle>,
    runtime: Handle,
    closed: bool,
}

impl OllamaSession {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed {
            Err(EngineError::new("Session is closed"))
        } else {
            Ok(())
        }
    }
}

impl Session for OllamaSession {
    fn add_query_chunk(&mut self, text: &str) -> EngineResult<()> {
        self.ensure_open()?;
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
        Ok(())
    }

    fn add_image(&mut self, image: &DynamicImage) -> EngineResult<()> {
        self.ensure_open()?;
        if !self.options.enable_vision || self.images.len() >= self.engine.max_num_images {
            return Err(EngineError::new(format!(
                "Model {} accepts at most {} images",
                self.engine.model, self.engine.max_num_images
            )));
        }
        let png = encode_png(image).map_err(|e| EngineError::new(e.to_string()))?;
        self.images.push(STANDARD.encode(png));
        Ok(())
    }

    fn generate_async(&mut self, listener: ResultListener) -> EngineResult<()> {
        self.ensure_open()?;
        if self.generation.as_ref().is_some_and(|g| !g.is_finished()) {
            return Err(EngineError::new("A generation is already in progress"));
        }

        let prompt = self
            .transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let request = OllamaGenerateRequest {
            model: self.engine.model.clone(),
            prompt,
            stream: true,
            images: self.images.clone(),
            options: Some(OllamaOptions {
                temperature: self.options.temperature,
                top_k: self.options.top_k,
                top_p: self.options.top_p,
                num_predict: self.engine.max_tokens,
            }),
            keep_alive: Some(KEEP_ALIVE.to_string()),
        };

        let task = self.runtime.spawn(stream_generation(
            self.http_client.clone(),
            self.url.clone(),
            request,
            self.transcript.clone(),
            listener,
        ));
        self.generation = Some(task.abort_handle());
        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(generation) = self.generation.take() {
            generation.abort();
        }
    }

    fn close(&mut self) -> EngineResult<()> {
        self.cancel();
        self.closed = true;
        self.images.clear();
        Ok(())
    }
}

async fn stream_generation(
    client: Client,
    url: String,
    request: OllamaGenerateRequest,
    transcript: Arc<Mutex<String>>,
    mut listener: ResultListener,
) {
    let response = match client.post(&url).json(&request).send().await {
        Ok(response) => response,
        Err(e) => {
            listener(StreamEvent::Failed(format!("Ollama unreachable: {}", e)));
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        listener(StreamEvent::Failed(format!("Ollama returned {}: {}", status, body)));
        return;
    }

    let mut decoder = ChunkDecoder::default();
    let mut reply = String::new();
    let mut stream = response.bytes_stream();

    let mut deliver = |chunk: Result<OllamaGenerateChunk, String>, reply: &mut String| -> bool {
        match chunk {
            Ok(OllamaGenerateChunk {
                error: Some(error), ..
            }) => {
                listener(StreamEvent::Failed(error));
                true
            }
            Ok(chunk) => {
                reply.push_str(&chunk.response);
                listener(StreamEvent::Delta {
                    text: chunk.response,
                    done: chunk.done,
                });
                chunk.done
            }
            Err(message) => {
                listener(StreamEvent::Failed(message));
                true
            }
        }
    };

    let mut finished = false;
    while let Some(bytes) = stream.next().await {
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                deliver(Err(format!("Ollama stream interrupted: {}", e)), &mut reply);
                return;
            }
        };
        for chunk in decoder.push(&bytes) {
            if deliver(chunk, &mut reply) {
                finished = true;
                break;
            }
        }
        if finished {
            break;
        }
    }

    if !finished {
        if let Some(chunk) = decoder.finish() {
            finished = deliver(chunk, &mut reply);
        }
    }
    if !finished {
        deliver(
            Err("Ollama stream ended before completion".to_string()),
            &mut reply,
        );
        return;
    }

    transcript
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_str(&reply);
}
