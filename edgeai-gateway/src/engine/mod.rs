//! Inference engine binding layer.
//!
//! The gateway drives engines through three traits mirroring how on-device
//! runtimes are shaped: an [`EngineBinding`] loads model weights into an
//! [`Engine`], which hands out stateful [`Session`]s. Sessions accept query
//! chunks and images, then stream their answer back through a callback
//! invoked from an engine-managed thread.
//!
//! Creation and close calls may block (weights are loaded or released), so
//! callers run them off the async executor.

mod ollama;

pub use ollama::OllamaBinding;

use std::sync::Arc;

use edgeai_common::{Accelerator, GenerationConfig, ModelDescriptor};
use image::DynamicImage;

/// Marker emitted by native runtimes ahead of their internal stack dump.
const SOURCE_TRACE_MARKER: &str = "=== Source Location Trace";

/// One event delivered by a generating session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A text increment. `done` marks the last one.
    Delta { text: String, done: bool },
    /// Generation stopped with an engine fault.
    Failed(String),
}

/// Streaming callback handed to [`Session::generate_async`].
pub type ResultListener = Box<dyn FnMut(StreamEvent) + Send + 'static>;

/// Notification run once when a session is torn down.
pub type CleanUpListener = Box<dyn FnOnce() + Send + 'static>;

/// Fault reported by an engine binding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Options used when loading a model into an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub model: String,
    pub max_tokens: u32,
    pub max_num_images: usize,
    pub accelerator: Accelerator,
}

impl EngineOptions {
    pub fn new(descriptor: &ModelDescriptor, config: &GenerationConfig) -> Self {
        Self {
            model: descriptor.engine_model().to_string(),
            max_tokens: config.max_tokens,
            max_num_images: descriptor.max_num_images(),
            accelerator: config.accelerator,
        }
    }
}

/// Sampling options of a single session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub enable_vision: bool,
}

impl SessionOptions {
    pub fn new(descriptor: &ModelDescriptor, config: &GenerationConfig) -> Self {
        Self {
            top_k: config.top_k,
            top_p: config.top_p,
            temperature: config.temperature,
            enable_vision: descriptor.supports_image,
        }
    }
}

/// Factory loading models into engines.
pub trait EngineBinding: Send + Sync {
    /// Short identifier used in logs (e.g. "ollama").
    fn name(&self) -> &'static str;

    /// Load the model described by `descriptor`. May block.
    fn create_engine(
        &self,
        descriptor: &ModelDescriptor,
        options: &EngineOptions,
    ) -> EngineResult<Arc<dyn Engine>>;
}

/// A loaded model.
pub trait Engine: Send + Sync {
    /// Open a fresh session with empty context. May block.
    fn create_session(&self, options: &SessionOptions) -> EngineResult<Box<dyn Session>>;

    /// Release the model. Sessions must be closed first.
    fn close(&self) -> EngineResult<()>;
}

/// Conversational state on top of an engine.
pub trait Session: Send {
    fn add_query_chunk(&mut self, text: &str) -> EngineResult<()>;

    fn add_image(&mut self, image: &DynamicImage) -> EngineResult<()>;

    /// Start generating. Returns immediately; `listener` receives deltas
    /// from another thread until a `done` delta or a failure.
    fn generate_async(&mut self, listener: ResultListener) -> EngineResult<()>;

    /// Stop an in-flight generation, if any. The listener may not be called again.
    fn cancel(&mut self);

    fn close(&mut self) -> EngineResult<()>;
}

/// Strip native stack traces from an engine message.
pub fn clean_up_engine_error_message(message: &str) -> String {
    let message = match message.find(SOURCE_TRACE_MARKER) {
        Some(index) => &message[..index],
        None => message,
    };
    let message = message.trim();
    if message.is_empty() {
        "Unknown error".to_string()
    } else {
        message.to_string()
    }
}
