//! EdgeAI Common Types
//!
//! Wire and catalog types shared by the gateway and its clients.

pub mod api;
pub mod model;

pub use api::{
    ChatMessage, ChatRequest, ChatResponse, ContentBlock, ImageRequest, ImageUrlRequest,
    MessageContent, ModelsResponse, TextRequest, TextResponse,
};
pub use model::{
    Accelerator, GenerationConfig, GenerationOverrides, ModelDescriptor, MAX_IMAGE_COUNT,
};
