//! Request and response bodies of the gateway's HTTP endpoints.

use serde::{Deserialize, Serialize};

use crate::model::ModelDescriptor;

/// Body of `POST /edgeai`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Body of `POST /edgeai_image` and `POST /edgeai_image_direct`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    /// Base64 PNG or JPEG, optionally as a `data:` URL.
    pub image: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Body of `POST /edgeai_image_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrlRequest {
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Body of `POST /edgeai_chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatRequest {
    /// Text of the last message, with text blocks joined by newlines.
    ///
    /// Non-text blocks are skipped. Returns `None` when there are no messages.
    pub fn last_message_text(&self) -> Option<String> {
        self.messages.last().map(|message| message.content.text())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: MessageContent::Blocks(vec![ContentBlock::text(text)]),
        }
    }
}

/// Message content: either a bare string or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|block| block.kind == "text")
                .filter_map(|block| block.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One content block. Only `text` blocks carry meaning for the gateway;
/// other block types (e.g. `image`) are accepted and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

/// Response of `POST /edgeai_chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub messages: Vec<ChatMessage>,
}

impl ChatResponse {
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::assistant_text(text)],
        }
    }
}

/// Response of every single-result inference endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub text: String,
    /// Where the uploaded image was stored, for image-bearing requests.
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl TextResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_url: None,
        }
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }
}

/// Response of `GET /models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelDescriptor>,
}
