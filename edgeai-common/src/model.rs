//! Model catalog types: descriptors and generation parameters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Upper bound on images attached to a single session of an image-capable model.
pub const MAX_IMAGE_COUNT: usize = 10;

/// Hardware backend an engine should prefer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    #[default]
    Gpu,
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Accelerator::Cpu => write!(f, "CPU"),
            Accelerator::Gpu => write!(f, "GPU"),
        }
    }
}

/// Tunable generation parameters of a model.
///
/// Keys are accepted in both `camelCase` and `snake_case` so the same type
/// can be read from `config.toml` and written to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default = "default_max_tokens", alias = "max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_k", alias = "top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p", alias = "top_p")]
    pub top_p: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub accelerator: Accelerator,
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}
fn default_top_k() -> u32 {
    DEFAULT_TOP_K
}
fn default_top_p() -> f32 {
    DEFAULT_TOP_P
}
fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            temperature: DEFAULT_TEMPERATURE,
            accelerator: Accelerator::default(),
        }
    }
}

impl GenerationConfig {
    /// Returns a copy with every present override applied.
    pub fn with_overrides(&self, overrides: &GenerationOverrides) -> Self {
        Self {
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
            top_k: overrides.top_k.unwrap_or(self.top_k),
            top_p: overrides.top_p.unwrap_or(self.top_p),
            temperature: overrides.temperature.unwrap_or(self.temperature),
            accelerator: self.accelerator,
        }
    }
}

/// Per-request partial generation config.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationOverrides {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
}

impl GenerationOverrides {
    /// Read overrides from a request body.
    ///
    /// Recognised keys are `temperature`, `top_p`, `topK` and `maxTokens`.
    /// Values may be JSON numbers or numeric strings. Anything missing,
    /// non-numeric or out of range is left unset.
    pub fn from_json(body: &Value) -> Self {
        let temperature = number_field(body, &["temperature"])
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as f32);
        let top_p = number_field(body, &["top_p", "topP"])
            .filter(|v| v.is_finite() && *v > 0.0 && *v <= 1.0)
            .map(|v| v as f32);
        let top_k = number_field(body, &["topK", "top_k"])
            .filter(|v| v.is_finite() && *v >= 1.0 && *v <= u32::MAX as f64)
            .map(|v| v as u32);
        let max_tokens = number_field(body, &["maxTokens", "max_tokens"])
            .filter(|v| v.is_finite() && *v >= 1.0 && *v <= u32::MAX as f64)
            .map(|v| v as u32);

        Self {
            temperature,
            top_p,
            top_k,
            max_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.top_p.is_none()
            && self.top_k.is_none()
            && self.max_tokens.is_none()
    }
}

fn number_field(body: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| body.get(*key))
        .find_map(|value| match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
}

/// Static record describing a model the engine can serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    /// Unique key used by requests (`"model": "..."`).
    pub name: String,
    /// Identifier of the model inside the engine. Falls back to `name`.
    #[serde(default, alias = "engine_model", skip_serializing_if = "Option::is_none")]
    pub engine_model: Option<String>,
    #[serde(default, alias = "prompt_templates", skip_serializing_if = "Option::is_none")]
    pub prompt_templates: Option<Vec<String>>,
    #[serde(default, alias = "supports_image")]
    pub supports_image: bool,
    #[serde(default, alias = "supports_audio")]
    pub supports_audio: bool,
    #[serde(default, alias = "generation_config")]
    pub generation_config: GenerationConfig,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine_model: None,
            prompt_templates: None,
            supports_image: false,
            supports_audio: false,
            generation_config: GenerationConfig::default(),
        }
    }

    /// Whether this model can back the generic LLM endpoints.
    pub fn is_llm(&self) -> bool {
        self.prompt_templates.is_some() || self.supports_image || self.supports_audio
    }

    pub fn engine_model(&self) -> &str {
        self.engine_model.as_deref().unwrap_or(&self.name)
    }

    /// Number of images a session for this model may accept.
    pub fn max_num_images(&self) -> usize {
        if self.supports_image {
            MAX_IMAGE_COUNT
        } else {
            0
        }
    }
}
