//! Model registry: the static catalog of models the gateway may serve.

use edgeai_common::{
    Accelerator, GenerationConfig, GenerationOverrides, ModelDescriptor,
};

use crate::config::Config;
use crate::error::{Error, Result};

/// Name of the model shipped in the built-in catalog.
pub const DEFAULT_MODEL_NAME: &str = "gemma3n_e4b_it";

/// Built-in catalog used when the configuration lists no models and
/// `inference.builtin_models` is on.
pub fn builtin_models() -> Vec<ModelDescriptor> {
    vec![ModelDescriptor {
        name: DEFAULT_MODEL_NAME.to_string(),
        engine_model: Some("gemma3n:e4b".to_string()),
        prompt_templates: None,
        supports_image: true,
        supports_audio: false,
        // Low temperature and narrow sampling keep attribute extraction factual.
        generation_config: GenerationConfig {
            max_tokens: 1024,
            top_k: 20,
            top_p: 0.8,
            temperature: 0.2,
            accelerator: Accelerator::Gpu,
        },
    }]
}

/// A model picked for one request, with its request-scoped generation config.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub descriptor: ModelDescriptor,
    pub config: GenerationConfig,
}

/// Read-only, ordered registry of model descriptors.
///
/// Descriptors are never mutated after startup; per-request overrides are
/// applied to copies handed out by [`ModelRegistry::resolve`].
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    /// Build a registry. Later descriptors reusing a name are dropped.
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        let mut unique: Vec<ModelDescriptor> = Vec::with_capacity(models.len());
        for model in models {
            if unique.iter().any(|m| m.name == model.name) {
                tracing::warn!("Ignoring duplicate model descriptor: {}", model.name);
                continue;
            }
            unique.push(model);
        }
        Self { models: unique }
    }

    pub fn from_config(config: &Config) -> Self {
        if !config.models.is_empty() {
            Self::new(config.models.clone())
        } else if config.inference.builtin_models {
            Self::new(builtin_models())
        } else {
            Self::default()
        }
    }

    /// All descriptors, in resolution order.
    pub fn all(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }

    /// First model usable by the generic LLM endpoints.
    pub fn default_llm(&self) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.is_llm())
    }

    /// Pick the model for a request and build its working generation config.
    ///
    /// A blank or missing name selects [`ModelRegistry::default_llm`].
    pub fn resolve(
        &self,
        name: Option<&str>,
        overrides: &GenerationOverrides,
    ) -> Result<ResolvedModel> {
        let descriptor = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => self.get(name),
            None => self.default_llm(),
        }
        .ok_or(Error::ModelUnavailable)?;

        if !overrides.is_empty() {
            tracing::debug!(model = %descriptor.name, ?overrides, "Applying generation overrides");
        }

        Ok(ResolvedModel {
            config: descriptor.generation_config.with_overrides(overrides),
            descriptor: descriptor.clone(),
        })
    }
}
