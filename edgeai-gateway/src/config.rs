//! Configuration for the gateway.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use edgeai_common::ModelDescriptor;
use serde::Deserialize;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Model registry, in resolution order. Empty means the built-in catalog
    /// unless `inference.builtin_models` is off.
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request body limit. Base64 images routinely exceed axum's 2 MiB default.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Upper bound on a single generation, after which partial output is returned.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Reset only the session (keeping the engine) between pipeline stages.
    #[serde(default)]
    pub reuse_engine_between_stages: bool,
    /// Serve the built-in catalog when `models` is empty.
    #[serde(default = "default_true")]
    pub builtin_models: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            reuse_engine_between_stages: false,
            builtin_models: true,
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_images_dir")]
    pub dir: PathBuf,
    /// Stored images older than this are purged. 0 keeps them forever.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            dir: default_images_dir(),
            retention_secs: default_retention_secs(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl ImagesConfig {
    /// Retention window, or `None` when eviction is disabled.
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_secs > 0).then(|| Duration::from_secs(self.retention_secs))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub ollama: OllamaEngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaEngineConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
}

impl Default for OllamaEngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    12345
}
fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    900
}
fn default_images_dir() -> PathBuf {
    PathBuf::from("images")
}
fn default_retention_secs() -> u64 {
    24 * 60 * 60
}
fn default_purge_interval_secs() -> u64 {
    60 * 60
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (EDGEAI__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .set_default("inference.timeout_secs", default_timeout_secs() as i64)?
            .set_default("images.dir", "images")?
            .set_default("images.retention_secs", default_retention_secs() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("EDGEAI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Socket address the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}
