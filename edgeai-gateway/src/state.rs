//! Shared application state.

use std::sync::Arc;

use crate::bridge::InferenceBridge;
use crate::config::Config;
use crate::engine::EngineBinding;
use crate::images::ImageStore;
use crate::pipeline::InferencePipeline;
use crate::registry::ModelRegistry;
use crate::session::SessionManager;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ModelRegistry>,
    pub sessions: Arc<SessionManager>,
    pub pipeline: InferencePipeline,
    pub images: ImageStore,
}

impl AppState {
    pub fn new(config: Config, binding: Arc<dyn EngineBinding>) -> Self {
        let registry = Arc::new(ModelRegistry::from_config(&config));
        let sessions = Arc::new(SessionManager::new(binding));
        let pipeline = InferencePipeline::new(
            registry.clone(),
            sessions.clone(),
            InferenceBridge::new(config.inference.timeout()),
            config.inference.reuse_engine_between_stages,
        );
        let images = ImageStore::new(config.images.dir.clone());

        Self {
            config,
            registry,
            sessions,
            pipeline,
            images,
        }
    }
}
