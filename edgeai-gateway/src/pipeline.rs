//! Inference orchestration: single-shot runs and the two-stage
//! image-to-attributes pipeline.

use std::sync::Arc;

use edgeai_common::GenerationOverrides;
use image::DynamicImage;

use crate::bridge::InferenceBridge;
use crate::error::Result;
use crate::registry::{ModelRegistry, ResolvedModel};
use crate::session::{SessionLease, SessionManager};

/// Stage 1 prompt used when an image request carries none.
pub const DEFAULT_IMAGE_PROMPT: &str = "Describe the person in this image in detail: \
     their appearance, hair, face, clothing, accessories and anything distinctive.";

/// Base prompt for requests that reference an image by URL.
pub const DEFAULT_IMAGE_URL_PROMPT: &str = "Describe this image.";

/// Fields requested from the structured extraction stage.
pub const ATTRIBUTE_FIELDS: [&str; 14] = [
    "gender",
    "face_shape",
    "hair_color",
    "hair_length",
    "hair_style",
    "eye_color",
    "skin_tone",
    "height",
    "build",
    "top_clothing",
    "bottom_clothing",
    "accessories",
    "distinctive_features",
    "age_range",
];

/// Build the structured extraction instruction around a freeform description.
pub fn extraction_prompt(description: &str) -> String {
    format!(
        "Extract the attributes of the person from the following description.\n\n\
         Description:\n{description}\n\n\
         Respond with a single JSON object that may contain only these keys: {fields}.\n\
         Omit any key whose value is uncertain, \"not discernible\", unknown or null. \
         Do not add any text outside the JSON object.",
        description = description,
        fields = ATTRIBUTE_FIELDS.join(", "),
    )
}

/// Outcome of [`InferencePipeline::extract_attributes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeExtraction {
    /// Stage 1 freeform description.
    pub description: String,
    /// The exact prompt submitted in stage 2.
    pub extraction_prompt: String,
    /// Stage 2 output, returned to callers.
    pub attributes: String,
}

/// Runs requests through model resolution, the session lifecycle and the bridge.
pub struct InferencePipeline {
    registry: Arc<ModelRegistry>,
    sessions: Arc<SessionManager>,
    bridge: InferenceBridge,
    reuse_engine_between_stages: bool,
}

impl InferencePipeline {
    pub fn new(
        registry: Arc<ModelRegistry>,
        sessions: Arc<SessionManager>,
        bridge: InferenceBridge,
        reuse_engine_between_stages: bool,
    ) -> Self {
        Self {
            registry,
            sessions,
            bridge,
            reuse_engine_between_stages,
        }
    }

    /// One inference call: clean up, initialize, generate, clean up.
    pub async fn run(
        &self,
        model: Option<&str>,
        overrides: &GenerationOverrides,
        prompt: &str,
        images: &[DynamicImage],
    ) -> Result<String> {
        let resolved = self.registry.resolve(model, overrides)?;
        let mut lease = self.sessions.lease(&resolved.descriptor.name).await;

        self.prepare(&mut lease, &resolved, false).await?;
        let text = self.bridge.run(&mut lease, prompt, images).await;
        lease.clean_up().await;
        text
    }

    /// Describe `image` freeform, then extract structured attributes from
    /// that description.
    ///
    /// Both stages run under one lease, so no other request for the model can
    /// slip in between them. A failing stage 1 ends the pipeline.
    pub async fn extract_attributes(
        &self,
        model: Option<&str>,
        overrides: &GenerationOverrides,
        prompt: &str,
        image: &DynamicImage,
    ) -> Result<AttributeExtraction> {
        let resolved = self.registry.resolve(model, overrides)?;
        let mut lease = self.sessions.lease(&resolved.descriptor.name).await;

        tracing::info!(model = %resolved.descriptor.name, "Attribute extraction stage 1");
        self.prepare(&mut lease, &resolved, false).await?;
        let description = match self
            .bridge
            .run(&mut lease, prompt, std::slice::from_ref(image))
            .await
        {
            Ok(description) => description,
            Err(e) => {
                lease.clean_up().await;
                return Err(e);
            }
        };

        tracing::info!(
            model = %resolved.descriptor.name,
            description_len = description.len(),
            "Attribute extraction stage 2"
        );
        let extraction_prompt = extraction_prompt(&description);
        self.prepare(&mut lease, &resolved, self.reuse_engine_between_stages)
            .await?;
        let attributes = self.bridge.run(&mut lease, &extraction_prompt, &[]).await;
        lease.clean_up().await;

        Ok(AttributeExtraction {
            description,
            extraction_prompt,
            attributes: attributes?,
        })
    }

    /// Give the lease a fresh session for the next call.
    ///
    /// With `reuse_engine` and a live engine only the session is recreated;
    /// otherwise everything is torn down and rebuilt.
    async fn prepare(
        &self,
        lease: &mut SessionLease,
        resolved: &ResolvedModel,
        reuse_engine: bool,
    ) -> Result<()> {
        if reuse_engine && lease.is_ready() {
            return lease.reset().await;
        }
        lease
            .initialize(&resolved.descriptor, &resolved.config)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::test_util::{LifecycleEvent, ScriptedBinding};
    use edgeai_common::ModelDescriptor;
    use image::RgbImage;
    use std::time::Duration;

    fn pipeline(binding: &ScriptedBinding, reuse: bool) -> (InferencePipeline, Arc<SessionManager>) {
        let mut model = ModelDescriptor::new("vision");
        model.supports_image = true;
        let registry = Arc::new(ModelRegistry::new(vec![model]));
        let sessions = Arc::new(SessionManager::new(Arc::new(binding.clone())));
        let pipeline = InferencePipeline::new(
            registry,
            sessions.clone(),
            InferenceBridge::new(Duration::from_secs(5)),
            reuse,
        );
        (pipeline, sessions)
    }

    fn image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(4, 4))
    }

    fn staged_responder(binding: &ScriptedBinding) {
        binding.respond_with(|_, images| {
            if images > 0 {
                vec!["A tall man ".into(), "with short black hair.".into()]
            } else {
                vec!["{\"gender\": \"male\", \"hair_color\": \"black\"}".into()]
            }
        });
    }

    #[test]
    fn test_extraction_prompt_lists_fields() {
        let prompt = extraction_prompt("A woman in a red coat.");
        assert!(prompt.contains("A woman in a red coat."));
        for field in ATTRIBUTE_FIELDS {
            assert!(prompt.contains(field), "missing {}", field);
        }
        assert!(prompt.contains("not discernible"));
    }

    #[tokio::test]
    async fn test_run_cleans_up_after_itself() {
        let binding = ScriptedBinding::new();
        let (pipeline, sessions) = pipeline(&binding, false);

        let text = pipeline
            .run(None, &GenerationOverrides::default(), "hello", &[])
            .await
            .unwrap();
        assert_eq!(text, "echo: hello");
        assert!(sessions.live_models().is_empty());
        assert_eq!(binding.live_sessions(), 0);
        assert_eq!(binding.count(LifecycleEvent::EngineClosed), 1);
    }

    #[tokio::test]
    async fn test_overrides_reach_session() {
        let binding = ScriptedBinding::new();
        let (pipeline, _) = pipeline(&binding, false);
        let overrides = GenerationOverrides {
            temperature: Some(0.7),
            top_k: Some(5),
            ..Default::default()
        };

        pipeline.run(None, &overrides, "hi", &[]).await.unwrap();
        let options = binding.generations()[0].options;
        assert_eq!(options.temperature, 0.7);
        assert_eq!(options.top_k, 5);
        assert!(options.enable_vision);
    }

    #[tokio::test]
    async fn test_unknown_model_is_unavailable() {
        let binding = ScriptedBinding::new();
        let (pipeline, _) = pipeline(&binding, false);

        let err = pipeline
            .run(Some("missing"), &GenerationOverrides::default(), "hi", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelUnavailable));
        assert!(binding.lifecycle().is_empty());
    }

    #[tokio::test]
    async fn test_stage_two_embeds_stage_one() {
        let binding = ScriptedBinding::new();
        staged_responder(&binding);
        let (pipeline, sessions) = pipeline(&binding, false);

        let result = pipeline
            .extract_attributes(None, &GenerationOverrides::default(), "Describe", &image())
            .await
            .unwrap();

        assert_eq!(result.description, "A tall man with short black hair.");
        assert!(result.attributes.contains("\"gender\""));

        let generations = binding.generations();
        assert_eq!(generations.len(), 2);
        assert_eq!(generations[0].images, vec![(4, 4)]);
        assert!(generations[1].images.is_empty());
        assert!(generations[1].prompt().contains(&result.description));
        assert_eq!(generations[1].prompt(), result.extraction_prompt);

        // Full teardown between stages.
        assert_eq!(binding.count(LifecycleEvent::EngineCreated), 2);
        assert_eq!(binding.count(LifecycleEvent::EngineClosed), 2);
        assert!(sessions.live_models().is_empty());
    }

    #[tokio::test]
    async fn test_relaxed_mode_keeps_engine() {
        let binding = ScriptedBinding::new();
        staged_responder(&binding);
        let (pipeline, _) = pipeline(&binding, true);

        pipeline
            .extract_attributes(None, &GenerationOverrides::default(), "Describe", &image())
            .await
            .unwrap();

        assert_eq!(binding.count(LifecycleEvent::EngineCreated), 1);
        assert_eq!(binding.count(LifecycleEvent::SessionCreated), 2);
        assert_eq!(binding.count(LifecycleEvent::EngineClosed), 1);
    }

    #[tokio::test]
    async fn test_stage_one_failure_stops_pipeline() {
        let binding = ScriptedBinding::new();
        binding.fail_generation("vision encoder crashed");
        let (pipeline, sessions) = pipeline(&binding, false);

        let err = pipeline
            .extract_attributes(None, &GenerationOverrides::default(), "Describe", &image())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
        assert_eq!(binding.generations().len(), 1);
        assert!(sessions.live_models().is_empty());
        assert_eq!(binding.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_init_failure_is_reported() {
        let binding = ScriptedBinding::new();
        binding.fail_init("model file missing");
        let (pipeline, _) = pipeline(&binding, false);

        let err = pipeline
            .run(None, &GenerationOverrides::default(), "hi", &[])
            .await
            .unwrap_err();
        assert_eq!(err.soft_text().unwrap(), "model file missing");
        assert!(binding.generations().is_empty());
    }
}
