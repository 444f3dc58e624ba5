//! Turns a streaming generation into one blocking answer.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use image::DynamicImage;
use tokio::sync::oneshot;

use crate::engine::StreamEvent;
use crate::error::{Error, Result};
use crate::session::SessionLease;

/// How a generation ended.
#[derive(Debug)]
enum Completion {
    Done,
    Failed(String),
}

/// Waits for a leased session to finish generating and returns the
/// accumulated text.
#[derive(Debug, Clone, Copy)]
pub struct InferenceBridge {
    timeout: Duration,
}

impl InferenceBridge {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submit `prompt` and `images` to the leased session and wait for the
    /// answer.
    ///
    /// A blank prompt is not submitted. If the wait times out the generation
    /// is cancelled and whatever text arrived so far is returned.
    pub async fn run(
        &self,
        lease: &mut SessionLease,
        prompt: &str,
        images: &[DynamicImage],
    ) -> Result<String> {
        let model = lease.model_name().to_string();
        let session = lease
            .session_mut()
            .ok_or_else(|| Error::Internal(format!("no live session for model {}", model)))?;

        if !prompt.trim().is_empty() {
            session
                .add_query_chunk(prompt)
                .map_err(|e| Error::Inference(e.message().to_string()))?;
        }
        for image in images {
            session
                .add_image(image)
                .map_err(|e| Error::Inference(e.message().to_string()))?;
        }

        let accumulated = Arc::new(Mutex::new(String::new()));
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let sink = accumulated.clone();

        session
            .generate_async(Box::new(move |event| {
                let completion = match event {
                    StreamEvent::Delta { text, done } => {
                        sink.lock().unwrap_or_else(PoisonError::into_inner).push_str(&text);
                        if !done {
                            return;
                        }
                        Completion::Done
                    }
                    StreamEvent::Failed(message) => Completion::Failed(message),
                };
                if let Some(tx) = tx.take() {
                    let _ = tx.send(completion);
                }
            }))
            .map_err(|e| Error::Inference(e.message().to_string()))?;

        let outcome = tokio::time::timeout(self.timeout, rx).await;
        let text = std::mem::take(&mut *accumulated.lock().unwrap_or_else(PoisonError::into_inner));

        match outcome {
            Ok(Ok(Completion::Done)) => Ok(text),
            Ok(Ok(Completion::Failed(message))) => {
                tracing::error!(model = %model, "Error during inference: {}", message);
                session.cancel();
                Err(Error::Inference(message))
            }
            Ok(Err(_)) => {
                tracing::warn!(model = %model, "Generation ended without a final result");
                Ok(text)
            }
            Err(_) => {
                tracing::warn!(
                    model = %model,
                    timeout_secs = self.timeout.as_secs(),
                    partial_len = text.len(),
                    "Inference timed out, returning partial result"
                );
                session.cancel();
                Ok(text)
            }
        }
    }
}
