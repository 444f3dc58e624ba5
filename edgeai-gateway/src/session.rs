//! Session lifecycle management.
//!
//! Every model name owns one slot that holds at most one live engine +
//! session pair. Access to a slot goes through a [`SessionLease`], which
//! holds the slot's lock for as long as it lives. One lease therefore spans
//! clean-up, initialize, generation and the final clean-up of a request,
//! and two requests for the same model can never touch each other's session.
//!
//! Slot states: `Absent` (no instance) -> `Initializing` (inside
//! [`SessionLease::initialize`]) -> `Ready` (instance present) -> `Absent`
//! again after [`SessionLease::clean_up`].
//!
//! Engine calls block, so every create and close runs on the blocking pool
//! with the slot's lock moved along. A request dropped mid-load keeps the
//! model locked until the load finishes, and whatever was built is closed
//! on that same thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use edgeai_common::{GenerationConfig, ModelDescriptor};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::engine::{
    clean_up_engine_error_message, CleanUpListener, Engine, EngineBinding, EngineOptions,
    EngineResult, Session, SessionOptions,
};
use crate::error::{Error, Result};

/// A live engine and session for one model.
struct ModelInstance {
    engine: Arc<dyn Engine>,
    session: Box<dyn Session>,
    session_options: SessionOptions,
    on_clean_up: Option<CleanUpListener>,
}

type Slot = Arc<AsyncMutex<Option<ModelInstance>>>;

/// Owns the per-model session slots.
pub struct SessionManager {
    binding: Arc<dyn EngineBinding>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionManager {
    pub fn new(binding: Arc<dyn EngineBinding>) -> Self {
        Self {
            binding,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `model_name`'s slot.
    pub async fn lease(&self, model_name: &str) -> SessionLease {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(model_name.to_string()).or_default().clone()
        };

        let instance = match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(model = model_name, "Waiting for model session to be released");
                slot.lock_owned().await
            }
        };

        SessionLease {
            model_name: model_name.to_string(),
            binding: self.binding.clone(),
            slot: Some(SlotGuard {
                model_name: model_name.to_string(),
                instance,
            }),
        }
    }

    /// Names of models that hold a live session or are leased right now.
    pub fn live_models(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| match slot.try_lock() {
                Ok(instance) => instance.is_some(),
                Err(_) => true,
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// The locked contents of one slot. Closes a live instance when dropped.
struct SlotGuard {
    model_name: String,
    instance: OwnedMutexGuard<Option<ModelInstance>>,
}

impl SlotGuard {
    fn create(
        &mut self,
        binding: &dyn EngineBinding,
        descriptor: &ModelDescriptor,
        engine_options: &EngineOptions,
        session_options: SessionOptions,
    ) -> EngineResult<()> {
        let engine = binding.create_engine(descriptor, engine_options)?;
        match engine.create_session(&session_options) {
            Ok(session) => {
                *self.instance = Some(ModelInstance {
                    engine,
                    session,
                    session_options,
                    on_clean_up: None,
                });
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = engine.close() {
                    tracing::error!(
                        model = %self.model_name,
                        "Failed to close the inference engine: {}",
                        close_err
                    );
                }
                Err(e)
            }
        }
    }

    fn reset_session(&mut self) -> EngineResult<()> {
        let Some(instance) = self.instance.as_mut() else {
            return Ok(());
        };

        instance.session.cancel();
        if let Err(e) = instance.session.close() {
            tracing::error!(
                model = %self.model_name,
                "Failed to close the inference session: {}",
                e
            );
        }
        match instance.engine.create_session(&instance.session_options) {
            Ok(session) => {
                instance.session = session;
                Ok(())
            }
            Err(e) => {
                self.close_instance();
                Err(e)
            }
        }
    }

    /// Close the session, then the engine.
    ///
    /// Close failures are logged and swallowed so that one failing resource
    /// never prevents releasing the other.
    fn close_instance(&mut self) {
        let Some(mut instance) = self.instance.take() else {
            return;
        };

        instance.session.cancel();
        if let Err(e) = instance.session.close() {
            tracing::error!(
                model = %self.model_name,
                "Failed to close the inference session: {}",
                e
            );
        }
        if let Err(e) = instance.engine.close() {
            tracing::error!(
                model = %self.model_name,
                "Failed to close the inference engine: {}",
                e
            );
        }
        if let Some(listener) = instance.on_clean_up.take() {
            listener();
        }
        tracing::debug!(model = %self.model_name, "Clean up done");
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.instance.is_some() {
            tracing::debug!(model = %self.model_name, "Releasing abandoned session");
            self.close_instance();
        }
    }
}

/// Exclusive handle on one model's session slot.
///
/// Dropping a lease that still holds a live session cleans it up on the
/// blocking pool, so an abandoned request cannot leak native resources.
pub struct SessionLease {
    model_name: String,
    binding: Arc<dyn EngineBinding>,
    /// `None` only while a blocking call owns the slot.
    slot: Option<SlotGuard>,
}

impl SessionLease {
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Whether an engine and session are live.
    pub fn is_ready(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| slot.instance.is_some())
    }

    /// Load the model and open a session with `config`.
    ///
    /// A session still live from an earlier call is cleaned up first. On
    /// failure the slot is left empty and the cleaned engine message is
    /// returned as [`Error::Init`].
    pub async fn initialize(
        &mut self,
        descriptor: &ModelDescriptor,
        config: &GenerationConfig,
    ) -> Result<()> {
        tracing::info!(
            model = %descriptor.name,
            binding = self.binding.name(),
            accelerator = %config.accelerator,
            max_tokens = config.max_tokens,
            "Initializing model"
        );

        let binding = self.binding.clone();
        let engine_options = EngineOptions::new(descriptor, config);
        let session_options = SessionOptions::new(descriptor, config);
        let descriptor = descriptor.clone();

        let created = self
            .blocking(move |slot| {
                slot.close_instance();
                slot.create(binding.as_ref(), &descriptor, &engine_options, session_options)
            })
            .await?;

        match created {
            Ok(()) => {
                tracing::debug!(model = %self.model_name, "Initialization completed");
                Ok(())
            }
            Err(e) => {
                let message = clean_up_engine_error_message(e.message());
                tracing::error!(model = %self.model_name, "Failed to initialize model: {}", message);
                Err(Error::Init(message))
            }
        }
    }

    /// Replace the session with a fresh one on the same engine.
    ///
    /// Clears conversational context without reloading weights. A no-op when
    /// nothing is live. If the new session cannot be created the engine is
    /// torn down too and the slot ends up empty.
    pub async fn reset(&mut self) -> Result<()> {
        if !self.is_ready() {
            return Ok(());
        }

        tracing::debug!(model = %self.model_name, "Resetting session");
        match self.blocking(SlotGuard::reset_session).await? {
            Ok(()) => {
                tracing::debug!(model = %self.model_name, "Resetting done");
                Ok(())
            }
            Err(e) => {
                let message = clean_up_engine_error_message(e.message());
                tracing::error!(model = %self.model_name, "Failed to reset session: {}", message);
                Err(Error::Init(message))
            }
        }
    }

    /// Register a notification run when the live session is cleaned up.
    ///
    /// Only the first registration per session is kept. Returns whether the
    /// listener was registered.
    pub fn on_clean_up(&mut self, listener: impl FnOnce() + Send + 'static) -> bool {
        match self.slot.as_mut().and_then(|slot| slot.instance.as_mut()) {
            Some(instance) if instance.on_clean_up.is_none() => {
                instance.on_clean_up = Some(Box::new(listener));
                true
            }
            _ => false,
        }
    }

    /// Close the session, then the engine. Idempotent.
    pub async fn clean_up(&mut self) {
        if !self.is_ready() {
            return;
        }
        if let Err(e) = self.blocking(SlotGuard::close_instance).await {
            tracing::error!(model = %self.model_name, "Failed to clean up model: {}", e);
        }
    }

    /// The live session, if any.
    pub(crate) fn session_mut(&mut self) -> Option<&mut (dyn Session + 'static)> {
        self.slot
            .as_mut()
            .and_then(|slot| slot.instance.as_mut())
            .map(|instance| instance.session.as_mut())
    }

    /// Run `f` on the blocking pool with the slot moved along.
    ///
    /// If this future is dropped before `f` returns, the slot stays locked
    /// until it does and is then dropped on the blocking thread.
    async fn blocking<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SlotGuard) -> T + Send + 'static,
    {
        let mut slot = self
            .slot
            .take()
            .ok_or_else(|| Error::Internal("model session slot lost".to_string()))?;
        let (slot, out) = tokio::task::spawn_blocking(move || {
            let out = f(&mut slot);
            (slot, out)
        })
        .await?;
        self.slot = Some(slot);
        Ok(out)
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if slot.instance.is_none() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || drop(slot));
            }
            Err(_) => drop(slot),
        }
    }
}
