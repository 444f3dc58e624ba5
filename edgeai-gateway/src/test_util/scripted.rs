//! In-process engine binding with scripted behavior, for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edgeai_common::ModelDescriptor;
use image::DynamicImage;

use crate::engine::{
    Engine, EngineBinding, EngineError, EngineOptions, EngineResult, ResultListener, Session,
    SessionOptions, StreamEvent,
};

type Responder = Arc<dyn Fn(&str, usize) -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    EngineCreated,
    SessionCreated,
    SessionClosed,
    EngineClosed,
    Cancelled,
}

/// One `generate_async` call as seen by the engine.
#[derive(Debug, Clone)]
pub struct Generation {
    pub model: String,
    pub chunks: Vec<String>,
    /// Width and height of each attached image, in order.
    pub images: Vec<(u32, u32)>,
    pub options: SessionOptions,
}

impl Generation {
    pub fn prompt(&self) -> String {
        self.chunks.concat()
    }
}

#[derive(Clone)]
struct Script {
    init_error: Option<String>,
    session_error: Option<String>,
    close_error: Option<String>,
    generation_error: Option<String>,
    hang: bool,
    init_delay: Duration,
    close_delay: Duration,
    delta_delay: Duration,
    responder: Responder,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            init_error: None,
            session_error: None,
            close_error: None,
            generation_error: None,
            hang: false,
            init_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            delta_delay: Duration::ZERO,
            responder: Arc::new(|prompt, _| vec![format!("echo: {}", prompt)]),
        }
    }
}

#[derive(Default)]
struct Inner {
    script: Mutex<Script>,
    lifecycle: Mutex<Vec<LifecycleEvent>>,
    generations: Mutex<Vec<Generation>>,
    live_sessions: AtomicUsize,
    max_live_sessions: AtomicUsize,
    live_engines: AtomicUsize,
    max_live_engines: AtomicUsize,
}

impl Inner {
    fn script(&self) -> Script {
        self.script.lock().unwrap().clone()
    }

    fn record(&self, event: LifecycleEvent) {
        self.lifecycle.lock().unwrap().push(event);
    }
}

/// Engine binding whose engines answer from a script instead of a model.
///
/// By default every generation streams back `"echo: <prompt>"`.
#[derive(Clone, Default)]
pub struct ScriptedBinding {
    inner: Arc<Inner>,
}

impl ScriptedBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_init(&self, message: &str) {
        self.inner.script.lock().unwrap().init_error = Some(message.to_string());
    }

    pub fn fail_session(&self, message: &str) {
        self.inner.script.lock().unwrap().session_error = Some(message.to_string());
    }

    pub fn fail_close(&self, message: &str) {
        self.inner.script.lock().unwrap().close_error = Some(message.to_string());
    }

    pub fn fail_generation(&self, message: &str) {
        self.inner.script.lock().unwrap().generation_error = Some(message.to_string());
    }

    /// Stream the scripted deltas, then never finish until cancelled.
    pub fn hang_after_deltas(&self) {
        self.inner.script.lock().unwrap().hang = true;
    }

    /// Make `create_engine` take `delay`, like a model load.
    pub fn init_delay(&self, delay: Duration) {
        self.inner.script.lock().unwrap().init_delay = delay;
    }

    /// Make engine and session `close` block for `delay`.
    pub fn close_delay(&self, delay: Duration) {
        self.inner.script.lock().unwrap().close_delay = delay;
    }

    pub fn delta_delay(&self, delay: Duration) {
        self.inner.script.lock().unwrap().delta_delay = delay;
    }

    /// Produce the deltas for a generation from its prompt and image count.
    pub fn respond_with(&self, responder: impl Fn(&str, usize) -> Vec<String> + Send + Sync + 'static) {
        self.inner.script.lock().unwrap().responder = Arc::new(responder);
    }

    pub fn lifecycle(&self) -> Vec<LifecycleEvent> {
        self.inner.lifecycle.lock().unwrap().clone()
    }

    pub fn count(&self, event: LifecycleEvent) -> usize {
        self.lifecycle().into_iter().filter(|e| *e == event).count()
    }

    pub fn generations(&self) -> Vec<Generation> {
        self.inner.generations.lock().unwrap().clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.live_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of sessions that were ever open at once.
    pub fn max_live_sessions(&self) -> usize {
        self.inner.max_live_sessions.load(Ordering::SeqCst)
    }

    /// Engines created and not yet closed.
    pub fn live_engines(&self) -> usize {
        self.inner.live_engines.load(Ordering::SeqCst)
    }

    pub fn max_live_engines(&self) -> usize {
        self.inner.max_live_engines.load(Ordering::SeqCst)
    }
}

impl EngineBinding for ScriptedBinding {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn create_engine(
        &self,
        _descriptor: &ModelDescriptor,
        options: &EngineOptions,
    ) -> EngineResult<Arc<dyn Engine>> {
        let script = self.inner.script();
        std::thread::sleep(script.init_delay);
        if let Some(message) = script.init_error {
            return Err(EngineError::new(message));
        }
        self.inner.record(LifecycleEvent::EngineCreated);
        let live = self.inner.live_engines.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_live_engines.fetch_max(live, Ordering::SeqCst);
        Ok(Arc::new(ScriptedEngine {
            inner: self.inner.clone(),
            model: options.model.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct ScriptedEngine {
    inner: Arc<Inner>,
    model: String,
    closed: AtomicBool,
}

impl Engine for ScriptedEngine {
    fn create_session(&self, options: &SessionOptions) -> EngineResult<Box<dyn Session>> {
        if let Some(message) = self.inner.script().session_error {
            return Err(EngineError::new(message));
        }
        self.inner.record(LifecycleEvent::SessionCreated);
        let live = self.inner.live_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_live_sessions.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(ScriptedSession {
            inner: self.inner.clone(),
            model: self.model.clone(),
            options: *options,
            chunks: Vec::new(),
            images: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            closed: false,
        }))
    }

    fn close(&self) -> EngineResult<()> {
        let script = self.inner.script();
        std::thread::sleep(script.close_delay);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.live_engines.fetch_sub(1, Ordering::SeqCst);
            self.inner.record(LifecycleEvent::EngineClosed);
        }
        match script.close_error {
            Some(message) => Err(EngineError::new(message)),
            None => Ok(()),
        }
    }
}

struct ScriptedSession {
    inner: Arc<Inner>,
    model: String,
    options: SessionOptions,
    chunks: Vec<String>,
    images: Vec<(u32, u32)>,
    running: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    closed: bool,
}

impl Session for ScriptedSession {
    fn add_query_chunk(&mut self, text: &str) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::new("session is closed"));
        }
        self.chunks.push(text.to_string());
        Ok(())
    }

    fn add_image(&mut self, image: &DynamicImage) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::new("session is closed"));
        }
        self.images.push((image.width(), image.height()));
        Ok(())
    }

    fn generate_async(&mut self, mut listener: ResultListener) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::new("session is closed"));
        }
        let generation = Generation {
            model: self.model.clone(),
            chunks: std::mem::take(&mut self.chunks),
            images: std::mem::take(&mut self.images),
            options: self.options,
        };
        let script = self.inner.script();
        let deltas = (script.responder)(&generation.prompt(), generation.images.len());
        self.inner.generations.lock().unwrap().push(generation);

        self.cancelled = Arc::new(AtomicBool::new(false));
        self.running = Arc::new(AtomicBool::new(true));
        let cancelled = self.cancelled.clone();
        let running = self.running.clone();

        std::thread::spawn(move || {
            if let Some(message) = script.generation_error {
                running.store(false, Ordering::SeqCst);
                listener(StreamEvent::Failed(message));
                return;
            }
            for text in deltas {
                std::thread::sleep(script.delta_delay);
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                listener(StreamEvent::Delta { text, done: false });
            }
            if script.hang {
                while !cancelled.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(10));
                }
                return;
            }
            running.store(false, Ordering::SeqCst);
            listener(StreamEvent::Delta {
                text: String::new(),
                done: true,
            });
        });
        Ok(())
    }

    fn cancel(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.cancelled.store(true, Ordering::SeqCst);
            self.inner.record(LifecycleEvent::Cancelled);
        }
    }

    fn close(&mut self) -> EngineResult<()> {
        let script = self.inner.script();
        std::thread::sleep(script.close_delay);
        if !self.closed {
            self.closed = true;
            self.inner.live_sessions.fetch_sub(1, Ordering::SeqCst);
            self.inner.record(LifecycleEvent::SessionClosed);
        }
        match script.close_error {
            Some(message) => Err(EngineError::new(message)),
            None => Ok(()),
        }
    }
}
