//! JSON-lines bridge backend.
//!
//! Glues [`ProcessHost`] and [`EventTranslator`] into a [`PushBackend`]:
//! the child process receives conversation messages as JSON lines on
//! stdin and emits [`BridgeEvent`] envelopes as JSON lines on stdout. A
//! pump task parses and translates each line, forwarding the resulting
//! backend events to the push loop. When the process dies, the event
//! stream closes and the push loop's auto-restart path reconnects.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::push::{BackendEvent, BackendSession, ProcessHost, PushBackend};
use super::translate::{BridgeEvent, EventTranslator, TranslatorConfig};
use crate::error::{AgentError, Result};
use crate::message::Message;

/// Called with the backend's external thread id when it first appears.
pub type ThreadHook = Arc<dyn Fn(&str) + Send + Sync>;

/// A [`PushBackend`] speaking newline-delimited JSON over a child
/// process.
pub struct BridgeBackend {
    program: String,
    args: Vec<String>,
    translator_config: TranslatorConfig,
    exit_sentinel: Option<String>,
    thread_hook: Mutex<Option<ThreadHook>>,
}

impl BridgeBackend {
    /// Describes the bridge process to spawn per session.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            translator_config: TranslatorConfig::default(),
            exit_sentinel: None,
            thread_hook: Mutex::new(None),
        }
    }

    /// Overrides the translator configuration.
    #[must_use]
    pub const fn with_translator_config(mut self, config: TranslatorConfig) -> Self {
        self.translator_config = config;
        self
    }

    /// Sets the line written to stdin ahead of shutdown (e.g. `/exit`).
    #[must_use]
    pub fn with_exit_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.exit_sentinel = Some(sentinel.into());
        self
    }

    /// Registers a hook observing the backend's external thread id
    /// (typically recording it as a session mapping).
    pub fn set_thread_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.thread_hook.lock() {
            *slot = Some(Arc::new(hook));
        }
    }
}

impl std::fmt::Debug for BridgeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeBackend")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PushBackend for BridgeBackend {
    async fn connect(&self) -> Result<Arc<dyn BackendSession>> {
        let mut host = ProcessHost::new(self.program.clone(), self.args.clone());
        if let Some(sentinel) = &self.exit_sentinel {
            host = host.with_exit_sentinel(sentinel.clone());
        }
        host.start().await?;
        let lines = host
            .lines()
            .ok_or_else(|| AgentError::backend("bridge stdout unavailable"))?;

        let hook = self.thread_hook.lock().ok().and_then(|slot| slot.clone());
        let (events_tx, events_rx) = mpsc::channel(256);
        let pump = tokio::spawn(pump_events(
            lines,
            events_tx,
            EventTranslator::with_config(self.translator_config),
            hook,
        ));

        Ok(Arc::new(BridgeSession {
            host: tokio::sync::Mutex::new(host),
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
            pump,
        }))
    }
}

/// Parses stdout lines, translates them, and forwards backend events.
async fn pump_events(
    mut lines: mpsc::Receiver<String>,
    events_tx: mpsc::Sender<BackendEvent>,
    mut translator: EventTranslator,
    hook: Option<ThreadHook>,
) {
    let mut thread_reported = false;
    while let Some(line) = lines.recv().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: BridgeEvent = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "skipping unparseable bridge line");
                continue;
            }
        };

        let translation = translator.translate(event);
        if !thread_reported
            && let Some(thread_id) = translator.external_thread_id()
        {
            thread_reported = true;
            if let Some(hook) = &hook {
                hook(thread_id);
            }
        }

        for backend_event in translation.into_backend_events() {
            if events_tx.send(backend_event).await.is_err() {
                return;
            }
        }
    }
    debug!("bridge stdout closed");
    // Dropping the sender closes the event stream; the push loop treats
    // that as a fatal backend condition and reconnects on the next run.
}

struct BridgeSession {
    host: tokio::sync::Mutex<ProcessHost>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<BackendEvent>>>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl BackendSession for BridgeSession {
    async fn subscribe(&self) -> Result<mpsc::Receiver<BackendEvent>> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::backend("bridge session already subscribed"))
    }

    async fn send_input(&self, messages: Vec<Message>) -> Result<()> {
        let mut host = self.host.lock().await;
        for message in messages {
            let line = serde_json::to_string(&message)?;
            host.write_line(&line).await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.host.lock().await.stop().await?;
        self.pump.abort();
        Ok(())
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
