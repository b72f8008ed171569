//! The run scheduler: fire-and-forget inputs in, fanned-out streams out.
//!
//! [`MultiTurnAgent`] owns a bounded input queue, a set of per-subscriber
//! channels, the conversation history, and the lifecycle of one
//! background run loop. Clients call [`MultiTurnAgent::send`] (which
//! returns a receipt immediately), [`MultiTurnAgent::subscribe`] (which
//! yields every future message), or [`MultiTurnAgent::execute_run`]
//! (which correlates a send with its run and yields that run's
//! messages).
//!
//! The loop itself is a [`RunLoop`] implementation; see
//! [`poll`](crate::agent::poll), [`push`](crate::agent::push), and
//! [`translate`](crate::agent::translate) for the shipped variants. The
//! scheduler guarantees each drained input is assigned to exactly one
//! run, that a `RunAssignment` precedes and exactly one `RunCompleted`
//! follows every run's messages on each subscriber, and that no loop
//! failure ever escapes the background task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::message::{Message, RunAssignmentMessage, RunCompletedMessage};
use crate::run::{QueuedInput, RunAssignment, SendReceipt, UserInput, new_id};
use crate::store::{ConversationStore, PersistedMessage, ThreadMetadata};

pub mod bridge;
pub mod poll;
pub mod push;
pub mod translate;

const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1000;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Conversation thread this scheduler drives.
    pub thread_id: String,

    /// Input queue capacity; senders wait when full.
    pub queue_capacity: usize,

    /// Per-subscriber channel capacity; the loop waits when full.
    pub subscriber_capacity: usize,
}

impl AgentConfig {
    /// Creates a config with default capacities.
    #[must_use]
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }

    /// Overrides the input queue capacity.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Overrides the per-subscriber channel capacity.
    #[must_use]
    pub const fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }
}

#[derive(Debug, Default)]
struct RunState {
    current_run_id: Option<String>,
    latest_run_id: Option<String>,
}

type SubscriberMap = Mutex<HashMap<String, mpsc::Sender<Message>>>;

/// Parameters for completing a run.
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    /// The run being completed.
    pub run_id: String,

    /// The generation the completion belongs to.
    pub generation_id: String,

    /// Whether the run forked a continuation.
    pub was_forked: bool,

    /// The continuation run, when forked.
    pub forked_to_run_id: Option<String>,

    /// Inputs still queued at completion time.
    pub pending_message_count: u32,

    /// Whether the run failed.
    pub is_error: bool,

    /// Human-readable cause when `is_error` is set.
    pub error_message: Option<String>,
}

impl RunCompletion {
    /// A successful completion for the given assignment ids.
    #[must_use]
    pub fn success(run_id: impl Into<String>, generation_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            generation_id: generation_id.into(),
            ..Self::default()
        }
    }

    /// A failed completion.
    #[must_use]
    pub fn failure(
        run_id: impl Into<String>,
        generation_id: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            generation_id: generation_id.into(),
            is_error: true,
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }

    /// Sets the pending-input count observed at completion.
    #[must_use]
    pub const fn with_pending(mut self, pending_message_count: u32) -> Self {
        self.pending_message_count = pending_message_count;
        self
    }
}

/// Shared scheduler state: queue endpoints, subscribers, history, run
/// identity, and the optional store.
pub struct AgentCore {
    config: AgentConfig,
    input_tx: Mutex<Option<mpsc::Sender<QueuedInput>>>,
    input_rx: tokio::sync::Mutex<Option<mpsc::Receiver<QueuedInput>>>,
    subscribers: Arc<SubscriberMap>,
    history: tokio::sync::Mutex<Vec<Message>>,
    run_state: Mutex<RunState>,
    session_mappings: Mutex<crate::message::Metadata>,
    store: Option<Arc<dyn ConversationStore>>,
    disposed: AtomicBool,
}

impl AgentCore {
    fn new(config: AgentConfig, store: Option<Arc<dyn ConversationStore>>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Self {
            config,
            input_tx: Mutex::new(Some(tx)),
            input_rx: tokio::sync::Mutex::new(Some(rx)),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            history: tokio::sync::Mutex::new(Vec::new()),
            run_state: Mutex::new(RunState::default()),
            session_mappings: Mutex::new(crate::message::Metadata::new()),
            store,
            disposed: AtomicBool::new(false),
        }
    }

    /// Records a backend session mapping (e.g. an external thread id),
    /// committed into the thread metadata at the next run completion.
    pub fn record_session_mapping(
        &self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) {
        if let Ok(mut mappings) = self.session_mappings.lock() {
            mappings.insert(key.into(), value.into());
        }
    }

    /// The thread this scheduler drives.
    #[must_use]
    pub fn thread_id(&self) -> &str {
        &self.config.thread_id
    }

    /// The most recently completed run, if any.
    #[must_use]
    pub fn latest_run_id(&self) -> Option<String> {
        self.run_state
            .lock()
            .ok()
            .and_then(|state| state.latest_run_id.clone())
    }

    /// The run currently in progress, if any.
    #[must_use]
    pub fn current_run_id(&self) -> Option<String> {
        self.run_state
            .lock()
            .ok()
            .and_then(|state| state.current_run_id.clone())
    }

    /// Enqueues an input, returning its receipt immediately.
    ///
    /// Suspends only when the queue is full. Fails with
    /// [`AgentError::Disposed`] after disposal.
    pub async fn send(&self, input: UserInput) -> Result<SendReceipt> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(AgentError::Disposed);
        }
        let sender = self
            .input_tx
            .lock()
            .map_err(|_| AgentError::QueueClosed)?
            .clone()
            .ok_or(AgentError::QueueClosed)?;

        let queued = QueuedInput::enqueue(input);
        let receipt = queued.receipt();
        sender
            .send(queued)
            .await
            .map_err(|_| AgentError::QueueClosed)?;
        debug!(receipt_id = %receipt.receipt_id, "input queued");
        Ok(receipt)
    }

    /// Registers a subscriber channel.
    ///
    /// Only messages published after this call are delivered
    /// (subscribe-before-send). The subscription unregisters itself on
    /// drop. A subscriber that stops reading eventually stalls the run
    /// loop: channels are bounded and publishes wait on full.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity);
        let id = new_id();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id.clone(), tx);
        }
        debug!(subscriber_id = %id, "subscriber attached");
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Fans a message out to every subscriber, awaiting each bounded
    /// channel. Subscribers that dropped their end are pruned.
    pub async fn publish_to_all(&self, message: &Message) {
        let targets: Vec<(String, mpsc::Sender<Message>)> = match self.subscribers.lock() {
            Ok(map) => map
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect(),
            Err(_) => return,
        };

        let mut stale = Vec::new();
        for (id, tx) in targets {
            if tx.send(message.clone()).await.is_err() {
                stale.push(id);
            }
        }
        if !stale.is_empty()
            && let Ok(mut map) = self.subscribers.lock()
        {
            for id in stale {
                map.remove(&id);
            }
        }
    }

    /// Allocates a fresh run for a drained batch.
    ///
    /// Publishes nothing itself; the caller is expected to publish the
    /// matching [`RunAssignmentMessage`] before any run output.
    #[must_use]
    pub fn start_run(&self, batch: &[QueuedInput], was_injected: bool) -> RunAssignment {
        let run_id = new_id();
        let generation_id = new_id();
        let explicit_parent = batch
            .iter()
            .find_map(|queued| queued.input.parent_run_id.clone());

        let parent_run_id = {
            let mut state = self.run_state.lock().unwrap_or_else(|e| e.into_inner());
            let parent = explicit_parent.or_else(|| state.latest_run_id.clone());
            state.current_run_id = Some(run_id.clone());
            parent
        };

        info!(run_id = %run_id, inputs = batch.len(), was_injected, "run started");
        RunAssignment {
            run_id,
            generation_id,
            input_ids: batch
                .iter()
                .map(|queued| queued.receipt_id.clone())
                .collect(),
            parent_run_id,
            was_injected,
        }
    }

    /// Builds the control message announcing an assignment.
    #[must_use]
    pub fn assignment_message(&self, assignment: &RunAssignment) -> Message {
        Message::RunAssignment(RunAssignmentMessage {
            assignment: assignment.clone(),
            common: crate::message::MessageCommon {
                thread_id: Some(self.config.thread_id.clone()),
                run_id: Some(assignment.run_id.clone()),
                generation_id: Some(assignment.generation_id.clone()),
                parent_run_id: assignment.parent_run_id.clone(),
                ..crate::message::MessageCommon::default()
            },
        })
    }

    /// Stamps run identity onto a message, filling only absent fields.
    #[must_use]
    pub fn stamp(&self, mut message: Message, assignment: &RunAssignment) -> Message {
        let common = message.common_mut();
        if common.run_id.is_none() {
            common.run_id = Some(assignment.run_id.clone());
        }
        if common.generation_id.is_none() {
            common.generation_id = Some(assignment.generation_id.clone());
        }
        if common.thread_id.is_none() {
            common.thread_id = Some(self.config.thread_id.clone());
        }
        if common.parent_run_id.is_none() {
            common.parent_run_id.clone_from(&assignment.parent_run_id);
        }
        message
    }

    /// Appends to history and fires a best-effort persistence write.
    ///
    /// Store failures are logged and never propagate.
    pub async fn add_to_history(&self, message: Message) {
        self.history.lock().await.push(message.clone());

        if let Some(store) = &self.store
            && self.current_run_id().is_some()
            && let Err(error) = store
                .append_messages(
                    &self.config.thread_id,
                    vec![PersistedMessage::new(message)],
                )
                .await
        {
            warn!(thread_id = %self.config.thread_id, %error, "history persistence failed");
        }
    }

    /// A snapshot of the conversation history.
    pub async fn history_snapshot(&self) -> Vec<Message> {
        self.history.lock().await.clone()
    }

    /// Publishes the run's terminal control message and commits metadata.
    ///
    /// Updates `latest_run_id`, clears `current_run_id`, and, when a
    /// store is configured, rewrites the thread metadata preserving any
    /// prior properties and session mappings.
    pub async fn complete_run(&self, completion: RunCompletion) {
        {
            let mut state = self.run_state.lock().unwrap_or_else(|e| e.into_inner());
            state.latest_run_id = Some(completion.run_id.clone());
            state.current_run_id = None;
        }

        let message = Message::RunCompleted(RunCompletedMessage {
            completed_run_id: completion.run_id.clone(),
            was_forked: completion.was_forked,
            forked_to_run_id: completion.forked_to_run_id.clone(),
            has_pending_messages: completion.pending_message_count > 0,
            pending_message_count: completion.pending_message_count,
            is_error: completion.is_error,
            error_message: completion.error_message.clone(),
            common: crate::message::MessageCommon {
                thread_id: Some(self.config.thread_id.clone()),
                run_id: Some(completion.run_id.clone()),
                generation_id: Some(completion.generation_id.clone()),
                ..crate::message::MessageCommon::default()
            },
        });
        self.publish_to_all(&message).await;

        if completion.is_error {
            warn!(run_id = %completion.run_id, error = completion.error_message.as_deref(), "run completed with error");
        } else {
            info!(run_id = %completion.run_id, "run completed");
        }

        if let Some(store) = &self.store {
            let mut metadata = match store.load_metadata(&self.config.thread_id).await {
                Ok(Some(existing)) => existing,
                Ok(None) => ThreadMetadata::new(&self.config.thread_id),
                Err(error) => {
                    warn!(%error, "metadata load failed; writing fresh metadata");
                    ThreadMetadata::new(&self.config.thread_id)
                }
            };
            metadata.latest_run_id = Some(completion.run_id);
            metadata.current_run_id = None;
            metadata.last_updated = Utc::now();

            let recorded = self
                .session_mappings
                .lock()
                .map(|mappings| mappings.clone())
                .unwrap_or_default();
            if !recorded.is_empty() {
                let mappings = metadata
                    .session_mappings
                    .get_or_insert_with(crate::message::Metadata::new);
                for (key, value) in recorded {
                    mappings.insert(key, value);
                }
            }

            if let Err(error) = store.save_metadata(&self.config.thread_id, metadata).await {
                warn!(%error, "metadata save failed");
            }
        }
    }

    /// Rebuilds in-memory state from the store.
    ///
    /// Returns `false` when no messages are stored (metadata alone does
    /// not count). Messages without metadata restore history and leave
    /// minimal synthesized run state.
    pub async fn recover(&self) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };

        let metadata = store.load_metadata(&self.config.thread_id).await?;
        let messages = store.load_messages(&self.config.thread_id).await?;
        if messages.is_empty() {
            return Ok(false);
        }

        {
            let mut history = self.history.lock().await;
            history.clear();
            history.extend(messages.into_iter().map(|stored| stored.message));
        }
        if let Some(metadata) = metadata {
            {
                let mut state = self.run_state.lock().unwrap_or_else(|e| e.into_inner());
                state.latest_run_id = metadata.latest_run_id;
                state.current_run_id = None;
            }
            if let Some(mappings) = metadata.session_mappings
                && let Ok(mut recorded) = self.session_mappings.lock()
            {
                *recorded = mappings;
            }
        }
        info!(thread_id = %self.config.thread_id, "conversation recovered");
        Ok(true)
    }

    fn mark_disposed(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Ok(mut tx) = self.input_tx.lock() {
            tx.take();
        }
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }
}

impl std::fmt::Debug for AgentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCore")
            .field("thread_id", &self.config.thread_id)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// A per-subscriber message stream.
///
/// Dropping the subscription unregisters it from the scheduler.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    rx: mpsc::Receiver<Message>,
    registry: std::sync::Weak<SubscriberMap>,
}

impl Subscription {
    /// Receives the next published message; `None` once the scheduler is
    /// disposed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade()
            && let Ok(mut map) = registry.lock()
        {
            map.remove(&self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

/// The queue end handed to a running loop, plus its cancellation token.
#[derive(Debug)]
pub struct RunContext {
    core: Arc<AgentCore>,
    inputs: mpsc::Receiver<QueuedInput>,
    token: CancellationToken,
}

impl RunContext {
    /// The shared scheduler state.
    #[must_use]
    pub fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }

    /// The ambient cancellation token for this loop instance.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for the next queued input; `None` on cancellation or queue
    /// closure.
    pub async fn wait_for_input(&mut self) -> Option<QueuedInput> {
        tokio::select! {
            () = self.token.cancelled() => None,
            input = self.inputs.recv() => input,
        }
    }

    /// Non-blocking drain of everything currently queued.
    pub fn try_drain_inputs(&mut self) -> Vec<QueuedInput> {
        let mut batch = Vec::new();
        while let Ok(input) = self.inputs.try_recv() {
            batch.push(input);
        }
        batch
    }

    /// Waits for one input, then drains the rest of the queue into a
    /// batch.
    pub async fn next_batch(&mut self) -> Option<Vec<QueuedInput>> {
        let first = self.wait_for_input().await?;
        let mut batch = vec![first];
        batch.extend(self.try_drain_inputs());
        Some(batch)
    }

    /// Number of inputs still queued.
    #[must_use]
    pub fn pending_count(&self) -> u32 {
        u32::try_from(self.inputs.len()).unwrap_or(u32::MAX)
    }
}

/// A run-loop strategy driven by [`MultiTurnAgent`].
///
/// Implementations loop until cancellation, catching their own per-run
/// failures and converting them into error-flagged completions; an `Err`
/// return is reserved for failures that make the loop itself unable to
/// continue.
#[async_trait]
pub trait RunLoop: Send + Sync + 'static {
    /// One-time setup before the loop spawns (warm a backend, check
    /// config). A failure aborts the start and is returned to the
    /// caller of [`MultiTurnAgent::run`].
    async fn before_run(&self, core: &Arc<AgentCore>) -> Result<()> {
        let _ = core;
        Ok(())
    }

    /// Drives runs until the context is cancelled.
    async fn run(&self, ctx: &mut RunContext) -> Result<()>;
}

/// The public scheduler handle: a [`RunLoop`] bound to an [`AgentCore`].
pub struct MultiTurnAgent<L: RunLoop> {
    core: Arc<AgentCore>,
    run_loop: Arc<L>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    token: Mutex<CancellationToken>,
}

impl<L: RunLoop> MultiTurnAgent<L> {
    /// Creates a scheduler without persistence.
    #[must_use]
    pub fn new(config: AgentConfig, run_loop: L) -> Self {
        Self::with_store_option(config, run_loop, None)
    }

    /// Creates a scheduler persisting through `store`.
    #[must_use]
    pub fn with_store(config: AgentConfig, run_loop: L, store: Arc<dyn ConversationStore>) -> Self {
        Self::with_store_option(config, run_loop, Some(store))
    }

    fn with_store_option(
        config: AgentConfig,
        run_loop: L,
        store: Option<Arc<dyn ConversationStore>>,
    ) -> Self {
        Self {
            core: Arc::new(AgentCore::new(config, store)),
            run_loop: Arc::new(run_loop),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            token: Mutex::new(CancellationToken::new()),
        }
    }

    /// The shared scheduler state.
    #[must_use]
    pub fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }

    /// Enqueues an input; see [`AgentCore::send`].
    pub async fn send(&self, input: UserInput) -> Result<SendReceipt> {
        self.core.send(input).await
    }

    /// Attaches a subscriber; see [`AgentCore::subscribe`].
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.core.subscribe()
    }

    /// Rebuilds state from the store; see [`AgentCore::recover`].
    pub async fn recover(&self) -> Result<bool> {
        self.core.recover().await
    }

    /// Spawns the run loop in the background.
    ///
    /// Fails with [`AgentError::AlreadyRunning`] when a loop is active
    /// and [`AgentError::Disposed`] after disposal. The queue is
    /// recreated if a previous lifecycle lost it.
    pub async fn run(&self) -> Result<()> {
        if self.core.disposed.load(Ordering::SeqCst) {
            return Err(AgentError::Disposed);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AgentError::AlreadyRunning);
        }

        let receiver = {
            let mut slot = self.core.input_rx.lock().await;
            match slot.take() {
                Some(rx) => rx,
                None => {
                    // A previous lifecycle lost the receiver (aborted
                    // loop); recreate the channel pair.
                    let (tx, rx) = mpsc::channel(self.core.config.queue_capacity);
                    if let Ok(mut sender) = self.core.input_tx.lock() {
                        *sender = Some(tx);
                    }
                    rx
                }
            }
        };

        if let Err(error) = self.run_loop.before_run(&self.core).await {
            self.core.input_rx.lock().await.replace(receiver);
            self.running.store(false, Ordering::SeqCst);
            return Err(error);
        }

        let token = CancellationToken::new();
        if let Ok(mut current) = self.token.lock() {
            *current = token.clone();
        }

        let core = Arc::clone(&self.core);
        let run_loop = Arc::clone(&self.run_loop);
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            let mut ctx = RunContext {
                core: Arc::clone(&core),
                inputs: receiver,
                token,
            };
            if let Err(err) = run_loop.run(&mut ctx).await {
                error!(error = %err, "run loop terminated abnormally");
            }
            // Hand the queue back so the next lifecycle resumes it.
            core.input_rx.lock().await.replace(ctx.inputs);
            running.store(false, Ordering::SeqCst);
        });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    /// Returns `true` while the run loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancels the run loop and awaits it.
    ///
    /// Queued inputs survive a stop; the next [`MultiTurnAgent::run`]
    /// resumes the same queue. When the loop does not come down within
    /// `timeout`, it is aborted.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        if let Ok(token) = self.token.lock() {
            token.cancel();
        }
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            match timeout {
                Some(limit) => {
                    if tokio::time::timeout(limit, handle).await.is_err() {
                        warn!("run loop did not stop in time; aborting");
                        if let Ok(mut task) = self.task.lock() {
                            task.take();
                        }
                        self.running.store(false, Ordering::SeqCst);
                    }
                }
                None => {
                    let _ = handle.await;
                }
            }
        }
        Ok(())
    }

    /// Stops the loop, then permanently closes the queue and every
    /// subscriber channel.
    pub async fn dispose(&self) -> Result<()> {
        self.stop(Some(Duration::from_secs(10))).await?;
        self.core.mark_disposed();
        Ok(())
    }

    /// Sends an input and yields the matching run's messages.
    ///
    /// Subscribes before sending, correlates the run via the
    /// `RunAssignment` whose input ids contain the returned receipt, and
    /// yields from that assignment through the matching `RunCompleted`,
    /// inclusive.
    pub async fn execute_run(
        &self,
        input: UserInput,
    ) -> Result<impl Stream<Item = Message> + Send> {
        let mut subscription = self.subscribe();
        let receipt = self.send(input).await?;

        Ok(stream! {
            let mut run_id: Option<String> = None;
            while let Some(message) = subscription.recv().await {
                match run_id.clone() {
                    None => {
                        let matched = match &message {
                            Message::RunAssignment(assignment)
                                if assignment.assignment.covers(&receipt) =>
                            {
                                Some(assignment.assignment.run_id.clone())
                            }
                            _ => None,
                        };
                        if let Some(id) = matched {
                            run_id = Some(id);
                            yield message;
                        }
                    }
                    Some(id) => {
                        let finished = matches!(
                            &message,
                            Message::RunCompleted(done) if done.completed_run_id == id
                        );
                        yield message;
                        if finished {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl<L: RunLoop> std::fmt::Debug for MultiTurnAgent<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTurnAgent")
            .field("thread_id", &self.core.config.thread_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
