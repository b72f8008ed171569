//! Push-based run loop for backends with a persistent duplex process.
//!
//! The backend (a CLI bridge, an SDK subprocess) pushes translated
//! messages on its own schedule; a turn ends when it emits its result
//! sentinel. In [`PushMode::Interactive`] the session and its event
//! subscription are opened once and reused across turns, and newly
//! queued inputs are forwarded to the backend mid-turn. In
//! [`PushMode::OneShot`] each drained batch gets a fresh backend
//! invocation and mid-run inputs wait for the next iteration.
//!
//! [`ProcessHost`] carries the child-process plumbing: serialized
//! start/stop, and the graceful shutdown ladder (exit sentinel, stdin
//! close, bounded wait, kill, bounded reader join).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AgentCore, RunCompletion, RunContext, RunLoop};
use crate::error::{AgentError, Result};
use crate::message::{Message, MessageCommon, RunAssignmentMessage};
use crate::run::{QueuedInput, RunAssignment};

/// Wait for a clean exit before killing the process.
const SOFT_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on joining background reader tasks after shutdown.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// An event pushed by a backend session.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A translated conversation message.
    Message(Message),

    /// The backend finished the current turn (result sentinel).
    TurnCompleted,

    /// The backend hit a turn-scoped error; the turn is cancelled.
    TurnFailed(String),

    /// The backend is unrecoverable (process death, broken pipe).
    Fatal(String),
}

/// One live backend conversation.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Opens the event subscription. Callable once per session; the
    /// subscription is reused across turns.
    async fn subscribe(&self) -> Result<mpsc::Receiver<BackendEvent>>;

    /// Forwards user messages to the backend.
    async fn send_input(&self, messages: Vec<Message>) -> Result<()>;

    /// Tears the session down gracefully.
    async fn stop(&self) -> Result<()>;
}

/// Connects backend sessions.
#[async_trait]
pub trait PushBackend: Send + Sync {
    /// Starts (or restarts) a backend session.
    async fn connect(&self) -> Result<Arc<dyn BackendSession>>;
}

/// Session reuse mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PushMode {
    /// Long-lived session reused across turns; mid-turn inputs are
    /// forwarded to the backend.
    #[default]
    Interactive,

    /// One backend invocation per drained batch; mid-run inputs wait
    /// for the next iteration.
    OneShot,
}

enum TurnStep {
    Event(Option<BackendEvent>),
    Input(Option<QueuedInput>),
    Cancelled,
}

enum TurnOutcome {
    Completed,
    Cancelled,
    Failed { reason: String, fatal: bool },
}

/// The push-based [`RunLoop`].
pub struct PushLoop {
    backend: Arc<dyn PushBackend>,
    mode: PushMode,
    restart_lock: tokio::sync::Mutex<()>,
    session: tokio::sync::Mutex<Option<LiveSession>>,
}

struct LiveSession {
    session: Arc<dyn BackendSession>,
    events: mpsc::Receiver<BackendEvent>,
}

impl PushLoop {
    /// Creates a loop over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn PushBackend>, mode: PushMode) -> Self {
        Self {
            backend,
            mode,
            restart_lock: tokio::sync::Mutex::new(()),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Connects a fresh session under the restart lock.
    async fn connect(&self) -> Result<LiveSession> {
        let _guard = self.restart_lock.lock().await;
        let session = self.backend.connect().await?;
        let events = session.subscribe().await?;
        info!("backend session connected");
        Ok(LiveSession { session, events })
    }

    /// Stops a session under the restart lock.
    async fn teardown(&self, live: LiveSession) {
        let _guard = self.restart_lock.lock().await;
        if let Err(error) = live.session.stop().await {
            warn!(%error, "backend stop failed");
        }
    }

    /// Takes the cached Interactive session, reconnecting if the
    /// previous one died. This is the auto-restart path.
    async fn acquire(&self) -> Result<LiveSession> {
        if let Some(live) = self.session.lock().await.take() {
            return Ok(live);
        }
        self.connect().await
    }

    /// Drives one run; failures are contained into the completion.
    async fn drive_run(&self, ctx: &mut RunContext, batch: Vec<QueuedInput>) {
        let core = Arc::clone(ctx.core());
        let assignment = core.start_run(&batch, false);
        core.publish_to_all(&core.assignment_message(&assignment))
            .await;

        let mut initial = Vec::new();
        for queued in &batch {
            for message in &queued.input.messages {
                let stamped = core.stamp(message.clone(), &assignment);
                core.add_to_history(stamped.clone()).await;
                initial.push(stamped);
            }
        }

        let outcome = match self.mode {
            PushMode::Interactive => match self.acquire().await {
                Ok(mut live) => {
                    let outcome = self.turn(ctx, &core, &assignment, &mut live, initial, true).await;
                    if matches!(outcome, TurnOutcome::Failed { fatal: true, .. }) {
                        self.teardown(live).await;
                    } else {
                        // Session survives the turn (including non-fatal
                        // failures and cancellation).
                        *self.session.lock().await = Some(live);
                    }
                    outcome
                }
                Err(error) => TurnOutcome::Failed {
                    reason: error.to_string(),
                    fatal: true,
                },
            },
            PushMode::OneShot => match self.connect().await {
                Ok(mut live) => {
                    let outcome = self.turn(ctx, &core, &assignment, &mut live, initial, false).await;
                    self.teardown(live).await;
                    outcome
                }
                Err(error) => TurnOutcome::Failed {
                    reason: error.to_string(),
                    fatal: true,
                },
            },
        };

        let completion = match outcome {
            TurnOutcome::Completed | TurnOutcome::Cancelled => {
                RunCompletion::success(&assignment.run_id, &assignment.generation_id)
            }
            TurnOutcome::Failed { reason, .. } => {
                RunCompletion::failure(&assignment.run_id, &assignment.generation_id, reason)
            }
        };
        core.complete_run(completion.with_pending(ctx.pending_count()))
            .await;
    }

    /// Sends the initial messages and pumps backend events until the
    /// turn sentinel. When `watch_inputs` is set, newly queued inputs
    /// are forwarded to the backend mid-turn as injected assignments.
    async fn turn(
        &self,
        ctx: &mut RunContext,
        core: &Arc<AgentCore>,
        assignment: &RunAssignment,
        live: &mut LiveSession,
        initial: Vec<Message>,
        watch_inputs: bool,
    ) -> TurnOutcome {
        if let Err(error) = live.session.send_input(initial).await {
            return TurnOutcome::Failed {
                reason: error.to_string(),
                fatal: true,
            };
        }

        let mut watching = watch_inputs;
        loop {
            let step = if watching {
                tokio::select! {
                    () = ctx.token.cancelled() => TurnStep::Cancelled,
                    event = live.events.recv() => TurnStep::Event(event),
                    input = ctx.inputs.recv() => TurnStep::Input(input),
                }
            } else {
                tokio::select! {
                    () = ctx.token.cancelled() => TurnStep::Cancelled,
                    event = live.events.recv() => TurnStep::Event(event),
                }
            };

            let event = match step {
                TurnStep::Cancelled => return TurnOutcome::Cancelled,
                TurnStep::Input(Some(queued)) => {
                    if let Err(error) = self
                        .forward_injection(core, assignment, &live.session, queued)
                        .await
                    {
                        return TurnOutcome::Failed {
                            reason: error.to_string(),
                            fatal: true,
                        };
                    }
                    continue;
                }
                TurnStep::Input(None) => {
                    // Queue closed (disposal in progress); stop watching.
                    watching = false;
                    continue;
                }
                TurnStep::Event(event) => event,
            };

            match event {
                Some(BackendEvent::Message(message)) => {
                    let stamped = core.stamp(message, assignment);
                    core.add_to_history(stamped.clone()).await;
                    core.publish_to_all(&stamped).await;
                }
                Some(BackendEvent::TurnCompleted) => return TurnOutcome::Completed,
                Some(BackendEvent::TurnFailed(reason)) => {
                    // Turn-scoped error: the turn is cancelled, the
                    // backend survives.
                    return TurnOutcome::Failed {
                        reason,
                        fatal: false,
                    };
                }
                fatal @ (Some(BackendEvent::Fatal(_)) | None) => {
                    let reason = match fatal {
                        Some(BackendEvent::Fatal(reason)) => reason,
                        _ => "backend event stream closed".to_owned(),
                    };
                    return TurnOutcome::Failed {
                        reason,
                        fatal: true,
                    };
                }
            }
        }
    }

    /// Publishes an injected assignment for a mid-turn input and
    /// forwards its messages to the backend.
    async fn forward_injection(
        &self,
        core: &Arc<AgentCore>,
        assignment: &RunAssignment,
        session: &Arc<dyn BackendSession>,
        queued: QueuedInput,
    ) -> Result<()> {
        debug!(run_id = %assignment.run_id, "forwarding mid-turn input");
        let injection = RunAssignment {
            run_id: assignment.run_id.clone(),
            generation_id: assignment.generation_id.clone(),
            input_ids: vec![queued.receipt_id.clone()],
            parent_run_id: assignment.parent_run_id.clone(),
            was_injected: true,
        };
        core.publish_to_all(&Message::RunAssignment(RunAssignmentMessage {
            assignment: injection,
            common: MessageCommon {
                thread_id: Some(core.thread_id().to_owned()),
                run_id: Some(assignment.run_id.clone()),
                generation_id: Some(assignment.generation_id.clone()),
                ..MessageCommon::default()
            },
        }))
        .await;

        let mut forwarded = Vec::new();
        for message in queued.input.messages {
            let stamped = core.stamp(message, assignment);
            core.add_to_history(stamped.clone()).await;
            forwarded.push(stamped);
        }
        session.send_input(forwarded).await
    }
}

impl std::fmt::Debug for PushLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushLoop")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RunLoop for PushLoop {
    async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        while let Some(batch) = ctx.next_batch().await {
            self.drive_run(ctx, batch).await;
        }
        // Cancellation: bring any live session down before returning.
        if let Some(live) = self.session.lock().await.take() {
            self.teardown(live).await;
        }
        Ok(())
    }
}

/// Owns a backend child process and its I/O plumbing.
///
/// Start and stop are expected to be serialized by the caller (the push
/// loop holds its restart lock around both). The shutdown ladder: write
/// the exit sentinel, close stdin, wait up to ten seconds for a clean
/// exit, kill the process, then join reader tasks with a two-second
/// bound.
#[derive(Debug)]
pub struct ProcessHost {
    program: String,
    args: Vec<String>,
    exit_sentinel: Option<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    lines: Option<mpsc::Receiver<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessHost {
    /// Describes a process to host; nothing is spawned yet.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            exit_sentinel: None,
            child: None,
            stdin: None,
            lines: None,
            readers: Vec::new(),
        }
    }

    /// Sets a line written to stdin ahead of shutdown (e.g. `/exit`).
    #[must_use]
    pub fn with_exit_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.exit_sentinel = Some(sentinel.into());
        self
    }

    /// Spawns the child with piped stdio and starts the stdout reader.
    pub async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(AgentError::backend("process already started"));
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::backend(format!("spawn {}: {e}", self.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::backend("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::backend("child stdout unavailable"))?;

        let (tx, rx) = mpsc::channel(256);
        self.readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        }));

        info!(program = %self.program, pid = child.id(), "backend process started");
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.lines = Some(rx);
        Ok(())
    }

    /// Takes the stdout line receiver; available once per start.
    #[must_use]
    pub fn lines(&mut self) -> Option<mpsc::Receiver<String>> {
        self.lines.take()
    }

    /// Writes one line to the child's stdin.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AgentError::backend("process not started"))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::backend(format!("stdin write: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| AgentError::backend(format!("stdin write: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| AgentError::backend(format!("stdin flush: {e}")))?;
        Ok(())
    }

    /// Returns `true` while the child is running.
    pub fn is_alive(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    /// Runs the graceful shutdown ladder.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            if let Some(sentinel) = self.exit_sentinel.clone() {
                let _ = stdin.write_all(sentinel.as_bytes()).await;
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.flush().await;
            }
            // Dropping closes the pipe.
            drop(stdin);
        }

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(SOFT_EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "backend process exited"),
                Ok(Err(error)) => warn!(%error, "backend process wait failed"),
                Err(_) => {
                    warn!(program = %self.program, "backend did not exit in time; killing");
                    let _ = child.kill().await;
                }
            }
        }

        for handle in self.readers.drain(..) {
            let _ = tokio::time::timeout(READER_JOIN_TIMEOUT, handle).await;
        }
        self.lines = None;
        Ok(())
    }
}

impl Drop for ProcessHost {
    fn drop(&mut self) {
        // kill_on_drop covers the child; readers stop when the pipes do.
        for handle in self.readers.drain(..) {
            handle.abort();
        }
    }
}
