//! Poll-based run loop for LLM-API backends with local tool dispatch.
//!
//! Each drained batch becomes one run. A run is a sequence of provider
//! turns: stream a reply, execute any local tool calls, feed the results
//! back, and repeat until the provider stops calling tools or the turn
//! cap is reached. Mid-run sends are picked up at turn boundaries when
//! injection is enabled (never mid-stream); otherwise they wait for the
//! next run.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt as _;
use tracing::{debug, warn};

use super::{AgentCore, RunContext, RunLoop};
use crate::error::{AgentError, Result};
use crate::message::{
    ExecutionTarget, Message, MessageCommon, Role, RunAssignmentMessage, ToolCall,
    ToolCallResultMessage,
};
use crate::options::GenerateReplyOptions;
use crate::provider::ProviderAgent;
use crate::run::{QueuedInput, RunAssignment};
use crate::tool::ToolDispatcher;

const DEFAULT_MAX_TURNS: usize = 10;

/// The poll-based [`RunLoop`].
pub struct PollLoop {
    provider: Arc<dyn ProviderAgent>,
    tools: Option<Arc<dyn ToolDispatcher>>,
    base_options: GenerateReplyOptions,
    system_prompt: Option<String>,
    max_turns_per_run: usize,
    allow_injection: bool,
}

impl PollLoop {
    /// Creates a loop over the given provider.
    #[must_use]
    pub fn new(provider: Arc<dyn ProviderAgent>) -> Self {
        Self {
            provider,
            tools: None,
            base_options: GenerateReplyOptions::new(),
            system_prompt: None,
            max_turns_per_run: DEFAULT_MAX_TURNS,
            allow_injection: false,
        }
    }

    /// Attaches a local tool dispatcher.
    #[must_use]
    pub fn with_tools(mut self, tools: Arc<dyn ToolDispatcher>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Sets the base reply options sent on every turn.
    #[must_use]
    pub fn with_options(mut self, options: GenerateReplyOptions) -> Self {
        self.base_options = options;
        self
    }

    /// Prepends a system prompt to every provider request.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Caps the number of provider turns per run.
    #[must_use]
    pub const fn with_max_turns(mut self, max_turns_per_run: usize) -> Self {
        self.max_turns_per_run = max_turns_per_run;
        self
    }

    /// Enables draining mid-run sends into the current run at turn
    /// boundaries.
    #[must_use]
    pub const fn with_injection(mut self, allow_injection: bool) -> Self {
        self.allow_injection = allow_injection;
        self
    }

    /// History, optionally prefixed with the system prompt.
    async fn messages_with_system_prompt(&self, core: &AgentCore) -> Vec<Message> {
        let history = core.history_snapshot().await;
        match &self.system_prompt {
            Some(prompt) => {
                let mut messages = Vec::with_capacity(history.len() + 1);
                messages.push(Message::system(prompt.clone()));
                messages.extend(history);
                messages
            }
            None => history,
        }
    }

    /// Drives one run to completion; per-run failures are contained
    /// here and reported through the completion message.
    async fn drive_run(&self, ctx: &mut RunContext, batch: Vec<QueuedInput>) {
        let core = Arc::clone(ctx.core());
        let assignment = core.start_run(&batch, false);
        core.publish_to_all(&core.assignment_message(&assignment))
            .await;

        for queued in &batch {
            for message in &queued.input.messages {
                core.add_to_history(core.stamp(message.clone(), &assignment))
                    .await;
            }
        }

        let outcome = self.turns(ctx, &core, &assignment).await;
        let completion = match outcome {
            Ok(()) | Err(AgentError::Cancelled) => {
                super::RunCompletion::success(&assignment.run_id, &assignment.generation_id)
            }
            Err(error) => super::RunCompletion::failure(
                &assignment.run_id,
                &assignment.generation_id,
                error.to_string(),
            ),
        };
        core.complete_run(completion.with_pending(ctx.pending_count()))
            .await;
    }

    /// Runs provider turns until there are no pending tool calls.
    async fn turns(
        &self,
        ctx: &mut RunContext,
        core: &Arc<AgentCore>,
        assignment: &RunAssignment,
    ) -> Result<()> {
        let mut order = OrderAllocator::default();

        for turn in 0..self.max_turns_per_run {
            if ctx.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            // Turn boundary: fold any mid-run sends into this run.
            if self.allow_injection && turn > 0 {
                self.absorb_injections(ctx, core, assignment).await;
            }

            let messages = self.messages_with_system_prompt(core).await;
            let options = self.base_options.clone().merge(
                &GenerateReplyOptions::new().for_run(
                    &assignment.run_id,
                    Some(core.thread_id()),
                    assignment.parent_run_id.as_deref(),
                ),
            );

            let mut stream = self
                .provider
                .generate_reply_streaming(messages, &options)
                .await?;

            let mut pending_calls: Vec<ToolCall> = Vec::new();
            loop {
                let item = tokio::select! {
                    () = ctx.token().cancelled() => return Err(AgentError::Cancelled),
                    item = stream.next() => item,
                };
                let Some(item) = item else { break };
                let message = item?;

                if !message.is_update()
                    && let Some(calls) = message.tool_calls()
                {
                    pending_calls.extend(calls.iter().cloned());
                }

                let mut message = core.stamp(message, assignment);
                if message.common().message_order_idx.is_none() {
                    let idx = order.allocate(&message);
                    message.common_mut().message_order_idx = Some(idx);
                }
                core.add_to_history(message.clone()).await;
                core.publish_to_all(&message).await;
            }

            if pending_calls.is_empty() {
                return Ok(());
            }
            debug!(
                run_id = %assignment.run_id,
                calls = pending_calls.len(),
                turn,
                "executing tool calls"
            );
            self.execute_tool_calls(core, assignment, &mut order, pending_calls)
                .await;
        }

        warn!(
            run_id = %assignment.run_id,
            max_turns = self.max_turns_per_run,
            "turn cap reached with tool calls still pending"
        );
        Ok(())
    }

    /// Publishes an injected assignment for mid-run inputs and merges
    /// their messages into history.
    async fn absorb_injections(
        &self,
        ctx: &mut RunContext,
        core: &Arc<AgentCore>,
        assignment: &RunAssignment,
    ) {
        let injected = ctx.try_drain_inputs();
        if injected.is_empty() {
            return;
        }

        let injection = RunAssignment {
            run_id: assignment.run_id.clone(),
            generation_id: assignment.generation_id.clone(),
            input_ids: injected
                .iter()
                .map(|queued| queued.receipt_id.clone())
                .collect(),
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

        for queued in injected {
            for message in queued.input.messages {
                core.add_to_history(core.stamp(message, assignment)).await;
            }
        }
    }

    /// Dispatches local calls, feeding each result back as a Tool-role
    /// message. `ProviderServer` calls are never dispatched locally.
    async fn execute_tool_calls(
        &self,
        core: &Arc<AgentCore>,
        assignment: &RunAssignment,
        order: &mut OrderAllocator,
        calls: Vec<ToolCall>,
    ) {
        for call in calls {
            if call.execution_target == ExecutionTarget::ProviderServer {
                continue;
            }
            let result = match &self.tools {
                Some(tools) => tools.dispatch(&call).await,
                None => crate::message::ToolCallResult {
                    tool_call_id: call.tool_call_id.clone(),
                    tool_name: call.function_name.clone(),
                    result: serde_json::Value::String(
                        "no tool dispatcher configured".to_owned(),
                    ),
                    is_error: true,
                    error_code: Some("no_dispatcher".to_owned()),
                },
            };

            let mut message = core.stamp(
                Message::ToolCallResult(ToolCallResultMessage {
                    result,
                    common: MessageCommon::with_role(Role::Tool),
                }),
                assignment,
            );
            message.common_mut().message_order_idx = Some(order.allocate(&message));
            core.add_to_history(message.clone()).await;
            core.publish_to_all(&message).await;
        }
    }
}

impl std::fmt::Debug for PollLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollLoop")
            .field("provider", &self.provider.name())
            .field("max_turns_per_run", &self.max_turns_per_run)
            .field("allow_injection", &self.allow_injection)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RunLoop for PollLoop {
    async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        while let Some(batch) = ctx.next_batch().await {
            self.drive_run(ctx, batch).await;
        }
        Ok(())
    }
}

/// Allocates `message_order_idx` values so that consecutive deltas and
/// the message that completes them share one index.
#[derive(Debug, Default)]
struct OrderAllocator {
    current: u64,
    open: Option<&'static str>,
}

impl OrderAllocator {
    fn allocate(&mut self, message: &Message) -> u64 {
        let Some(kind) = stream_kind(message) else {
            if self.open.is_some() {
                self.current += 1;
                self.open = None;
            }
            let idx = self.current;
            self.current += 1;
            return idx;
        };

        if let Some(open) = self.open
            && open != kind
        {
            self.current += 1;
            self.open = None;
        }
        let idx = self.current;
        if message.is_update() {
            self.open = Some(kind);
        } else {
            self.open = None;
            self.current += 1;
        }
        idx
    }
}

/// Groups update variants with their completing variants.
const fn stream_kind(message: &Message) -> Option<&'static str> {
    match message {
        Message::Text(_) | Message::TextUpdate(_) => Some("text"),
        Message::Reasoning(_) | Message::ReasoningUpdate(_) => Some("reasoning"),
        Message::Image(_) | Message::ImageUpdate(_) => Some("image"),
        Message::ToolCall(_)
        | Message::ToolCallUpdate(_)
        | Message::ToolsCall(_)
        | Message::ToolsCallUpdate(_) => Some("tools"),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, MultiTurnAgent};
    use crate::message::{ToolCallMessage, ToolsCallMessage};
    use crate::provider::mock::MockAgent;
    use crate::run::UserInput;
    use crate::tool::FunctionRegistry;
    use futures::StreamExt as _;
    use serde_json::Value;

    fn tool_call_message(id: &str, name: &str, args: &str) -> Message {
        Message::ToolCall(ToolCallMessage {
            call: ToolCall::function(id, name, args),
            common: MessageCommon::with_role(Role::Assistant),
        })
    }

    async fn collect_run(
        agent: &MultiTurnAgent<PollLoop>,
        text: &str,
    ) -> Vec<Message> {
        let stream = agent.execute_run(UserInput::from_text(text)).await.unwrap();
        stream.collect().await
    }

    #[tokio::test]
    async fn simple_text_turn_streams_in_order() {
        let provider = Arc::new(MockAgent::with_reply(vec![
            Message::text_update("Hi"),
            Message::text_update(" there"),
            Message::assistant("Hi there"),
        ]));
        let agent = MultiTurnAgent::new(
            AgentConfig::new("t1"),
            PollLoop::new(provider),
        );
        agent.run().await.unwrap();

        let messages = collect_run(&agent, "Hello").await;

        assert!(matches!(messages[0], Message::RunAssignment(_)));
        assert_eq!(messages[1].text(), Some("Hi".to_owned()));
        assert_eq!(messages[2].text(), Some(" there".to_owned()));
        assert_eq!(messages[3].text(), Some("Hi there".to_owned()));
        let Message::RunCompleted(done) = messages.last().unwrap() else {
            panic!("expected RunCompleted");
        };
        assert!(!done.is_error);

        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn deltas_and_final_share_an_order_idx() {
        let provider = Arc::new(MockAgent::with_reply(vec![
            Message::text_update("Hi"),
            Message::text_update(" there"),
            Message::assistant("Hi there"),
        ]));
        let agent = MultiTurnAgent::new(AgentConfig::new("t1"), PollLoop::new(provider));
        agent.run().await.unwrap();

        let messages = collect_run(&agent, "Hello").await;
        let indices: Vec<u64> = messages
            .iter()
            .filter(|m| !m.is_control())
            .map(|m| m.common().message_order_idx.unwrap())
            .collect();

        assert_eq!(indices, vec![0, 0, 0]);
        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn tool_calls_run_and_feed_back_into_the_next_turn() {
        let provider = Arc::new(MockAgent::new(vec![
            vec![tool_call_message("t1", "upper", r#"{"text":"hi"}"#)],
            vec![Message::assistant("done: HI")],
        ]));

        let mut registry = FunctionRegistry::new();
        registry.register("upper", |args: Value| async move {
            let text = args["text"].as_str().unwrap_or_default().to_uppercase();
            Ok(Value::String(text))
        });

        let agent = MultiTurnAgent::new(
            AgentConfig::new("t1"),
            PollLoop::new(provider.clone()).with_tools(Arc::new(registry)),
        );
        agent.run().await.unwrap();

        let messages = collect_run(&agent, "shout hi").await;

        let tool_result = messages
            .iter()
            .find_map(|m| match m {
                Message::ToolCallResult(r) => Some(r),
                _ => None,
            })
            .expect("tool result published");
        assert!(!tool_result.result.is_error);
        assert_eq!(tool_result.result.result, Value::String("HI".to_owned()));
        assert_eq!(tool_result.common.role, Role::Tool);

        assert!(
            messages
                .iter()
                .any(|m| m.text() == Some("done: HI".to_owned())),
            "second turn output published"
        );
        assert_eq!(provider.call_count(), 2);

        // The tool result made it into history for the second turn.
        let requests = provider.requests();
        assert!(requests[1].0.iter().any(|m| matches!(m, Message::ToolCallResult(_))));

        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn provider_server_calls_are_not_dispatched() {
        let mut call = ToolCall::function("t1", "web_search", "{}");
        call.execution_target = ExecutionTarget::ProviderServer;
        let provider = Arc::new(MockAgent::new(vec![
            vec![Message::ToolsCall(ToolsCallMessage {
                tool_calls: vec![call],
                common: MessageCommon::with_role(Role::Assistant),
            })],
            vec![Message::assistant("after")],
        ]));

        let agent = MultiTurnAgent::new(
            AgentConfig::new("t1"),
            PollLoop::new(provider).with_tools(Arc::new(FunctionRegistry::new())),
        );
        agent.run().await.unwrap();

        let messages = collect_run(&agent, "search").await;
        assert!(
            !messages
                .iter()
                .any(|m| matches!(m, Message::ToolCallResult(_))),
            "server-side call must not produce a local result"
        );
        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn missing_dispatcher_produces_error_results() {
        let provider = Arc::new(MockAgent::new(vec![
            vec![tool_call_message("t1", "anything", "{}")],
            vec![Message::assistant("recovered")],
        ]));

        let agent = MultiTurnAgent::new(AgentConfig::new("t1"), PollLoop::new(provider));
        agent.run().await.unwrap();

        let messages = collect_run(&agent, "call").await;
        let tool_result = messages
            .iter()
            .find_map(|m| match m {
                Message::ToolCallResult(r) => Some(r),
                _ => None,
            })
            .expect("error result published");
        assert!(tool_result.result.is_error);
        assert_eq!(
            tool_result.result.error_code.as_deref(),
            Some("no_dispatcher")
        );
        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn system_prompt_is_prepended_to_requests() {
        let provider = Arc::new(MockAgent::with_reply(vec![Message::assistant("ok")]));
        let agent = MultiTurnAgent::new(
            AgentConfig::new("t1"),
            PollLoop::new(provider.clone()).with_system_prompt("be brief"),
        );
        agent.run().await.unwrap();

        let _ = collect_run(&agent, "hi").await;

        let requests = provider.requests();
        let first = &requests[0].0[0];
        assert_eq!(first.role(), Role::System);
        assert_eq!(first.text(), Some("be brief".to_owned()));
        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn run_messages_carry_run_and_thread_identity() {
        let provider = Arc::new(MockAgent::with_reply(vec![Message::assistant("ok")]));
        let agent = MultiTurnAgent::new(AgentConfig::new("t-42"), PollLoop::new(provider));
        agent.run().await.unwrap();

        let messages = collect_run(&agent, "hi").await;
        let Message::RunAssignment(assignment) = &messages[0] else {
            panic!("expected assignment first");
        };
        let run_id = assignment.assignment.run_id.clone();

        for message in messages.iter().filter(|m| !m.is_control()) {
            assert_eq!(message.common().run_id.as_deref(), Some(run_id.as_str()));
            assert_eq!(message.common().thread_id.as_deref(), Some("t-42"));
        }
        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn provider_failure_completes_the_run_with_error() {
        struct FailingAgent;

        #[async_trait]
        impl ProviderAgent for FailingAgent {
            async fn generate_reply_streaming(
                &self,
                _messages: Vec<Message>,
                _options: &GenerateReplyOptions,
            ) -> Result<crate::provider::MessageStream> {
                Err(AgentError::backend("model exploded"))
            }

            fn name(&self) -> &str {
                "failing"
            }
        }

        let agent = MultiTurnAgent::new(
            AgentConfig::new("t1"),
            PollLoop::new(Arc::new(FailingAgent)),
        );
        agent.run().await.unwrap();

        let messages = collect_run(&agent, "hi").await;
        let Message::RunCompleted(done) = messages.last().unwrap() else {
            panic!("expected RunCompleted");
        };
        assert!(done.is_error);
        assert!(done.error_message.as_deref().unwrap().contains("model exploded"));
        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn mid_run_send_without_injection_defers_to_the_next_run() {
        use std::sync::OnceLock;

        // The tool handler sends a new input while its run is still in
        // flight, guaranteeing a mid-run arrival.
        let core_slot: Arc<OnceLock<Arc<crate::agent::AgentCore>>> = Arc::new(OnceLock::new());
        let slot = Arc::clone(&core_slot);
        let mut registry = FunctionRegistry::new();
        registry.register("sneak", move |_args: Value| {
            let slot = Arc::clone(&slot);
            async move {
                let core = slot.get().expect("core registered");
                core.send(crate::run::UserInput::from_text("late"))
                    .await
                    .map(|_| Value::Null)
            }
        });

        let provider = Arc::new(MockAgent::new(vec![
            vec![tool_call_message("t1", "sneak", "{}")],
            vec![Message::assistant("first done")],
            vec![Message::assistant("second done")],
        ]));
        let agent = MultiTurnAgent::new(
            AgentConfig::new("t1"),
            PollLoop::new(provider).with_tools(Arc::new(registry)),
        );
        core_slot.set(Arc::clone(agent.core())).unwrap();

        let mut subscription = agent.subscribe();
        agent.run().await.unwrap();
        let first = agent.send(UserInput::from_text("start")).await.unwrap();

        // Transcript across both runs: the late input must get its own
        // run, assigned only after the first run completed.
        let mut events = Vec::new();
        let mut completions = 0;
        while completions < 2 {
            match subscription.recv().await.unwrap() {
                Message::RunAssignment(msg) => events.push(("assigned", msg.assignment)),
                Message::RunCompleted(done) => {
                    completions += 1;
                    events.push((
                        "completed",
                        crate::run::RunAssignment {
                            run_id: done.completed_run_id.clone(),
                            ..crate::run::RunAssignment::default()
                        },
                    ));
                }
                _ => {}
            }
        }

        let kinds: Vec<&str> = events.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(kinds, vec!["assigned", "completed", "assigned", "completed"]);

        assert!(events[0].1.covers(&first));
        assert!(!events[0].1.was_injected);
        assert_ne!(events[2].1.run_id, events[0].1.run_id);
        assert_eq!(events[2].1.input_ids.len(), 1, "late input got its own run");

        agent.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn injected_inputs_are_absorbed_at_a_turn_boundary() {
        let provider = Arc::new(MockAgent::with_reply(vec![Message::assistant("ok")]));
        let poll = PollLoop::new(provider).with_injection(true);

        let agent = MultiTurnAgent::new(AgentConfig::new("t1"), PollLoop::new(Arc::new(
            MockAgent::with_reply(vec![]),
        )));
        let core = Arc::clone(agent.core());
        let mut subscription = agent.subscribe();

        // A context whose queue already holds a mid-run input.
        let (tx, rx) = tokio::sync::mpsc::channel(10);
        tx.send(crate::run::QueuedInput::enqueue(UserInput::from_text("mid-run")))
            .await
            .unwrap();
        let mut ctx = RunContext {
            core: Arc::clone(&core),
            inputs: rx,
            token: tokio_util::sync::CancellationToken::new(),
        };

        let assignment = core.start_run(&[], false);
        poll.absorb_injections(&mut ctx, &core, &assignment).await;

        let Some(Message::RunAssignment(published)) = subscription.recv().await else {
            panic!("expected injected assignment");
        };
        assert!(published.assignment.was_injected);
        assert_eq!(published.assignment.run_id, assignment.run_id);
        assert_eq!(published.assignment.input_ids.len(), 1);

        // The injected text landed in history for the next turn.
        assert!(
            core.history_snapshot()
                .await
                .iter()
                .any(|m| m.text() == Some("mid-run".to_owned()))
        );
    }

    mod order_allocator {
        use super::*;

        #[test]
        fn non_streaming_messages_get_distinct_indices() {
            let mut order = OrderAllocator::default();
            let a = order.allocate(&Message::assistant("a"));
            let b = order.allocate(&Message::assistant("b"));
            assert_eq!((a, b), (0, 1));
        }

        #[test]
        fn updates_share_until_completed() {
            let mut order = OrderAllocator::default();
            assert_eq!(order.allocate(&Message::text_update("a")), 0);
            assert_eq!(order.allocate(&Message::text_update("b")), 0);
            assert_eq!(order.allocate(&Message::assistant("ab")), 0);
            assert_eq!(order.allocate(&Message::assistant("next")), 1);
        }

        #[test]
        fn kind_switch_closes_the_open_item() {
            let mut order = OrderAllocator::default();
            assert_eq!(order.allocate(&Message::text_update("a")), 0);
            assert_eq!(order.allocate(&Message::reasoning_update("r")), 1);
            assert_eq!(
                order.allocate(&Message::reasoning(
                    "r",
                    crate::message::ReasoningVisibility::Plain
                )),
                1
            );
        }

        #[test]
        fn indices_are_monotonically_non_decreasing() {
            let mut order = OrderAllocator::default();
            let sequence = [
                Message::text_update("a"),
                Message::assistant("a"),
                Message::reasoning_update("r"),
                Message::usage(crate::usage::Usage::new(1, 1)),
                Message::assistant("b"),
            ];
            let mut last = 0;
            for message in &sequence {
                let idx = order.allocate(message);
                assert!(idx >= last);
                last = idx;
            }
        }
    }
}
