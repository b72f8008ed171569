//! The message algebra shared by providers, middleware, and subscribers.
//!
//! Every payload that flows through a run (streamed deltas, completed
//! messages, tool traffic, usage, and the run-control markers) is a
//! variant of [`Message`]. Variants are immutable after construction and
//! compare structurally. Capability queries ([`Message::text`],
//! [`Message::binary`], [`Message::tool_calls`],
//! [`Message::usage_payload`]) return `None` when not applicable;
//! [`Envelope`](Message::Envelope)
//! transparently delegates them to its inner message.
//!
//! Serialization uses one stable discriminator tag per variant and
//! round-trips every field, including the open-ended metadata maps.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run::RunAssignment;
use crate::usage::Usage;

/// An insertion-ordered key→value dictionary attached to messages.
pub type Metadata = serde_json::Map<String, Value>;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No role (control and infrastructure messages).
    #[default]
    None,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// System instructions.
    System,
    /// Tool results fed back to the model.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

/// Attributes shared by every message variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageCommon {
    /// Conversation role.
    #[serde(default)]
    pub role: Role,

    /// Name of the agent that produced this message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<String>,

    /// Provider generation (single-stream response) identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,

    /// Owning conversation thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Run this message was produced in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Parent run, for forked/continued runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,

    /// Ordering index within a generation; all updates for the same
    /// logical item share one index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_order_idx: Option<u64>,

    /// Ordered metadata dictionary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl MessageCommon {
    /// A common block with just a role set.
    #[must_use]
    pub fn with_role(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    /// Looks up a metadata value by key.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

/// Visibility of reasoning content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningVisibility {
    /// Full reasoning text, directly displayable.
    #[default]
    Plain,
    /// Provider-produced summary of hidden reasoning.
    Summary,
    /// Opaque ciphertext; preserved verbatim, never surfaced as text.
    Encrypted,
}

/// Where a tool call is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    /// Dispatched locally through the function registry.
    #[default]
    LocalFunction,
    /// Executed by the provider; never dispatched locally.
    ProviderServer,
}

/// A completed tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Provider-assigned position within the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    /// Name of the function being called.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,

    /// Raw JSON argument text, exactly as streamed.
    #[serde(default)]
    pub function_args: String,

    /// Dispatch target for this call.
    #[serde(default)]
    pub execution_target: ExecutionTarget,

    /// Sequential index assigned when the call closed (0, 1, 2, …).
    #[serde(default)]
    pub tool_call_idx: u32,
}

impl ToolCall {
    /// Create a named local-function call.
    #[must_use]
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        args: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(id.into()),
            function_name: Some(name.into()),
            function_args: args.into(),
            ..Self::default()
        }
    }
}

/// A streamed fragment of a tool call; every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallUpdate {
    /// Provider-assigned call identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Provider-assigned position within the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    /// Name of the function being called.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,

    /// Partial JSON argument text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_args: Option<String>,

    /// Dispatch target, when the fragment carries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_target: Option<ExecutionTarget>,
}

/// The outcome of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Identifier of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Name of the tool that produced the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Raw result payload (JSON value or plain text).
    #[serde(default)]
    pub result: Value,

    /// Whether the tool failed.
    #[serde(default)]
    pub is_error: bool,

    /// Machine-readable failure code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ToolCallResult {
    /// Returns the result rendered as text.
    #[must_use]
    pub fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Binary image payload with its media type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    /// Raw image bytes; base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,

    /// Media type, e.g. `image/png`.
    pub media_type: String,
}

impl ImageData {
    /// Renders the payload as a `data:` URL.
    #[must_use]
    pub fn data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.media_type,
            BASE64.encode(&self.bytes)
        )
    }
}

/// A citation attached to provider-executed tool output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Source URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Source title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Quoted snippet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,

    /// Start offset of the cited span in the surrounding text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_idx: Option<u64>,

    /// End offset of the cited span in the surrounding text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_idx: Option<u64>,
}

/// A completed text message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    /// The text content.
    pub text: String,

    /// Whether this text is model thinking rather than final output.
    #[serde(default)]
    pub is_thinking: bool,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A streamed text delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextUpdateMessage {
    /// The delta text.
    pub text: String,

    /// Whether this delta belongs to thinking output.
    #[serde(default)]
    pub is_thinking: bool,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A completed reasoning message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningMessage {
    /// The reasoning content (ciphertext when encrypted).
    pub reasoning: String,

    /// How the reasoning may be surfaced.
    #[serde(default)]
    pub visibility: ReasoningVisibility,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A streamed reasoning delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningUpdateMessage {
    /// The delta reasoning text.
    pub reasoning: String,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A completed image message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMessage {
    /// The image payload.
    pub image_data: ImageData,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A streamed image byte chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageUpdateMessage {
    /// The chunk bytes; base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,

    /// Media type; only the first chunk's value is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A single completed tool call message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMessage {
    /// The call.
    #[serde(flatten)]
    pub call: ToolCall,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A single streamed tool call fragment message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallUpdateMessage {
    /// The fragment.
    #[serde(flatten)]
    pub update: ToolCallUpdate,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// An ordered batch of completed tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallMessage {
    /// The calls, in close order.
    pub tool_calls: Vec<ToolCall>,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// An ordered batch of streamed tool call fragments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallUpdateMessage {
    /// The fragments, in receipt order.
    pub updates: Vec<ToolCallUpdate>,

    /// Provider chunk counter, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_idx: Option<u64>,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// The outcome of one tool call, as a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResultMessage {
    /// The result.
    #[serde(flatten)]
    pub result: ToolCallResult,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// Outcomes for a batch of tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallResultMessage {
    /// The results, in call order.
    pub results: Vec<ToolCallResult>,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A derived pairing of a tool call batch with its results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallAggregateMessage {
    /// The calls.
    pub tool_calls: Vec<ToolCall>,

    /// The matching results.
    pub results: Vec<ToolCallResult>,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

impl ToolsCallAggregateMessage {
    /// Derives the aggregate from a call batch and its results.
    ///
    /// Results are re-ordered to match their calls by `tool_call_id`;
    /// results without a matching call are appended in their own order.
    /// The common block is taken from the call side.
    #[must_use]
    pub fn from_parts(calls: ToolsCallMessage, results: ToolsCallResultMessage) -> Self {
        let mut unmatched = results.results;
        let mut ordered = Vec::with_capacity(unmatched.len());
        for call in &calls.tool_calls {
            if let Some(position) = unmatched.iter().position(|result| {
                result.tool_call_id.is_some() && result.tool_call_id == call.tool_call_id
            }) {
                ordered.push(unmatched.remove(position));
            }
        }
        ordered.extend(unmatched);

        Self {
            tool_calls: calls.tool_calls,
            results: ordered,
            common: calls.common,
        }
    }
}

/// A provider-executed tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerToolUseMessage {
    /// Provider-assigned call identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Name of the server-side tool.
    pub tool_name: String,

    /// Tool input payload.
    #[serde(default)]
    pub input: Value,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// The outcome of a provider-executed tool, with citations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerToolResultMessage {
    /// Identifier of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Name of the server-side tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Raw result payload.
    #[serde(default)]
    pub result: Value,

    /// Whether the tool failed.
    #[serde(default)]
    pub is_error: bool,

    /// Citations backing the result.
    #[serde(default)]
    pub citations: Vec<Citation>,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// Text with inline citation spans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextWithCitationsMessage {
    /// The text content.
    pub text: String,

    /// Citations referenced by the text.
    #[serde(default)]
    pub citations: Vec<Citation>,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A usage payload as a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMessage {
    /// The usage payload.
    pub usage: Usage,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// System-scoped todo context carried alongside the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoContextMessage {
    /// The todo context text.
    pub todo_context: String,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A sequence of inner messages treated as one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeMessage {
    /// The inner messages, in order.
    pub messages: Vec<Message>,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// A wrapper that adds provenance metadata while delegating capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMessage {
    /// The wrapped message.
    pub message: Box<Message>,

    /// Who added this envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<String>,

    /// Shared attributes (the envelope's own metadata lives here).
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// Control marker: inputs were drained into a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAssignmentMessage {
    /// The assignment.
    #[serde(flatten)]
    pub assignment: RunAssignment,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// Control marker: a run has finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCompletedMessage {
    /// The run that completed.
    pub completed_run_id: String,

    /// Whether the run forked a continuation.
    #[serde(default)]
    pub was_forked: bool,

    /// The continuation run, when forked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_to_run_id: Option<String>,

    /// Whether inputs were still queued when the run completed.
    #[serde(default)]
    pub has_pending_messages: bool,

    /// How many inputs were still queued.
    #[serde(default)]
    pub pending_message_count: u32,

    /// Whether the run terminated with an error.
    #[serde(default)]
    pub is_error: bool,

    /// Human-readable cause when `is_error` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Shared attributes.
    #[serde(flatten)]
    pub common: MessageCommon,
}

/// The closed set of conversation payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Completed text.
    Text(TextMessage),
    /// Streamed text delta.
    TextUpdate(TextUpdateMessage),
    /// Completed reasoning.
    Reasoning(ReasoningMessage),
    /// Streamed reasoning delta.
    ReasoningUpdate(ReasoningUpdateMessage),
    /// Completed image.
    Image(ImageMessage),
    /// Streamed image chunk.
    ImageUpdate(ImageUpdateMessage),
    /// Single completed tool call.
    ToolCall(ToolCallMessage),
    /// Single streamed tool call fragment.
    ToolCallUpdate(ToolCallUpdateMessage),
    /// Batch of completed tool calls.
    ToolsCall(ToolsCallMessage),
    /// Batch of streamed tool call fragments.
    ToolsCallUpdate(ToolsCallUpdateMessage),
    /// Single tool result.
    ToolCallResult(ToolCallResultMessage),
    /// Batch of tool results.
    ToolsCallResult(ToolsCallResultMessage),
    /// Calls paired with their results.
    ToolsCallAggregate(ToolsCallAggregateMessage),
    /// Provider-executed tool invocation.
    ServerToolUse(ServerToolUseMessage),
    /// Provider-executed tool outcome.
    ServerToolResult(ServerToolResultMessage),
    /// Text with citation spans.
    TextWithCitations(TextWithCitationsMessage),
    /// Usage payload.
    Usage(UsageMessage),
    /// Todo context.
    TodoContext(TodoContextMessage),
    /// Grouped inner messages.
    Composite(CompositeMessage),
    /// Provenance wrapper.
    Envelope(EnvelopeMessage),
    /// Run-assignment control marker.
    RunAssignment(RunAssignmentMessage),
    /// Run-completed control marker.
    RunCompleted(RunCompletedMessage),
}

impl Message {
    /// Create a completed text message with the given role.
    #[must_use]
    pub fn text_message(role: Role, text: impl Into<String>) -> Self {
        Self::Text(TextMessage {
            text: text.into(),
            is_thinking: false,
            common: MessageCommon::with_role(role),
        })
    }

    /// Create a user text message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(Role::User, text)
    }

    /// Create an assistant text message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, text)
    }

    /// Create a system text message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(Role::System, text)
    }

    /// Create a streamed assistant text delta.
    #[must_use]
    pub fn text_update(text: impl Into<String>) -> Self {
        Self::TextUpdate(TextUpdateMessage {
            text: text.into(),
            is_thinking: false,
            common: MessageCommon::with_role(Role::Assistant),
        })
    }

    /// Create a completed reasoning message.
    #[must_use]
    pub fn reasoning(reasoning: impl Into<String>, visibility: ReasoningVisibility) -> Self {
        Self::Reasoning(ReasoningMessage {
            reasoning: reasoning.into(),
            visibility,
            common: MessageCommon::with_role(Role::Assistant),
        })
    }

    /// Create a streamed reasoning delta.
    #[must_use]
    pub fn reasoning_update(reasoning: impl Into<String>) -> Self {
        Self::ReasoningUpdate(ReasoningUpdateMessage {
            reasoning: reasoning.into(),
            common: MessageCommon::with_role(Role::Assistant),
        })
    }

    /// Create a usage message.
    #[must_use]
    pub fn usage(usage: Usage) -> Self {
        Self::Usage(UsageMessage {
            usage,
            common: MessageCommon::default(),
        })
    }

    /// Create a todo-context message (role is always System).
    #[must_use]
    pub fn todo_context(text: impl Into<String>) -> Self {
        Self::TodoContext(TodoContextMessage {
            todo_context: text.into(),
            common: MessageCommon::with_role(Role::System),
        })
    }

    /// Create a composite from inner messages.
    #[must_use]
    pub fn composite(messages: Vec<Self>) -> Self {
        let role = messages.first().map_or(Role::None, Self::role);
        Self::Composite(CompositeMessage {
            messages,
            common: MessageCommon::with_role(role),
        })
    }

    /// Wrap `inner` in an envelope.
    ///
    /// Wrapping an envelope in an identical envelope (same metadata and
    /// same `added_by`) returns the existing envelope unchanged, keeping
    /// the wrap graph acyclic.
    #[must_use]
    pub fn envelope(inner: Self, metadata: Option<Metadata>, added_by: Option<String>) -> Self {
        if let Self::Envelope(env) = &inner
            && env.common.metadata == metadata
            && env.added_by == added_by
        {
            return inner;
        }
        let role = inner.role();
        Self::Envelope(EnvelopeMessage {
            message: Box::new(inner),
            added_by,
            common: MessageCommon {
                role,
                metadata,
                ..MessageCommon::default()
            },
        })
    }

    /// The shared attribute block of this message.
    #[must_use]
    pub const fn common(&self) -> &MessageCommon {
        match self {
            Self::Text(m) => &m.common,
            Self::TextUpdate(m) => &m.common,
            Self::Reasoning(m) => &m.common,
            Self::ReasoningUpdate(m) => &m.common,
            Self::Image(m) => &m.common,
            Self::ImageUpdate(m) => &m.common,
            Self::ToolCall(m) => &m.common,
            Self::ToolCallUpdate(m) => &m.common,
            Self::ToolsCall(m) => &m.common,
            Self::ToolsCallUpdate(m) => &m.common,
            Self::ToolCallResult(m) => &m.common,
            Self::ToolsCallResult(m) => &m.common,
            Self::ToolsCallAggregate(m) => &m.common,
            Self::ServerToolUse(m) => &m.common,
            Self::ServerToolResult(m) => &m.common,
            Self::TextWithCitations(m) => &m.common,
            Self::Usage(m) => &m.common,
            Self::TodoContext(m) => &m.common,
            Self::Composite(m) => &m.common,
            Self::Envelope(m) => &m.common,
            Self::RunAssignment(m) => &m.common,
            Self::RunCompleted(m) => &m.common,
        }
    }

    /// Mutable access to the shared attribute block.
    pub const fn common_mut(&mut self) -> &mut MessageCommon {
        match self {
            Self::Text(m) => &mut m.common,
            Self::TextUpdate(m) => &mut m.common,
            Self::Reasoning(m) => &mut m.common,
            Self::ReasoningUpdate(m) => &mut m.common,
            Self::Image(m) => &mut m.common,
            Self::ImageUpdate(m) => &mut m.common,
            Self::ToolCall(m) => &mut m.common,
            Self::ToolCallUpdate(m) => &mut m.common,
            Self::ToolsCall(m) => &mut m.common,
            Self::ToolsCallUpdate(m) => &mut m.common,
            Self::ToolCallResult(m) => &mut m.common,
            Self::ToolsCallResult(m) => &mut m.common,
            Self::ToolsCallAggregate(m) => &mut m.common,
            Self::ServerToolUse(m) => &mut m.common,
            Self::ServerToolResult(m) => &mut m.common,
            Self::TextWithCitations(m) => &mut m.common,
            Self::Usage(m) => &mut m.common,
            Self::TodoContext(m) => &mut m.common,
            Self::Composite(m) => &mut m.common,
            Self::Envelope(m) => &mut m.common,
            Self::RunAssignment(m) => &mut m.common,
            Self::RunCompleted(m) => &mut m.common,
        }
    }

    /// The conversation role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.common().role
    }

    /// Stamps run/thread identity onto the message.
    #[must_use]
    pub fn with_run(
        mut self,
        run_id: impl Into<String>,
        generation_id: impl Into<String>,
        thread_id: Option<&str>,
    ) -> Self {
        let common = self.common_mut();
        common.run_id = Some(run_id.into());
        common.generation_id = Some(generation_id.into());
        common.thread_id = thread_id.map(str::to_owned);
        self
    }

    /// Sets the ordering index.
    #[must_use]
    pub fn with_order_idx(mut self, idx: u64) -> Self {
        self.common_mut().message_order_idx = Some(idx);
        self
    }

    /// Sets a metadata entry, creating the dictionary if needed.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.common_mut()
            .metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    /// Textual content, when this variant can surface one.
    ///
    /// Encrypted reasoning returns `None`; images render as a `data:`
    /// URL; tool results render their payload; envelopes delegate.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Text(m) => Some(m.text.clone()),
            Self::TextUpdate(m) => Some(m.text.clone()),
            Self::Reasoning(m) => match m.visibility {
                ReasoningVisibility::Encrypted => None,
                _ => Some(m.reasoning.clone()),
            },
            Self::ReasoningUpdate(m) => Some(m.reasoning.clone()),
            Self::Image(m) => Some(m.image_data.data_url()),
            Self::ToolCallResult(m) => Some(m.result.result_text()),
            Self::ToolsCallAggregate(m) => {
                let joined = m
                    .results
                    .iter()
                    .map(ToolCallResult::result_text)
                    .collect::<Vec<_>>()
                    .join("\n");
                Some(joined)
            }
            Self::TextWithCitations(m) => Some(m.text.clone()),
            Self::TodoContext(m) => Some(m.todo_context.clone()),
            Self::Envelope(m) => m.message.text(),
            _ => None,
        }
    }

    /// Binary content, when this variant carries one.
    #[must_use]
    pub fn binary(&self) -> Option<(&[u8], &str)> {
        match self {
            Self::Image(m) => Some((&m.image_data.bytes, m.image_data.media_type.as_str())),
            Self::Envelope(m) => m.message.binary(),
            _ => None,
        }
    }

    /// The tool calls carried by this message.
    #[must_use]
    pub fn tool_calls(&self) -> Option<&[ToolCall]> {
        match self {
            Self::ToolCall(m) => Some(std::slice::from_ref(&m.call)),
            Self::ToolsCall(m) => Some(&m.tool_calls),
            Self::ToolsCallAggregate(m) => Some(&m.tool_calls),
            Self::Envelope(m) => m.message.tool_calls(),
            _ => None,
        }
    }

    /// The usage payload, when this is a usage message.
    #[must_use]
    pub fn usage_payload(&self) -> Option<&Usage> {
        match self {
            Self::Usage(m) => Some(&m.usage),
            Self::Envelope(m) => m.message.usage_payload(),
            _ => None,
        }
    }

    /// Returns `true` for streamed delta variants.
    #[must_use]
    pub fn is_update(&self) -> bool {
        match self {
            Self::TextUpdate(_)
            | Self::ReasoningUpdate(_)
            | Self::ImageUpdate(_)
            | Self::ToolCallUpdate(_)
            | Self::ToolsCallUpdate(_) => true,
            Self::Envelope(m) => m.message.is_update(),
            _ => false,
        }
    }

    /// Returns `true` for run-control markers.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::RunAssignment(_) | Self::RunCompleted(_))
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    mod capabilities {
        use super::*;

        #[test]
        fn text_variants_surface_content() {
            assert_eq!(Message::user("Hello").text(), Some("Hello".to_owned()));
            assert_eq!(Message::text_update("Hi").text(), Some("Hi".to_owned()));
            assert_eq!(
                Message::todo_context("- do it").text(),
                Some("- do it".to_owned())
            );
        }

        #[test]
        fn plain_and_summary_reasoning_surface_text() {
            let plain = Message::reasoning("thinking", ReasoningVisibility::Plain);
            assert_eq!(plain.text(), Some("thinking".to_owned()));

            let summary = Message::reasoning("summary", ReasoningVisibility::Summary);
            assert_eq!(summary.text(), Some("summary".to_owned()));
        }

        #[test]
        fn encrypted_reasoning_is_never_surfaced() {
            let msg = Message::reasoning("c1ph3r", ReasoningVisibility::Encrypted);
            assert_eq!(msg.text(), None);

            // The ciphertext itself is preserved verbatim.
            if let Message::Reasoning(m) = &msg {
                assert_eq!(m.reasoning, "c1ph3r");
            } else {
                panic!("expected Reasoning variant");
            }
        }

        #[test]
        fn image_renders_data_url_and_binary() {
            let msg = Message::Image(ImageMessage {
                image_data: ImageData {
                    bytes: vec![1, 2, 3],
                    media_type: "image/png".to_owned(),
                },
                common: MessageCommon::with_role(Role::Assistant),
            });

            assert_eq!(msg.text(), Some("data:image/png;base64,AQID".to_owned()));
            let (bytes, media_type) = msg.binary().unwrap();
            assert_eq!(bytes, &[1, 2, 3]);
            assert_eq!(media_type, "image/png");
        }

        #[test]
        fn tool_call_variants_expose_calls() {
            let call = ToolCall::function("t1", "lookup", "{}");
            let single = Message::ToolCall(ToolCallMessage {
                call: call.clone(),
                common: MessageCommon::default(),
            });
            assert_eq!(single.tool_calls().unwrap().len(), 1);

            let batch = Message::ToolsCall(ToolsCallMessage {
                tool_calls: vec![call.clone(), ToolCall::function("t2", "store", "{}")],
                common: MessageCommon::default(),
            });
            assert_eq!(batch.tool_calls().unwrap().len(), 2);

            assert!(Message::user("no calls").tool_calls().is_none());
        }

        #[test]
        fn tool_result_renders_text() {
            let msg = Message::ToolCallResult(ToolCallResultMessage {
                result: ToolCallResult {
                    result: Value::String("42".to_owned()),
                    ..ToolCallResult::default()
                },
                common: MessageCommon::default(),
            });
            assert_eq!(msg.text(), Some("42".to_owned()));
        }

        #[test]
        fn aggregate_pairs_results_with_their_calls() {
            let calls = ToolsCallMessage {
                tool_calls: vec![
                    ToolCall::function("t1", "first", "{}"),
                    ToolCall::function("t2", "second", "{}"),
                ],
                common: MessageCommon::with_role(Role::Assistant),
            };
            // Results arrive in the opposite order.
            let results = ToolsCallResultMessage {
                results: vec![
                    ToolCallResult {
                        tool_call_id: Some("t2".to_owned()),
                        result: Value::String("two".to_owned()),
                        ..ToolCallResult::default()
                    },
                    ToolCallResult {
                        tool_call_id: Some("t1".to_owned()),
                        result: Value::String("one".to_owned()),
                        ..ToolCallResult::default()
                    },
                ],
                common: MessageCommon::default(),
            };

            let aggregate = ToolsCallAggregateMessage::from_parts(calls, results);
            assert_eq!(aggregate.results[0].tool_call_id.as_deref(), Some("t1"));
            assert_eq!(aggregate.results[1].tool_call_id.as_deref(), Some("t2"));

            let message = Message::ToolsCallAggregate(aggregate);
            assert_eq!(message.tool_calls().unwrap().len(), 2);
            assert_eq!(message.text(), Some("one\ntwo".to_owned()));
        }

        #[test]
        fn aggregate_keeps_orphan_results() {
            let calls = ToolsCallMessage {
                tool_calls: vec![ToolCall::function("t1", "only", "{}")],
                common: MessageCommon::default(),
            };
            let results = ToolsCallResultMessage {
                results: vec![ToolCallResult {
                    tool_call_id: Some("t9".to_owned()),
                    ..ToolCallResult::default()
                }],
                common: MessageCommon::default(),
            };

            let aggregate = ToolsCallAggregateMessage::from_parts(calls, results);
            assert_eq!(aggregate.results.len(), 1);
            assert_eq!(aggregate.results[0].tool_call_id.as_deref(), Some("t9"));
        }

        #[test]
        fn composite_takes_role_from_first_inner() {
            let message =
                Message::composite(vec![Message::user("a"), Message::assistant("b")]);
            assert_eq!(message.role(), Role::User);
            assert!(Message::composite(Vec::new()).role() == Role::None);
        }

        #[test]
        fn usage_message_exposes_payload() {
            let msg = Message::usage(Usage::new(10, 20));
            assert_eq!(msg.usage_payload().unwrap().total_tokens, 30);
            assert!(Message::user("x").usage_payload().is_none());
        }

        #[test]
        fn update_and_control_classification() {
            assert!(Message::text_update("d").is_update());
            assert!(Message::reasoning_update("d").is_update());
            assert!(!Message::user("d").is_update());

            let done = Message::RunCompleted(RunCompletedMessage::default());
            assert!(done.is_control());
            assert!(!Message::user("d").is_control());
        }
    }

    mod envelope {
        use super::*;

        fn meta(key: &str) -> Metadata {
            let mut m = Metadata::new();
            m.insert(key.to_owned(), Value::from("v"));
            m
        }

        #[test]
        fn delegates_capabilities() {
            let inner = Message::user("Hello");
            let wrapped = Message::envelope(inner, Some(meta("source")), Some("router".into()));

            assert_eq!(wrapped.text(), Some("Hello".to_owned()));
            assert_eq!(wrapped.role(), Role::User);
            assert!(!wrapped.is_update());
        }

        #[test]
        fn identical_wrap_returns_existing_envelope() {
            let wrapped = Message::envelope(
                Message::user("Hello"),
                Some(meta("source")),
                Some("router".into()),
            );
            let again = Message::envelope(
                wrapped.clone(),
                Some(meta("source")),
                Some("router".into()),
            );
            assert_eq!(again, wrapped);
        }

        #[test]
        fn differing_wrap_nests() {
            let wrapped = Message::envelope(Message::user("Hello"), Some(meta("a")), None);
            let nested = Message::envelope(wrapped, Some(meta("b")), None);

            if let Message::Envelope(outer) = &nested {
                assert!(matches!(*outer.message, Message::Envelope(_)));
            } else {
                panic!("expected envelope");
            }
            // Capabilities still reach the innermost message.
            assert_eq!(nested.text(), Some("Hello".to_owned()));
        }
    }

    mod serde_forms {
        use super::*;

        #[test]
        fn text_roundtrip_with_common_fields() {
            let msg = Message::user("Hello")
                .with_run("r1", "g1", Some("t1"))
                .with_order_idx(3)
                .with_meta("completion_id", "c1");

            let json = serde_json::to_string(&msg).unwrap();
            assert!(json.contains(r#""type":"text""#));
            assert!(json.contains(r#""role":"user""#));

            let parsed: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, msg);
            assert_eq!(parsed.common().message_order_idx, Some(3));
            assert_eq!(parsed.common().meta("completion_id").unwrap(), "c1");
        }

        #[test]
        fn tool_call_update_allows_all_fields_absent() {
            let parsed: Message =
                serde_json::from_str(r#"{"type":"tool_call_update"}"#).unwrap();
            if let Message::ToolCallUpdate(m) = parsed {
                assert!(m.update.tool_call_id.is_none());
                assert!(m.update.function_args.is_none());
                assert!(m.update.execution_target.is_none());
            } else {
                panic!("expected ToolCallUpdate");
            }
        }

        #[test]
        fn image_bytes_roundtrip_base64() {
            let msg = Message::Image(ImageMessage {
                image_data: ImageData {
                    bytes: vec![0, 159, 146, 150],
                    media_type: "image/jpeg".to_owned(),
                },
                common: MessageCommon::default(),
            });

            let json = serde_json::to_string(&msg).unwrap();
            let parsed: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, msg);
        }

        #[test]
        fn usage_extra_properties_roundtrip() {
            let msg = Message::usage(
                Usage::new(10, 20)
                    .with_cost(0.001)
                    .with_extra("enhanced_by", "openrouter_middleware"),
            );

            let json = serde_json::to_string(&msg).unwrap();
            let parsed: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, msg);
        }

        #[test]
        fn control_messages_tag_stably() {
            let done = Message::RunCompleted(RunCompletedMessage {
                completed_run_id: "r1".to_owned(),
                is_error: true,
                error_message: Some("backend exited".to_owned()),
                ..RunCompletedMessage::default()
            });

            let json = serde_json::to_string(&done).unwrap();
            assert!(json.contains(r#""type":"run_completed""#));

            let parsed: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, done);
        }

        #[test]
        fn every_variant_has_a_stable_discriminator_tag() {
            let samples: Vec<(Message, &str)> = vec![
                (Message::user("t"), "text"),
                (Message::text_update("t"), "text_update"),
                (
                    Message::reasoning("r", ReasoningVisibility::Plain),
                    "reasoning",
                ),
                (Message::reasoning_update("r"), "reasoning_update"),
                (
                    Message::Image(ImageMessage::default()),
                    "image",
                ),
                (
                    Message::ImageUpdate(ImageUpdateMessage::default()),
                    "image_update",
                ),
                (
                    Message::ToolCall(ToolCallMessage::default()),
                    "tool_call",
                ),
                (
                    Message::ToolCallUpdate(ToolCallUpdateMessage::default()),
                    "tool_call_update",
                ),
                (
                    Message::ToolsCall(ToolsCallMessage::default()),
                    "tools_call",
                ),
                (
                    Message::ToolsCallUpdate(ToolsCallUpdateMessage::default()),
                    "tools_call_update",
                ),
                (
                    Message::ToolCallResult(ToolCallResultMessage::default()),
                    "tool_call_result",
                ),
                (
                    Message::ToolsCallResult(ToolsCallResultMessage::default()),
                    "tools_call_result",
                ),
                (
                    Message::ToolsCallAggregate(ToolsCallAggregateMessage::default()),
                    "tools_call_aggregate",
                ),
                (
                    Message::ServerToolUse(ServerToolUseMessage::default()),
                    "server_tool_use",
                ),
                (
                    Message::ServerToolResult(ServerToolResultMessage::default()),
                    "server_tool_result",
                ),
                (
                    Message::TextWithCitations(TextWithCitationsMessage::default()),
                    "text_with_citations",
                ),
                (Message::usage(Usage::zero()), "usage"),
                (Message::todo_context("x"), "todo_context"),
                (Message::composite(Vec::new()), "composite"),
                (
                    Message::envelope(Message::user("inner"), None, None),
                    "envelope",
                ),
                (
                    Message::RunAssignment(RunAssignmentMessage::default()),
                    "run_assignment",
                ),
                (
                    Message::RunCompleted(RunCompletedMessage::default()),
                    "run_completed",
                ),
            ];

            for (message, tag) in samples {
                let json = serde_json::to_string(&message).unwrap();
                assert!(
                    json.contains(&format!(r#""type":"{tag}""#)),
                    "wrong tag for {json}"
                );
                let parsed: Message = serde_json::from_str(&json).unwrap();
                assert_eq!(parsed, message, "round trip for tag {tag}");
            }
        }

        #[test]
        fn metadata_preserves_insertion_order() {
            let msg = Message::user("x")
                .with_meta("z_first", 1)
                .with_meta("a_second", 2);
            let json = serde_json::to_string(&msg).unwrap();
            let z = json.find("z_first").unwrap();
            let a = json.find("a_second").unwrap();
            assert!(z < a);
        }
    }
}
