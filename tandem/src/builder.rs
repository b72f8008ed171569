//! Builders that reassemble streamed deltas into completed messages.
//!
//! One builder exists per accumulative variant. Each holds an explicit
//! buffer, applies deltas via `add`, and produces the completed message
//! via `build`, which also resets the internal state for the next
//! logical group.
//!
//! [`ToolsCallBuilder`] enforces the call boundary rules: an incoming
//! fragment starts a new call when its non-null `tool_call_id` or
//! non-null `index` differs from the open call's, and `build` closes any
//! call still open. `function_args` is always the concatenation of the
//! fragments in receipt order.

use crate::message::{
    ImageData, ImageMessage, ImageUpdateMessage, Message, MessageCommon, Metadata,
    ReasoningMessage, ReasoningUpdateMessage, ReasoningVisibility, Role, TextMessage,
    TextUpdateMessage, ToolCall, ToolCallMessage, ToolCallUpdate, ToolsCallMessage,
    ToolsCallUpdateMessage,
};

/// Merges `incoming` metadata into `target`; later keys overwrite.
fn merge_metadata(target: &mut Option<Metadata>, incoming: Option<&Metadata>) {
    if let Some(incoming) = incoming {
        let merged = target.get_or_insert_with(Metadata::new);
        for (key, value) in incoming {
            merged.insert(key.clone(), value.clone());
        }
    }
}

/// Folds an update's common block into the accumulated one.
///
/// Identity fields adopt the first non-null value seen; metadata keys
/// overlay with the latest update winning.
fn fold_common(acc: &mut MessageCommon, update: &MessageCommon) {
    if acc.role == Role::None {
        acc.role = update.role;
    }
    if acc.from_agent.is_none() {
        acc.from_agent.clone_from(&update.from_agent);
    }
    if acc.generation_id.is_none() {
        acc.generation_id.clone_from(&update.generation_id);
    }
    if acc.thread_id.is_none() {
        acc.thread_id.clone_from(&update.thread_id);
    }
    if acc.run_id.is_none() {
        acc.run_id.clone_from(&update.run_id);
    }
    if acc.parent_run_id.is_none() {
        acc.parent_run_id.clone_from(&update.parent_run_id);
    }
    if acc.message_order_idx.is_none() {
        acc.message_order_idx = update.message_order_idx;
    }
    merge_metadata(&mut acc.metadata, update.metadata.as_ref());
}

/// Accumulates text deltas into a completed [`Message::Text`].
#[derive(Debug, Clone, Default)]
pub struct TextBuilder {
    text: String,
    is_thinking: bool,
    common: MessageCommon,
}

impl TextBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a text delta.
    pub fn add(&mut self, update: &TextUpdateMessage) {
        self.text.push_str(&update.text);
        self.is_thinking = update.is_thinking;
        fold_common(&mut self.common, &update.common);
    }

    /// Returns the accumulated text so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns `true` if no deltas have been applied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Produces the completed message and resets the builder.
    pub fn build(&mut self) -> Message {
        let built = TextMessage {
            text: std::mem::take(&mut self.text),
            is_thinking: self.is_thinking,
            common: std::mem::take(&mut self.common),
        };
        self.is_thinking = false;
        Message::Text(built)
    }
}

/// Accumulates reasoning deltas into a completed [`Message::Reasoning`].
#[derive(Debug, Clone, Default)]
pub struct ReasoningBuilder {
    reasoning: String,
    visibility: ReasoningVisibility,
    common: MessageCommon,
}

impl ReasoningBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder with a fixed visibility.
    #[must_use]
    pub fn with_visibility(visibility: ReasoningVisibility) -> Self {
        Self {
            visibility,
            ..Self::default()
        }
    }

    /// Overrides the visibility of the message being built.
    pub const fn set_visibility(&mut self, visibility: ReasoningVisibility) {
        self.visibility = visibility;
    }

    /// Applies a reasoning delta.
    pub fn add(&mut self, update: &ReasoningUpdateMessage) {
        self.reasoning.push_str(&update.reasoning);
        fold_common(&mut self.common, &update.common);
    }

    /// Returns the accumulated reasoning so far.
    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Returns `true` if no deltas have been applied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.reasoning.is_empty()
    }

    /// Produces the completed message and resets the builder.
    pub fn build(&mut self) -> Message {
        let built = ReasoningMessage {
            reasoning: std::mem::take(&mut self.reasoning),
            visibility: self.visibility,
            common: std::mem::take(&mut self.common),
        };
        self.visibility = ReasoningVisibility::default();
        Message::Reasoning(built)
    }
}

/// Accumulates image byte chunks into a completed [`Message::Image`].
///
/// The media type is taken from the first chunk that carries one.
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    chunks: Vec<Vec<u8>>,
    media_type: Option<String>,
    common: MessageCommon,
}

impl ImageBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an image chunk.
    pub fn add(&mut self, update: &ImageUpdateMessage) {
        self.chunks.push(update.bytes.clone());
        if self.media_type.is_none() {
            self.media_type.clone_from(&update.media_type);
        }
        fold_common(&mut self.common, &update.common);
    }

    /// Returns `true` if no chunks have been applied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Produces the completed message and resets the builder.
    pub fn build(&mut self) -> Message {
        let bytes = std::mem::take(&mut self.chunks).concat();
        let built = ImageMessage {
            image_data: ImageData {
                bytes,
                media_type: self.media_type.take().unwrap_or_default(),
            },
            common: std::mem::take(&mut self.common),
        };
        Message::Image(built)
    }
}

/// A tool call still being assembled.
#[derive(Debug, Clone, Default)]
struct OpenCall {
    tool_call_id: Option<String>,
    index: Option<u32>,
    function_name: Option<String>,
    function_args: String,
    execution_target: Option<crate::message::ExecutionTarget>,
}

impl OpenCall {
    fn absorb(&mut self, update: &ToolCallUpdate) {
        if let Some(id) = &update.tool_call_id {
            self.tool_call_id = Some(id.clone());
        }
        if let Some(index) = update.index {
            self.index = Some(index);
        }
        if let Some(name) = &update.function_name {
            self.function_name = Some(name.clone());
        }
        if let Some(args) = &update.function_args {
            self.function_args.push_str(args);
        }
        if let Some(target) = update.execution_target {
            self.execution_target = Some(target);
        }
    }

    fn close(self, tool_call_idx: u32) -> ToolCall {
        ToolCall {
            tool_call_id: self.tool_call_id,
            index: self.index,
            function_name: self.function_name,
            function_args: self.function_args,
            execution_target: self.execution_target.unwrap_or_default(),
            tool_call_idx,
        }
    }
}

/// Assembles streamed tool call fragments into a [`Message::ToolsCall`].
///
/// Calls close when a fragment's non-null `tool_call_id` or non-null
/// `index` differs from the open call's, and on `build`. `tool_call_idx`
/// is assigned sequentially in close order.
#[derive(Debug, Clone, Default)]
pub struct ToolsCallBuilder {
    closed: Vec<ToolCall>,
    open: Option<OpenCall>,
    common: MessageCommon,
}

impl ToolsCallBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a tool call fragment, closing the open call on a boundary.
    pub fn add(&mut self, update: &ToolCallUpdate) {
        if let Some(open) = &self.open
            && Self::is_boundary(open, update)
        {
            self.flush_open();
        }
        self.open.get_or_insert_with(OpenCall::default).absorb(update);
    }

    /// Applies a fragment carried by a message, folding its common block.
    pub fn add_message(&mut self, update: &ToolCallUpdate, common: &MessageCommon) {
        self.add(update);
        fold_common(&mut self.common, common);
    }

    /// Applies every fragment of a batched update message in order,
    /// folding the batch's common block.
    pub fn add_batch(&mut self, batch: &ToolsCallUpdateMessage) {
        for update in &batch.updates {
            self.add(update);
        }
        fold_common(&mut self.common, &batch.common);
    }

    fn is_boundary(open: &OpenCall, update: &ToolCallUpdate) -> bool {
        let id_differs = matches!(
            (&open.tool_call_id, &update.tool_call_id),
            (Some(current), Some(incoming)) if current != incoming
        );
        let index_differs = matches!(
            (open.index, update.index),
            (Some(current), Some(incoming)) if current != incoming
        );
        id_differs || index_differs
    }

    fn flush_open(&mut self) {
        if let Some(open) = self.open.take() {
            let idx = u32::try_from(self.closed.len()).unwrap_or(u32::MAX);
            self.closed.push(open.close(idx));
        }
    }

    /// Number of calls closed so far (excluding the open one).
    #[must_use]
    pub const fn closed_count(&self) -> usize {
        self.closed.len()
    }

    /// Returns `true` if nothing has been applied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.open.is_none()
    }

    /// Flushes the open call and produces the completed batch, resetting
    /// the builder.
    pub fn build(&mut self) -> Message {
        self.flush_open();
        Message::ToolsCall(ToolsCallMessage {
            tool_calls: std::mem::take(&mut self.closed),
            common: std::mem::take(&mut self.common),
        })
    }
}

/// Assembles fragments of a single tool call into a [`Message::ToolCall`].
#[derive(Debug, Clone, Default)]
pub struct ToolCallBuilder {
    open: OpenCall,
    common: MessageCommon,
}

impl ToolCallBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a fragment. Boundary rules do not apply to the single-call
    /// builder; every fragment folds into the one call.
    pub fn add(&mut self, update: &ToolCallUpdate) {
        self.open.absorb(update);
    }

    /// Returns the argument text accumulated so far.
    #[must_use]
    pub fn function_args(&self) -> &str {
        &self.open.function_args
    }

    /// Produces the completed call message and resets the builder.
    pub fn build(&mut self) -> Message {
        let call = std::mem::take(&mut self.open).close(0);
        Message::ToolCall(ToolCallMessage {
            call,
            common: std::mem::take(&mut self.common),
        })
    }
}
