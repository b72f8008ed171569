//! Translator for bridge protocols that emit JSON event envelopes.
//!
//! Some backends speak an event protocol (`thread.started`,
//! `item.started|updated|completed`, `turn.completed`, …) instead of the
//! message algebra. [`EventTranslator`] consumes those envelopes and
//! produces algebra messages: snapshot-or-delta text handling for agent
//! output, reasoning summaries, tool call/result pairs, and a usage
//! message at turn end. `message_order_idx` is allocated per logical
//! item key, reused across that item's updates, and released when the
//! item completes.
//!
//! The translator is transport-agnostic: a push backend feeds it parsed
//! [`BridgeEvent`]s and forwards the resulting
//! [`BackendEvent`](super::push::BackendEvent)s.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::push::BackendEvent;
use crate::message::{
    Message, MessageCommon, ReasoningVisibility, Role, ToolCall, ToolCallMessage, ToolCallResult,
    ToolCallResultMessage, UsageMessage,
};
use crate::usage::Usage;

/// An item embedded in `item.*` events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeItem {
    /// Stable item identifier, shared across its updates.
    #[serde(default)]
    pub id: String,

    /// Item discriminator (`agent_message`, `reasoning`, `mcp_tool_call`,
    /// `command_execution`, …).
    #[serde(rename = "type")]
    pub item_type: String,

    /// Current text (snapshot or delta, provider-dependent).
    #[serde(default)]
    pub text: Option<String>,

    /// Tool name, for tool-call items.
    #[serde(default)]
    pub name: Option<String>,

    /// Tool arguments, for tool-call items.
    #[serde(default)]
    pub arguments: Option<Value>,

    /// Tool result, for completed tool-call items.
    #[serde(default)]
    pub result: Option<Value>,

    /// Completion status (`completed`, `failed`, …).
    #[serde(default)]
    pub status: Option<String>,

    /// Human-readable summary, for activity items.
    #[serde(default)]
    pub summary: Option<String>,
}

/// Token usage as reported by the bridge.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct BridgeUsage {
    /// Prompt/input tokens.
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: u32,

    /// Completion/output tokens.
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: u32,

    /// Total tokens.
    #[serde(default)]
    pub total_tokens: u32,

    /// Cost, when the bridge reports one.
    #[serde(default)]
    pub total_cost: Option<f64>,
}

impl BridgeUsage {
    fn to_usage(self) -> Usage {
        let mut usage = Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: if self.total_tokens > 0 {
                self.total_tokens
            } else {
                self.prompt_tokens + self.completion_tokens
            },
            ..Usage::default()
        };
        usage.total_cost = self.total_cost;
        usage
    }
}

/// A JSON event envelope from the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeEvent {
    /// The backend opened its conversation thread.
    #[serde(rename = "thread.started")]
    ThreadStarted {
        /// The backend's own thread identifier.
        thread_id: String,
    },

    /// An item started streaming.
    #[serde(rename = "item.started")]
    ItemStarted {
        /// The item payload.
        item: BridgeItem,
    },

    /// An in-flight item produced more content.
    #[serde(rename = "item.updated")]
    ItemUpdated {
        /// The item payload.
        item: BridgeItem,
    },

    /// An item finished.
    #[serde(rename = "item.completed")]
    ItemCompleted {
        /// The item payload.
        item: BridgeItem,
    },

    /// The turn finished normally.
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        /// Turn identifier, when the bridge scopes usage by turn.
        #[serde(default)]
        turn_id: Option<String>,

        /// Usage embedded directly in the event.
        #[serde(default)]
        usage: Option<BridgeUsage>,
    },

    /// The turn failed.
    #[serde(rename = "turn.failed")]
    TurnFailed {
        /// Failure description.
        #[serde(default)]
        error: Option<String>,
    },

    /// A protocol-level error.
    #[serde(rename = "error")]
    Error {
        /// Error description.
        #[serde(default)]
        message: String,
    },

    /// Out-of-band token usage update, cached per turn.
    #[serde(rename = "thread/tokenUsage/updated")]
    TokenUsageUpdated {
        /// Turn the usage belongs to.
        #[serde(default)]
        turn_id: Option<String>,

        /// The usage payload.
        usage: BridgeUsage,
    },
}

/// Terminal signal extracted from an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnSignal {
    /// The turn completed normally.
    Completed,
    /// The turn failed; the run should complete with `is_error`.
    Failed(String),
}

/// The product of translating one event.
#[derive(Debug, Default)]
pub struct Translation {
    /// Messages to publish, in order.
    pub messages: Vec<Message>,

    /// Turn boundary signal, when the event carries one.
    pub signal: Option<TurnSignal>,
}

impl Translation {
    fn messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            signal: None,
        }
    }

    /// Adapts the translation into push-loop backend events.
    #[must_use]
    pub fn into_backend_events(self) -> Vec<BackendEvent> {
        let mut events: Vec<BackendEvent> =
            self.messages.into_iter().map(BackendEvent::Message).collect();
        match self.signal {
            Some(TurnSignal::Completed) => events.push(BackendEvent::TurnCompleted),
            Some(TurnSignal::Failed(reason)) => events.push(BackendEvent::TurnFailed(reason)),
            None => {}
        }
        events
    }
}

/// Translator configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslatorConfig {
    /// Emit activity items (`command_execution`, `file_change`,
    /// `todo_list`, `web_search`) as synthesized provider-server tool
    /// call/result pairs instead of reasoning summaries.
    pub synthesize_activity_tool_calls: bool,
}

/// Allocates order indices per logical item key.
#[derive(Debug, Default)]
struct OrderRegistry {
    next: u64,
    open: HashMap<String, u64>,
}

impl OrderRegistry {
    fn index_for(&mut self, key: &str) -> u64 {
        if let Some(idx) = self.open.get(key) {
            return *idx;
        }
        let idx = self.next;
        self.next += 1;
        self.open.insert(key.to_owned(), idx);
        idx
    }

    fn release(&mut self, key: &str) -> Option<u64> {
        self.open.remove(key)
    }
}

/// Stateful bridge-event → message translator.
#[derive(Debug, Default)]
pub struct EventTranslator {
    config: TranslatorConfig,
    order: OrderRegistry,
    accumulated: HashMap<String, String>,
    external_thread_id: Option<String>,
    turn_usage: HashMap<String, Usage>,
    last_turn_usage: Option<Usage>,
}

impl EventTranslator {
    /// Creates a translator with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a translator with the given configuration.
    #[must_use]
    pub fn with_config(config: TranslatorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// The backend's own thread id, once `thread.started` was seen.
    ///
    /// Hosts record this into the thread's session mappings.
    #[must_use]
    pub fn external_thread_id(&self) -> Option<&str> {
        self.external_thread_id.as_deref()
    }

    /// Translates one event into messages and an optional turn signal.
    pub fn translate(&mut self, event: BridgeEvent) -> Translation {
        match event {
            BridgeEvent::ThreadStarted { thread_id } => {
                debug!(%thread_id, "bridge thread started");
                self.external_thread_id = Some(thread_id);
                Translation::default()
            }
            BridgeEvent::ItemStarted { item } | BridgeEvent::ItemUpdated { item } => {
                Translation::messages(self.item_progress(&item))
            }
            BridgeEvent::ItemCompleted { item } => {
                Translation::messages(self.item_completed(&item))
            }
            BridgeEvent::TurnCompleted { turn_id, usage } => {
                let usage = usage.map(BridgeUsage::to_usage).or_else(|| {
                    turn_id
                        .as_ref()
                        .and_then(|id| self.turn_usage.remove(id))
                        .or_else(|| self.last_turn_usage.take())
                });
                let messages = usage
                    .map(|usage| {
                        vec![Message::Usage(UsageMessage {
                            usage,
                            common: MessageCommon::default(),
                        })]
                    })
                    .unwrap_or_default();
                Translation {
                    messages,
                    signal: Some(TurnSignal::Completed),
                }
            }
            BridgeEvent::TurnFailed { error } => Translation {
                messages: Vec::new(),
                signal: Some(TurnSignal::Failed(
                    error.unwrap_or_else(|| "turn failed".to_owned()),
                )),
            },
            BridgeEvent::Error { message } => Translation {
                messages: Vec::new(),
                signal: Some(TurnSignal::Failed(message)),
            },
            BridgeEvent::TokenUsageUpdated { turn_id, usage } => {
                let usage = usage.to_usage();
                if let Some(turn_id) = turn_id {
                    self.turn_usage.insert(turn_id, usage.clone());
                }
                self.last_turn_usage = Some(usage);
                Translation::default()
            }
        }
    }

    /// Handles `item.started` / `item.updated`.
    fn item_progress(&mut self, item: &BridgeItem) -> Vec<Message> {
        match item.item_type.as_str() {
            "agent_message" => {
                let key = format!("agent:{}", item.id);
                let idx = self.order.index_for(&key);
                self.text_delta(&key, item)
                    .map(|delta| vec![Message::text_update(delta).with_order_idx(idx)])
                    .unwrap_or_default()
            }
            "reasoning" => {
                let key = format!("reasoning:{}", item.id);
                let idx = self.order.index_for(&key);
                self.text_delta(&key, item)
                    .map(|delta| vec![Message::reasoning_update(delta).with_order_idx(idx)])
                    .unwrap_or_default()
            }
            "mcp_tool_call" | "tool_call" | "dynamic_tool_call" => {
                let key = format!("tool:{}", item.id);
                // Emit the call once, on start.
                if self.accumulated.contains_key(&key) {
                    return Vec::new();
                }
                self.accumulated.insert(key.clone(), String::new());
                let idx = self.order.index_for(&key);
                vec![
                    Message::ToolCall(ToolCallMessage {
                        call: tool_call_from_item(item),
                        common: MessageCommon::with_role(Role::Assistant),
                    })
                    .with_order_idx(idx),
                ]
            }
            _ => Vec::new(),
        }
    }

    /// Handles `item.completed`.
    fn item_completed(&mut self, item: &BridgeItem) -> Vec<Message> {
        match item.item_type.as_str() {
            "agent_message" => {
                let key = format!("agent:{}", item.id);
                let idx = self.order.index_for(&key);
                let mut messages = Vec::new();
                if let Some(tail) = self.text_delta(&key, item) {
                    messages.push(Message::text_update(tail).with_order_idx(idx));
                }
                let full = self.accumulated.remove(&key).unwrap_or_default();
                messages.push(Message::assistant(full).with_order_idx(idx));
                self.order.release(&key);
                messages
            }
            "reasoning" => {
                let key = format!("reasoning:{}", item.id);
                let idx = self.order.index_for(&key);
                let mut messages = Vec::new();
                if let Some(tail) = self.text_delta(&key, item) {
                    messages.push(Message::reasoning_update(tail).with_order_idx(idx));
                }
                let full = self.accumulated.remove(&key).unwrap_or_default();
                messages.push(
                    Message::reasoning(full, ReasoningVisibility::Summary).with_order_idx(idx),
                );
                self.order.release(&key);
                messages
            }
            "mcp_tool_call" | "tool_call" | "dynamic_tool_call" => {
                let key = format!("tool:{}", item.id);
                let idx = self.order.index_for(&key);
                self.accumulated.remove(&key);
                self.order.release(&key);

                let failed = item.status.as_deref() == Some("failed");
                vec![
                    Message::ToolCallResult(ToolCallResultMessage {
                        result: ToolCallResult {
                            tool_call_id: Some(item.id.clone()),
                            tool_name: item.name.clone(),
                            result: item.result.clone().unwrap_or(Value::Null),
                            is_error: failed,
                            error_code: failed.then(|| "mcp_tool_failed".to_owned()),
                        },
                        common: MessageCommon::with_role(Role::Tool),
                    })
                    .with_order_idx(idx),
                ]
            }
            "command_execution" | "file_change" | "todo_list" | "web_search" => {
                self.activity_completed(item)
            }
            other => {
                debug!(item_type = other, "ignoring unknown bridge item");
                Vec::new()
            }
        }
    }

    /// Activity items surface either as a reasoning summary or as a
    /// synthesized provider-server tool call/result pair.
    fn activity_completed(&mut self, item: &BridgeItem) -> Vec<Message> {
        let key = format!("activity:{}", item.id);
        let idx = self.order.index_for(&key);
        self.order.release(&key);

        let summary = item
            .summary
            .clone()
            .or_else(|| item.text.clone())
            .unwrap_or_else(|| item.item_type.clone());

        if self.config.synthesize_activity_tool_calls {
            let mut call = tool_call_from_item(item);
            call.function_name = Some(item.item_type.clone());
            call.execution_target = crate::message::ExecutionTarget::ProviderServer;

            return vec![
                Message::ToolCall(ToolCallMessage {
                    call,
                    common: MessageCommon::with_role(Role::Assistant),
                })
                .with_order_idx(idx),
                Message::ToolCallResult(ToolCallResultMessage {
                    result: ToolCallResult {
                        tool_call_id: Some(item.id.clone()),
                        tool_name: Some(item.item_type.clone()),
                        result: item.result.clone().unwrap_or(Value::String(summary)),
                        is_error: item.status.as_deref() == Some("failed"),
                        error_code: None,
                    },
                    common: MessageCommon::with_role(Role::Tool),
                })
                .with_order_idx(idx),
            ];
        }

        vec![Message::reasoning(summary, ReasoningVisibility::Summary).with_order_idx(idx)]
    }

    /// Computes the outgoing delta for an item's current text.
    ///
    /// Snapshot providers resend the full text each time: when the
    /// current text extends the accumulated prefix, only the suffix is
    /// emitted. Pure-delta providers send fresh fragments: anything that
    /// does not extend the prefix is emitted whole and appended.
    fn text_delta(&mut self, key: &str, item: &BridgeItem) -> Option<String> {
        let current = item.text.as_deref().unwrap_or_default();
        let accumulated = self.accumulated.entry(key.to_owned()).or_default();

        let delta = if let Some(suffix) = current.strip_prefix(accumulated.as_str()) {
            let suffix = suffix.to_owned();
            *accumulated = current.to_owned();
            suffix
        } else {
            accumulated.push_str(current);
            current.to_owned()
        };

        (!delta.is_empty()).then_some(delta)
    }
}

fn tool_call_from_item(item: &BridgeItem) -> ToolCall {
    ToolCall {
        tool_call_id: Some(item.id.clone()),
        index: None,
        function_name: item.name.clone(),
        function_args: item
            .arguments
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
        execution_target: crate::message::ExecutionTarget::ProviderServer,
        tool_call_idx: 0,
    }
}
