//! Convenience re-exports for the common surface of the runtime.

pub use crate::agent::bridge::BridgeBackend;
pub use crate::agent::poll::PollLoop;
pub use crate::agent::push::{
    BackendEvent, BackendSession, ProcessHost, PushBackend, PushLoop, PushMode,
};
pub use crate::agent::translate::{BridgeEvent, EventTranslator, TranslatorConfig, TurnSignal};
pub use crate::agent::{
    AgentConfig, AgentCore, MultiTurnAgent, RunCompletion, RunContext, RunLoop, Subscription,
};
pub use crate::builder::{
    ImageBuilder, ReasoningBuilder, TextBuilder, ToolCallBuilder, ToolsCallBuilder,
};
pub use crate::enrich::{
    CostLookup, GenerationCost, HttpCostClient, RetryPolicy, UsageCache,
    UsageEnrichmentMiddleware, UsagePolicy,
};
pub use crate::error::{AgentError, Result};
pub use crate::message::{
    ExecutionTarget, Message, MessageCommon, Metadata, ReasoningVisibility, Role, ToolCall,
    ToolCallResult, ToolCallUpdate,
};
pub use crate::middleware::{AgentMiddleware, MiddlewareAgent, MiddlewareContext};
pub use crate::options::GenerateReplyOptions;
pub use crate::provider::{MessageStream, ProviderAgent};
pub use crate::run::{QueuedInput, RunAssignment, SendReceipt, UserInput};
pub use crate::store::memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use crate::store::sqlite::SqliteStore;
pub use crate::store::{ConversationStore, PersistedMessage, ThreadMetadata};
pub use crate::tool::{FunctionRegistry, ToolDispatcher};
pub use crate::usage::Usage;
