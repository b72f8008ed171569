//! Local tool dispatch.
//!
//! The run loops delegate `LocalFunction` tool calls through the narrow
//! [`ToolDispatcher`] seam; [`FunctionRegistry`] is the default
//! implementation, mapping function names to async handlers.
//! `ProviderServer` calls never reach a dispatcher.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::message::{ToolCall, ToolCallResult};

/// Executes tool calls on behalf of a run loop.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Executes one call, mapping any failure into an error-flagged
    /// result. Dispatch itself never fails the run.
    async fn dispatch(&self, call: &ToolCall) -> ToolCallResult;
}

type Handler = Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A name→handler table implementing [`ToolDispatcher`].
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Handler>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async handler under `name`.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Box::new(move |args| Box::pin(handler(args))));
    }

    /// Returns `true` if a handler is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl ToolDispatcher for FunctionRegistry {
    async fn dispatch(&self, call: &ToolCall) -> ToolCallResult {
        let name = call.function_name.clone().unwrap_or_default();
        let base = ToolCallResult {
            tool_call_id: call.tool_call_id.clone(),
            tool_name: Some(name.clone()),
            ..ToolCallResult::default()
        };

        let Some(handler) = self.handlers.get(&name) else {
            return ToolCallResult {
                result: Value::String(format!("unknown tool: {name}")),
                is_error: true,
                error_code: Some("tool_not_found".to_owned()),
                ..base
            };
        };

        let args: Value = if call.function_args.is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&call.function_args) {
                Ok(parsed) => parsed,
                Err(error) => {
                    return ToolCallResult {
                        result: Value::String(format!("malformed arguments: {error}")),
                        is_error: true,
                        error_code: Some("invalid_arguments".to_owned()),
                        ..base
                    };
                }
            }
        };

        debug!(tool = %name, "dispatching tool call");
        match handler(args).await {
            Ok(result) => ToolCallResult { result, ..base },
            Err(error) => ToolCallResult {
                result: Value::String(error.to_string()),
                is_error: true,
                error_code: Some("tool_failed".to_owned()),
                ..base
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::AgentError;

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register("upper", |args: Value| async move {
            let text = args["text"].as_str().unwrap_or_default().to_uppercase();
            Ok(Value::String(text))
        });
        registry.register("boom", |_args| async move {
            Err(AgentError::validation("told you"))
        });
        registry
    }

    #[tokio::test]
    async fn dispatch_runs_the_handler() {
        let registry = registry();
        let call = ToolCall::function("t1", "upper", r#"{"text":"hi"}"#);

        let result = registry.dispatch(&call).await;
        assert!(!result.is_error);
        assert_eq!(result.result, Value::String("HI".to_owned()));
        assert_eq!(result.tool_call_id.as_deref(), Some("t1"));
        assert_eq!(result.tool_name.as_deref(), Some("upper"));
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result() {
        let registry = registry();
        let call = ToolCall::function("t1", "missing", "{}");

        let result = registry.dispatch(&call).await;
        assert!(result.is_error);
        assert_eq!(result.error_code.as_deref(), Some("tool_not_found"));
    }

    #[tokio::test]
    async fn malformed_arguments_yield_error_result() {
        let registry = registry();
        let call = ToolCall::function("t1", "upper", "{not json");

        let result = registry.dispatch(&call).await;
        assert!(result.is_error);
        assert_eq!(result.error_code.as_deref(), Some("invalid_arguments"));
    }

    #[tokio::test]
    async fn handler_failure_is_contained() {
        let registry = registry();
        let call = ToolCall::function("t1", "boom", "{}");

        let result = registry.dispatch(&call).await;
        assert!(result.is_error);
        assert_eq!(result.error_code.as_deref(), Some("tool_failed"));
    }

    #[tokio::test]
    async fn empty_arguments_pass_null() {
        let mut registry = FunctionRegistry::new();
        registry.register("probe", |args: Value| async move {
            Ok(Value::Bool(args.is_null()))
        });

        let call = ToolCall::function("t1", "probe", "");
        let result = registry.dispatch(&call).await;
        assert_eq!(result.result, Value::Bool(true));
    }
}
