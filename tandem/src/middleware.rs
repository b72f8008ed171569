//! Middleware composition around a [`ProviderAgent`].
//!
//! A middleware intercepts the unary and streaming reply paths. Chains
//! compose by wrapping: [`MiddlewareAgent`] pairs one middleware with an
//! inner agent and is itself a [`ProviderAgent`], so the innermost
//! terminal of any chain is the real provider adapter.
//!
//! Streaming middlewares must yield every inner message through
//! unchanged unless they explicitly replace it, and must not reorder
//! messages within a run.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;
use crate::options::GenerateReplyOptions;
use crate::provider::{MessageStream, ProviderAgent};

/// The request a middleware sees: history plus reply options.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareContext {
    /// Conversation history for the request.
    pub messages: Vec<Message>,

    /// Reply options, including `extra_properties` flags.
    pub options: GenerateReplyOptions,
}

impl MiddlewareContext {
    /// Creates a context.
    #[must_use]
    pub fn new(messages: Vec<Message>, options: GenerateReplyOptions) -> Self {
        Self { messages, options }
    }
}

/// An interceptor around a provider agent.
///
/// Both methods default to delegating unchanged, so a middleware only
/// overrides the path it cares about.
#[async_trait]
pub trait AgentMiddleware: Send + Sync {
    /// Intercept the unary reply path.
    async fn invoke(
        &self,
        ctx: MiddlewareContext,
        next: &dyn ProviderAgent,
    ) -> Result<Vec<Message>> {
        next.generate_reply(ctx.messages, &ctx.options).await
    }

    /// Intercept the streaming reply path.
    async fn invoke_streaming(
        &self,
        ctx: MiddlewareContext,
        next: &dyn ProviderAgent,
    ) -> Result<MessageStream> {
        next.generate_reply_streaming(ctx.messages, &ctx.options)
            .await
    }

    /// Name of this middleware, for logging.
    fn name(&self) -> &str {
        "middleware"
    }
}

/// A middleware wrapped around an inner agent.
#[derive(Clone)]
pub struct MiddlewareAgent {
    middleware: Arc<dyn AgentMiddleware>,
    inner: Arc<dyn ProviderAgent>,
    name: String,
}

impl MiddlewareAgent {
    /// Wraps `inner` with `middleware`.
    #[must_use]
    pub fn new(middleware: Arc<dyn AgentMiddleware>, inner: Arc<dyn ProviderAgent>) -> Self {
        let name = format!("{}<{}>", middleware.name(), inner.name());
        Self {
            middleware,
            inner,
            name,
        }
    }

    /// Wraps `terminal` with `middlewares`; the first element becomes the
    /// outermost interceptor.
    #[must_use]
    pub fn chain(
        middlewares: Vec<Arc<dyn AgentMiddleware>>,
        terminal: Arc<dyn ProviderAgent>,
    ) -> Arc<dyn ProviderAgent> {
        middlewares
            .into_iter()
            .rev()
            .fold(terminal, |inner, middleware| {
                Arc::new(Self::new(middleware, inner))
            })
    }
}

impl std::fmt::Debug for MiddlewareAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareAgent")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderAgent for MiddlewareAgent {
    async fn generate_reply(
        &self,
        messages: Vec<Message>,
        options: &GenerateReplyOptions,
    ) -> Result<Vec<Message>> {
        let ctx = MiddlewareContext::new(messages, options.clone());
        self.middleware.invoke(ctx, self.inner.as_ref()).await
    }

    async fn generate_reply_streaming(
        &self,
        messages: Vec<Message>,
        options: &GenerateReplyOptions,
    ) -> Result<MessageStream> {
        let ctx = MiddlewareContext::new(messages, options.clone());
        self.middleware
            .invoke_streaming(ctx, self.inner.as_ref())
            .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
