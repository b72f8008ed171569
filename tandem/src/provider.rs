//! The provider seam: anything that can turn conversation history into a
//! reply stream.
//!
//! Concrete wire formats (OpenAI, Anthropic, CLI bridges, …) live behind
//! [`ProviderAgent`]; the runtime only consumes the message stream.
//! Cancellation is ambient: dropping the stream or the pending future
//! abandons the request.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt as _, stream};

use crate::error::Result;
use crate::message::Message;
use crate::options::GenerateReplyOptions;

/// A boxed asynchronous stream of reply messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// An agent backed by an LLM provider.
#[async_trait]
pub trait ProviderAgent: Send + Sync {
    /// Generate a complete reply for the given history.
    ///
    /// The default implementation collects the streaming form.
    async fn generate_reply(
        &self,
        messages: Vec<Message>,
        options: &GenerateReplyOptions,
    ) -> Result<Vec<Message>> {
        let mut stream = self.generate_reply_streaming(messages, options).await?;
        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            collected.push(item?);
        }
        Ok(collected)
    }

    /// Generate a reply as a stream of messages (deltas included).
    async fn generate_reply_streaming(
        &self,
        messages: Vec<Message>,
        options: &GenerateReplyOptions,
    ) -> Result<MessageStream>;

    /// Name of this agent, for logging.
    fn name(&self) -> &str;
}

pub mod mock {
    //! Scripted provider for testing: returns predefined message
    //! sequences in order, one per call, cycling when exhausted.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{
        GenerateReplyOptions, Message, MessageStream, ProviderAgent, Result, async_trait, stream,
    };

    /// A scripted [`ProviderAgent`] for tests.
    ///
    /// Each call pops the next scripted reply; when the script is
    /// exhausted the replies cycle. Received requests are recorded for
    /// assertion.
    #[derive(Debug, Default)]
    pub struct MockAgent {
        name: String,
        replies: Vec<Vec<Message>>,
        cursor: AtomicUsize,
        requests: Mutex<Vec<(Vec<Message>, GenerateReplyOptions)>>,
    }

    impl MockAgent {
        /// Create a mock that replies with the given scripted sequences.
        #[must_use]
        pub fn new(replies: Vec<Vec<Message>>) -> Self {
            Self {
                name: "mock".to_owned(),
                replies,
                cursor: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Create a mock that replies with one fixed sequence.
        #[must_use]
        pub fn with_reply(reply: Vec<Message>) -> Self {
            Self::new(vec![reply])
        }

        /// Sets a custom agent name.
        #[must_use]
        pub fn named(mut self, name: impl Into<String>) -> Self {
            self.name = name.into();
            self
        }

        /// Number of calls observed so far.
        #[must_use]
        pub fn call_count(&self) -> usize {
            self.cursor.load(Ordering::SeqCst)
        }

        /// The recorded `(messages, options)` of every call.
        #[must_use]
        pub fn requests(&self) -> Vec<(Vec<Message>, GenerateReplyOptions)> {
            self.requests
                .lock()
                .map(|guard| guard.clone())
                .unwrap_or_default()
        }

        fn next_reply(&self) -> Vec<Message> {
            let index = self.cursor.fetch_add(1, Ordering::SeqCst);
            if self.replies.is_empty() {
                return Vec::new();
            }
            self.replies[index % self.replies.len()].clone()
        }
    }

    #[async_trait]
    impl ProviderAgent for MockAgent {
        async fn generate_reply_streaming(
            &self,
            messages: Vec<Message>,
            options: &GenerateReplyOptions,
        ) -> Result<MessageStream> {
            if let Ok(mut guard) = self.requests.lock() {
                guard.push((messages, options.clone()));
            }
            let reply = self.next_reply();
            Ok(Box::pin(stream::iter(reply.into_iter().map(Ok))))
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::mock::MockAgent;
    use super::*;

    #[tokio::test]
    async fn mock_replies_in_sequence_then_cycles() {
        let agent = MockAgent::new(vec![
            vec![Message::assistant("first")],
            vec![Message::assistant("second")],
        ]);
        let options = GenerateReplyOptions::new();

        for expected in ["first", "second", "first"] {
            let reply = agent.generate_reply(Vec::new(), &options).await.unwrap();
            assert_eq!(reply[0].text(), Some(expected.to_owned()));
        }
        assert_eq!(agent.call_count(), 3);
    }

    #[tokio::test]
    async fn default_unary_collects_the_stream() {
        let agent = MockAgent::with_reply(vec![
            Message::text_update("Hi"),
            Message::text_update(" there"),
            Message::assistant("Hi there"),
        ]);

        let reply = agent
            .generate_reply(Vec::new(), &GenerateReplyOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.len(), 3);
        assert_eq!(reply[2].text(), Some("Hi there".to_owned()));
    }

    #[tokio::test]
    async fn requests_are_recorded() {
        let agent = MockAgent::with_reply(vec![]);
        let options = GenerateReplyOptions::new().model_id("m-1");
        let _ = agent
            .generate_reply(vec![Message::user("q")], &options)
            .await
            .unwrap();

        let requests = agent.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0[0].text(), Some("q".to_owned()));
        assert_eq!(requests[0].1.model_id.as_deref(), Some("m-1"));
    }
}
