//! Conversation persistence.
//!
//! [`ConversationStore`] is deliberately narrow: append messages, load
//! them back in append order, and read/write per-thread metadata. The
//! runtime never assumes atomicity between an append and a metadata
//! write; recovery tolerates either side missing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{Message, Metadata};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// A message as stored, with an optional idempotency id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMessage {
    /// Idempotency key; appends deduplicate on `(thread_id, message_id)`
    /// when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// The message payload.
    pub message: Message,
}

impl PersistedMessage {
    /// Wraps a message without an idempotency id.
    #[must_use]
    pub const fn new(message: Message) -> Self {
        Self {
            message_id: None,
            message,
        }
    }

    /// Wraps a message with an idempotency id.
    #[must_use]
    pub fn with_id(message_id: impl Into<String>, message: Message) -> Self {
        Self {
            message_id: Some(message_id.into()),
            message,
        }
    }
}

/// Durable per-thread state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    /// The thread this metadata describes.
    pub thread_id: String,

    /// Run currently in progress, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_run_id: Option<String>,

    /// Most recently completed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_run_id: Option<String>,

    /// Last metadata write time.
    pub last_updated: DateTime<Utc>,

    /// Host-defined properties, preserved across completions.
    #[serde(default)]
    pub properties: Metadata,

    /// Backend session mappings (e.g. external thread ids).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_mappings: Option<Metadata>,
}

impl ThreadMetadata {
    /// Creates fresh metadata for a thread, stamped now.
    #[must_use]
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            current_run_id: None,
            latest_run_id: None,
            last_updated: Utc::now(),
            properties: Metadata::new(),
            session_mappings: None,
        }
    }
}

/// Durable storage for conversation threads.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Appends messages to a thread.
    ///
    /// Idempotent on `(thread_id, message_id)` for messages that carry an
    /// id; id-less messages always append.
    async fn append_messages(&self, thread_id: &str, messages: Vec<PersistedMessage>)
    -> Result<()>;

    /// Loads a thread's messages in append order.
    async fn load_messages(&self, thread_id: &str) -> Result<Vec<PersistedMessage>>;

    /// Loads a thread's metadata, if any was saved.
    async fn load_metadata(&self, thread_id: &str) -> Result<Option<ThreadMetadata>>;

    /// Replaces a thread's metadata.
    async fn save_metadata(&self, thread_id: &str, metadata: ThreadMetadata) -> Result<()>;
}
