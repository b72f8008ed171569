//! In-memory conversation store.
//!
//! [`InMemoryStore`] keeps threads in a `HashMap` behind a
//! `tokio::sync::RwLock`. Data is lost when the value is dropped; best
//! suited for tests and short-lived sessions.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ConversationStore, PersistedMessage, ThreadMetadata};
use crate::error::Result;

#[derive(Debug, Default)]
struct ThreadState {
    messages: Vec<PersistedMessage>,
    seen_ids: HashSet<String>,
    metadata: Option<ThreadMetadata>,
}

/// In-memory [`ConversationStore`] backed by a `RwLock<HashMap>`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    threads: RwLock<HashMap<String, ThreadState>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored for a thread.
    pub async fn message_count(&self, thread_id: &str) -> usize {
        self.threads
            .read()
            .await
            .get(thread_id)
            .map_or(0, |t| t.messages.len())
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn append_messages(
        &self,
        thread_id: &str,
        messages: Vec<PersistedMessage>,
    ) -> Result<()> {
        let mut threads = self.threads.write().await;
        let thread = threads.entry(thread_id.to_owned()).or_default();
        for stored in messages {
            if let Some(id) = &stored.message_id {
                if !thread.seen_ids.insert(id.clone()) {
                    continue;
                }
            }
            thread.messages.push(stored);
        }
        Ok(())
    }

    async fn load_messages(&self, thread_id: &str) -> Result<Vec<PersistedMessage>> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default())
    }

    async fn load_metadata(&self, thread_id: &str) -> Result<Option<ThreadMetadata>> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .and_then(|t| t.metadata.clone()))
    }

    async fn save_metadata(&self, thread_id: &str, metadata: ThreadMetadata) -> Result<()> {
        let mut threads = self.threads.write().await;
        threads.entry(thread_id.to_owned()).or_default().metadata = Some(metadata);
        Ok(())
    }
}
