//! Request options passed from the run loop down to the provider.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Metadata;

/// Options for a single provider reply, carried through the middleware
/// chain.
///
/// `extra_properties` is the open channel for provider-specific flags
/// (for example the `{"usage": {"include": true}}` entry injected by the
/// usage enrichment middleware).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateReplyOptions {
    /// Model identifier, when the caller overrides the provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Run this request belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Parent run, when continuing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,

    /// Owning conversation thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Provider-specific flags, overlaid key-by-key on merge.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub extra_properties: Metadata,
}

impl GenerateReplyOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the model id.
    #[must_use]
    pub fn model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Sets the max token budget.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets run/thread identity.
    #[must_use]
    pub fn for_run(
        mut self,
        run_id: impl Into<String>,
        thread_id: Option<&str>,
        parent_run_id: Option<&str>,
    ) -> Self {
        self.run_id = Some(run_id.into());
        self.thread_id = thread_id.map(str::to_owned);
        self.parent_run_id = parent_run_id.map(str::to_owned);
        self
    }

    /// Sets an extra property.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_properties.insert(key.into(), value.into());
        self
    }

    /// Returns new options where `other`'s non-null fields override and
    /// `extra_properties` overlay by key (`other` wins).
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut extra_properties = self.extra_properties.clone();
        for (key, value) in &other.extra_properties {
            extra_properties.insert(key.clone(), value.clone());
        }

        Self {
            model_id: other.model_id.clone().or_else(|| self.model_id.clone()),
            max_tokens: other.max_tokens.or(self.max_tokens),
            run_id: other.run_id.clone().or_else(|| self.run_id.clone()),
            parent_run_id: other
                .parent_run_id
                .clone()
                .or_else(|| self.parent_run_id.clone()),
            thread_id: other.thread_id.clone().or_else(|| self.thread_id.clone()),
            extra_properties,
        }
    }
}
