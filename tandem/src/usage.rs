//! Token usage tracking for provider responses.
//!
//! [`Usage`] is the payload carried by usage messages: token counts, an
//! optional authoritative cost, cached/reasoning detail blocks, and an
//! open-ended set of extra properties that round-trips through
//! serialization untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Detailed breakdown of prompt/input tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTokenDetails {
    /// Cached tokens that were reused (prompt caching).
    #[serde(default)]
    pub cached_tokens: u32,
}

/// Detailed breakdown of completion/output tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTokenDetails {
    /// Reasoning tokens (for reasoning-capable models).
    #[serde(default)]
    pub reasoning_tokens: u32,
}

/// Token usage statistics for a single provider response.
///
/// `extra` captures any provider- or middleware-specific properties
/// (enrichment markers, model name, timing) and is flattened into the
/// serialized form so unknown keys survive a round-trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input/prompt.
    #[serde(default)]
    pub prompt_tokens: u32,

    /// Number of tokens in the output/completion.
    #[serde(default)]
    pub completion_tokens: u32,

    /// Total tokens used (prompt + completion).
    #[serde(default)]
    pub total_tokens: u32,

    /// Authoritative cost in account currency, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,

    /// Detailed breakdown of prompt tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_token_details: Option<InputTokenDetails>,

    /// Detailed breakdown of completion tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_token_details: Option<OutputTokenDetails>,

    /// Additional provider/middleware properties, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Usage {
    /// Create a new usage record; `total_tokens` is derived.
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            ..Self::default()
        }
    }

    /// Create an empty usage record.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Sets the total cost.
    #[must_use]
    pub fn with_cost(mut self, total_cost: f64) -> Self {
        self.total_cost = Some(total_cost);
        self
    }

    /// Sets the cached-token count.
    #[must_use]
    pub fn with_cached(mut self, cached_tokens: u32) -> Self {
        self.input_token_details = Some(InputTokenDetails { cached_tokens });
        self
    }

    /// Sets the reasoning-token count.
    #[must_use]
    pub fn with_reasoning(mut self, reasoning_tokens: u32) -> Self {
        self.output_token_details = Some(OutputTokenDetails { reasoning_tokens });
        self
    }

    /// Sets an extra property.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Returns `true` if no tokens have been recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }

    /// Merge `other` into `self`, preferring `other`'s populated fields.
    ///
    /// Non-zero token counts in `other` override; the total is recomputed
    /// when both prompt and completion are known, otherwise the larger
    /// total wins. Cost and detail blocks fall back to `self` when `other`
    /// does not carry them. `extra` keys overlay with `other` winning.
    /// Merging a record with itself yields the same record.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let prompt_tokens = if other.prompt_tokens != 0 {
            other.prompt_tokens
        } else {
            self.prompt_tokens
        };
        let completion_tokens = if other.completion_tokens != 0 {
            other.completion_tokens
        } else {
            self.completion_tokens
        };
        let total_tokens = if prompt_tokens != 0 && completion_tokens != 0 {
            prompt_tokens + completion_tokens
        } else {
            self.total_tokens.max(other.total_tokens)
        };

        let mut extra = self.extra.clone();
        for (key, value) in &other.extra {
            extra.insert(key.clone(), value.clone());
        }

        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            total_cost: other.total_cost.or(self.total_cost),
            input_token_details: other.input_token_details.or(self.input_token_details),
            output_token_details: other.output_token_details.or(self.output_token_details),
            extra,
        }
    }
}
