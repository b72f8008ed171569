//! Run bookkeeping: inputs, receipts, and assignments.
//!
//! A client `send` produces a [`SendReceipt`] immediately; the run loop
//! later drains the queued inputs into a run and correlates them back to
//! their receipts through [`RunAssignment::input_ids`]. Each receipt is
//! assigned to exactly one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;

/// Generates a fresh uniformly random 128-bit identifier.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// A batch of messages submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInput {
    /// The messages to feed into the run.
    pub messages: Vec<Message>,

    /// Caller-supplied correlation id, echoed on the receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_id: Option<String>,

    /// Run to continue from, overriding the scheduler's latest run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
}

impl UserInput {
    /// Create an input from messages.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Create an input from a single user text message.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(vec![Message::user(text)])
    }

    /// Sets the caller correlation id.
    #[must_use]
    pub fn with_input_id(mut self, input_id: impl Into<String>) -> Self {
        self.input_id = Some(input_id.into());
        self
    }

    /// Sets the parent run.
    #[must_use]
    pub fn with_parent_run(mut self, parent_run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }
}

/// An input sitting in the scheduler queue, stamped at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedInput {
    /// The submitted input.
    pub input: UserInput,

    /// Receipt id assigned at enqueue.
    pub receipt_id: String,

    /// Enqueue timestamp.
    pub queued_at: DateTime<Utc>,
}

impl QueuedInput {
    /// Queue an input now, assigning a fresh receipt id.
    #[must_use]
    pub fn enqueue(input: UserInput) -> Self {
        Self {
            input,
            receipt_id: new_id(),
            queued_at: Utc::now(),
        }
    }

    /// The receipt handed back to the caller.
    #[must_use]
    pub fn receipt(&self) -> SendReceipt {
        SendReceipt {
            receipt_id: self.receipt_id.clone(),
            input_id: self.input.input_id.clone(),
            queued_at: self.queued_at,
        }
    }
}

/// The client-side handle returned by `send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Correlates with [`RunAssignment::input_ids`].
    pub receipt_id: String,

    /// Echo of the caller-supplied input id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_id: Option<String>,

    /// When the input was enqueued.
    pub queued_at: DateTime<Utc>,
}

/// Inputs drained into a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAssignment {
    /// The run these inputs belong to.
    pub run_id: String,

    /// The generation the run opens with.
    pub generation_id: String,

    /// Receipt ids of every input drained into this run.
    #[serde(default)]
    pub input_ids: Vec<String>,

    /// Run this one continues from, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,

    /// Whether the inputs were injected into a run already in progress.
    #[serde(default)]
    pub was_injected: bool,
}

impl RunAssignment {
    /// Returns `true` if this assignment covers the given receipt.
    #[must_use]
    pub fn covers(&self, receipt: &SendReceipt) -> bool {
        self.input_ids.iter().any(|id| *id == receipt.receipt_id)
    }
}
