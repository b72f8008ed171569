//! Error types for the runtime.
//!
//! Errors are grouped by kind rather than by origin: validation failures
//! fail the offending call, transport failures are retried locally and
//! then degraded, and run-scoped failures never surface as errors to
//! subscribers; they terminate the run with an error-flagged
//! [`RunCompleted`](crate::message::RunCompleted) control message instead.

use thiserror::Error;

/// A type alias for `Result<T, AgentError>`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed input rejected before any work started.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// Recoverable network failure (cost endpoint, backend transport).
    #[error("transport error: {message}")]
    Transport {
        /// The underlying error message.
        message: String,
    },

    /// Unrecoverable backend failure (process exit, broken pipe).
    #[error("backend error: {message}")]
    Backend {
        /// The underlying error message.
        message: String,
    },

    /// Persistence failure. Logged and tolerated by the run loop.
    #[error("store error: {message}")]
    Store {
        /// The underlying error message.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("json error: {message}")]
    Json {
        /// The underlying error message.
        message: String,
    },

    /// The operation was cancelled by the ambient cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A run loop is already active for this agent.
    #[error("run loop already running")]
    AlreadyRunning,

    /// The agent has been disposed; no further operations are accepted.
    #[error("agent disposed")]
    Disposed,

    /// The input queue has been closed.
    #[error("input queue closed")]
    QueueClosed,
}

impl AgentError {
    /// Create a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a new store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is worth a local retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}
