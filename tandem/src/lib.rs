#![cfg_attr(docsrs, feature(doc_cfg))]
//! Tandem is a multi-turn conversational agent runtime: it accepts
//! fire-and-forget user inputs on a conversation thread, drives
//! streaming agentic runs against an abstract provider backend, fans the
//! resulting message stream out to any number of independent
//! subscribers, and persists the evolving conversation so it can be
//! recovered after restart.
//!
//! The core pieces:
//!
//! - [`message`]: the polymorphic message algebra shared by providers,
//!   middleware, and subscribers, with capability queries per variant.
//! - [`builder`]: streaming builders that reassemble provider deltas
//!   into completed messages.
//! - [`agent`]: the run scheduler ([`agent::MultiTurnAgent`]) and the
//!   shipped run-loop variants (poll-based with local tools, push-based
//!   over a persistent backend, and a bridge-event translator).
//! - [`middleware`] / [`enrich`]: interceptors around the
//!   [`provider::ProviderAgent`] seam, including TTL-cached usage/cost
//!   enrichment.
//! - [`store`]: the narrow conversation persistence interface with
//!   in-memory and SQLite backends.

// Core model
pub mod error;
pub mod message;
pub mod run;
pub mod usage;

// Streaming assembly
pub mod builder;

// Provider seam and interceptors
pub mod enrich;
pub mod middleware;
pub mod options;
pub mod provider;
pub mod tool;

// Persistence
pub mod store;

// Scheduler and run loops
pub mod agent;

pub mod prelude;

pub use error::{AgentError, Result};
pub use message::{Message, Role};
pub use usage::Usage;
