#![deny(unused)]
//! Shared error, event, and context-plumbing types for the sandbox execution
//! layer.
//!
//! This crate is intentionally thin: the sandbox subsystem is the product of
//! this workspace, and everything else an agent host would need — logging,
//! configuration parsing, the agent loop, LLM providers, memory/history
//! storage, and channel adapters — is out of scope and represented here only
//! as the interface the sandbox plugs into (`traits::Tool`,
//! `events::EventEmitter`).

pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use events::{EventEmitter, EventEnvelope, EventType, FsPayload, ToolExecPayload};
pub use traits::{Tool, ToolRegistry};
pub use types::{RequestContext, ToolDefinition, ToolOutput, ToolRiskLevel};
