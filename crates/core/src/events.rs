//! Minimal audit-event shape consumed by the (out-of-scope) observability
//! stack. The sandbox leaves accept an optional `Arc<dyn EventEmitter>` and
//! tee lifecycle/exec/fs events to it; this crate defines only the envelope,
//! never a concrete sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Structured event envelope handed to an external `EventEmitter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub actor: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            actor: "system".to_string(),
            payload,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ToolExecStarted,
    ToolExecFinished,
    FsRead,
    FsWrite,
    SandboxCreated,
    SandboxPruned,
    SandboxDrift,
    Other(String),
}

#[derive(Serialize, Deserialize)]
pub struct ToolExecPayload {
    pub tool_name: String,
    pub input: Option<serde_json::Value>,
    pub output: Option<String>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct FsPayload {
    pub path: String,
    pub operation: String,
    pub size_bytes: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
}

/// External sink for audit events. Named by interface only — no concrete
/// implementation (logging/observability backend) lives in this workspace.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: EventEnvelope);
}
