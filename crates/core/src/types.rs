//! Minimal shared types at the `Tool` seam with the (out-of-scope) skills
//! layer, and the context plumbing carried through a sandbox call.

use serde::{Deserialize, Serialize};

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub content: String,
    pub data: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            content: message.into(),
            data: None,
        }
    }
}

/// Tool definition exposed by a `ToolRegistry` (external collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Relative risk of invoking a tool, read by the (out-of-scope) tool-policy
/// layer when deciding whether to require human approval. The sandbox layer
/// does not interpret this value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolRiskLevel {
    Low,
    Medium,
    High,
}

/// Identity carried through a single request: which agent issued it and
/// which session it belongs to. This is the "context plumbing" the scope
/// manager reads to derive a `ScopeKey` (see `multi_agent_sandbox::scope`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// Stable identifier for the agent instance issuing the request.
    pub agent_id: Option<String>,
    /// Session key as seen by the caller, before "main" normalization.
    /// `None`/empty is equivalent to the agent's main session.
    pub session_key: Option<String>,
}

impl RequestContext {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            session_key: None,
        }
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }
}
