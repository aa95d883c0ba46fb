//! External collaborator interfaces. The sandbox crate plugs into these
//! seams; none of them are implemented in this workspace — the agent loop,
//! skills registry, and tool policy are named by interface only.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{ToolDefinition, ToolOutput, ToolRiskLevel};

/// Atomic operation the (out-of-scope) agent loop can invoke. The sandbox
/// crate's `tools` module implements this for each sandboxed shell/file
/// operation it exposes.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;

    /// Risk tier used by the (out-of-scope) approval/policy layer. Tools
    /// that can mutate host or container state default to `Medium`.
    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::Medium
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput>;
}

/// Registry the (out-of-scope) skills layer uses to look tools up by name.
/// Declared here only so the sandbox crate's tools can be registered against
/// a uniform contract by an embedding host.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn register(&self, tool: Box<dyn Tool>) -> Result<()>;
    async fn list(&self) -> Result<Vec<ToolDefinition>>;
    async fn execute(&self, name: &str, args: Value) -> Result<ToolOutput>;
}
