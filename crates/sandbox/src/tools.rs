//! `Tool` adapters wiring shell execution and file I/O through the scoped
//! sandbox instead of directly touching the host.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use multi_agent_core::{traits::Tool, types::ToolRiskLevel, Error, RequestContext, Result, ToolOutput};

use crate::contract::ExecRequest;
use crate::error::SandboxError;
use crate::scope::ScopeManager;

fn sandbox_err(e: SandboxError) -> Error {
    Error::tool_execution(e.to_string())
}

fn not_allowed(tool_name: &str) -> Error {
    Error::invalid_request(format!("{} is not in the sandbox's tool allow-list", tool_name))
}

/// Runs a shell command inside the scope's sandbox.
pub struct SandboxShellTool {
    scope: Arc<ScopeManager>,
    ctx: RequestContext,
}

impl SandboxShellTool {
    pub fn new(scope: Arc<ScopeManager>, ctx: RequestContext) -> Self {
        Self { scope, ctx }
    }
}

#[async_trait]
impl Tool for SandboxShellTool {
    fn name(&self) -> &str {
        "sandbox_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the agent's sandbox. The sandbox may be \
         the host process or an isolated container depending on configuration."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 30, max: 300)",
                    "default": 30
                }
            },
            "required": ["command"]
        })
    }

    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::High
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        if !self.scope.is_tool_sandboxed(self.name()) {
            return Err(not_allowed(self.name()));
        }

        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid_request("command is required"))?;

        let timeout_secs = args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(30)
            .min(300);

        let sandbox = self.scope.get_or_create(&self.ctx).await.map_err(sandbox_err)?;
        let req = ExecRequest::shell(command).with_timeout_ms(timeout_secs * 1000);

        match sandbox.exec(req).await {
            Ok(result) => {
                let mut output = String::new();
                if !result.stdout.is_empty() {
                    output.push_str(&result.stdout_string());
                }
                if !result.stderr.is_empty() {
                    if !output.is_empty() {
                        output.push_str("\n--- stderr ---\n");
                    }
                    output.push_str(&result.stderr_string());
                }
                if output.is_empty() {
                    output = format!("Command completed with exit code {}", result.exit_code);
                }

                let data = json!({ "exit_code": result.exit_code });
                if result.success() {
                    Ok(ToolOutput::text(output).with_data(data))
                } else {
                    Ok(ToolOutput::error(format!(
                        "Command failed (exit code {}):\n{}",
                        result.exit_code, output
                    ))
                    .with_data(data))
                }
            }
            Err(e) if e.partial.is_some() => {
                let partial = e.partial.as_ref().unwrap();
                Ok(ToolOutput::error(format!(
                    "{}\nPartial stdout:\n{}\nPartial stderr:\n{}",
                    e,
                    partial.stdout_string(),
                    partial.stderr_string()
                )))
            }
            Err(e) => Err(sandbox_err(e)),
        }
    }
}

/// Writes a file into the scope's sandbox workspace.
pub struct SandboxWriteFileTool {
    scope: Arc<ScopeManager>,
    ctx: RequestContext,
}

impl SandboxWriteFileTool {
    pub fn new(scope: Arc<ScopeManager>, ctx: RequestContext) -> Self {
        Self { scope, ctx }
    }
}

#[async_trait]
impl Tool for SandboxWriteFileTool {
    fn name(&self) -> &str {
        "sandbox_write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the sandbox workspace. Path is relative \
         to the sandbox's working directory and may not escape it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the sandbox workspace"
                },
                "content": {
                    "type": "string",
                    "description": "The file content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::Medium
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        if !self.scope.is_tool_sandboxed(self.name()) {
            return Err(not_allowed(self.name()));
        }

        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid_request("path is required"))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid_request("content is required"))?;

        let sandbox = self.scope.get_or_create(&self.ctx).await.map_err(sandbox_err)?;
        sandbox
            .fs()
            .write_file(path, content.as_bytes(), true)
            .await
            .map_err(sandbox_err)?;

        Ok(ToolOutput::text(format!("File written: {} ({} bytes)", path, content.len())))
    }
}

/// Reads a file from the scope's sandbox workspace.
pub struct SandboxReadFileTool {
    scope: Arc<ScopeManager>,
    ctx: RequestContext,
}

impl SandboxReadFileTool {
    pub fn new(scope: Arc<ScopeManager>, ctx: RequestContext) -> Self {
        Self { scope, ctx }
    }
}

#[async_trait]
impl Tool for SandboxReadFileTool {
    fn name(&self) -> &str {
        "sandbox_read_file"
    }

    fn description(&self) -> &str {
        "Read the content of a file from the sandbox workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the sandbox workspace"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        if !self.scope.is_tool_sandboxed(self.name()) {
            return Err(not_allowed(self.name()));
        }

        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid_request("path is required"))?;

        let sandbox = self.scope.get_or_create(&self.ctx).await.map_err(sandbox_err)?;
        let bytes = sandbox.fs().read_file(path).await.map_err(sandbox_err)?;

        Ok(ToolOutput::text(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Lists the immediate children of a directory in the sandbox workspace.
pub struct SandboxListFilesTool {
    scope: Arc<ScopeManager>,
    ctx: RequestContext,
}

impl SandboxListFilesTool {
    pub fn new(scope: Arc<ScopeManager>, ctx: RequestContext) -> Self {
        Self { scope, ctx }
    }
}

#[async_trait]
impl Tool for SandboxListFilesTool {
    fn name(&self) -> &str {
        "sandbox_list_files"
    }

    fn description(&self) -> &str {
        "List files and directories directly under a path in the sandbox workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the sandbox workspace (default: '.')",
                    "default": "."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        if !self.scope.is_tool_sandboxed(self.name()) {
            return Err(not_allowed(self.name()));
        }

        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");

        let sandbox = self.scope.get_or_create(&self.ctx).await.map_err(sandbox_err)?;
        let entries = sandbox.fs().read_dir(path).await.map_err(sandbox_err)?;

        let listing = entries
            .iter()
            .map(|e| if e.is_dir { format!("{}/", e.name) } else { e.name.clone() })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutput::text(listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::engine::mock::MockEngine;
    use crate::registry::Registry;

    fn host_scope(workdir: &std::path::Path) -> Arc<ScopeManager> {
        let mut config = SandboxConfig::default();
        config.workdir = workdir.to_string_lossy().into_owned();
        config.sandboxed_tools = vec![
            "sandbox_shell".to_string(),
            "sandbox_write_file".to_string(),
            "sandbox_read_file".to_string(),
            "sandbox_list_files".to_string(),
        ];
        Arc::new(ScopeManager::new(
            config,
            Arc::new(MockEngine::default()),
            Arc::new(Registry::at(std::env::temp_dir())),
        ))
    }

    #[tokio::test]
    async fn shell_tool_runs_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let scope = host_scope(dir.path());
        let tool = SandboxShellTool::new(scope, RequestContext::new("agent-1"));

        let result = tool.execute(json!({"command": "echo hello sandbox"})).await.unwrap();
        assert!(result.success);
        assert!(result.content.contains("hello sandbox"));
    }

    #[tokio::test]
    async fn shell_tool_reports_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let scope = host_scope(dir.path());
        let tool = SandboxShellTool::new(scope, RequestContext::new("agent-1"));

        let result = tool.execute(json!({"command": "exit 3"})).await.unwrap();
        assert!(!result.success);
        assert!(result.content.contains("exit code 3"));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let scope = host_scope(dir.path());
        let write_tool = SandboxWriteFileTool::new(scope.clone(), RequestContext::new("agent-1"));
        let read_tool = SandboxReadFileTool::new(scope, RequestContext::new("agent-1"));

        let w = write_tool
            .execute(json!({"path": "notes/todo.txt", "content": "buy milk"}))
            .await
            .unwrap();
        assert!(w.success);

        let r = read_tool.execute(json!({"path": "notes/todo.txt"})).await.unwrap();
        assert_eq!(r.content, "buy milk");
    }

    #[tokio::test]
    async fn write_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let scope = host_scope(dir.path());
        let tool = SandboxWriteFileTool::new(scope, RequestContext::new("agent-1"));

        let result = tool
            .execute(json!({"path": "../../etc/passwd", "content": "evil"}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_files_shows_written_entries() {
        let dir = tempfile::tempdir().unwrap();
        let scope = host_scope(dir.path());
        let write_tool = SandboxWriteFileTool::new(scope.clone(), RequestContext::new("agent-1"));
        let list_tool = SandboxListFilesTool::new(scope, RequestContext::new("agent-1"));

        write_tool
            .execute(json!({"path": "a.txt", "content": "x"}))
            .await
            .unwrap();

        let listing = list_tool.execute(json!({"path": "."})).await.unwrap();
        assert!(listing.content.contains("a.txt"));
    }

    #[tokio::test]
    async fn empty_allow_list_denies_every_tool() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.workdir = dir.path().to_string_lossy().into_owned();
        let scope = Arc::new(ScopeManager::new(
            config,
            Arc::new(MockEngine::default()),
            Arc::new(Registry::at(std::env::temp_dir())),
        ));

        let tool = SandboxShellTool::new(scope, RequestContext::new("agent-1"));
        let result = tool.execute(json!({"command": "echo hi"})).await;
        assert!(result.is_err());
    }
}
