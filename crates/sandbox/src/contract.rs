//! The sandbox contract: every leaf (host, container) and the scope manager
//! implement the same `Sandbox` trait, so callers never branch on which
//! backend they're talking to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;

/// A command to run, either as a direct argv or a shell string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    /// If non-empty, argv is `[command, ...args]` with no shell
    /// interposition; otherwise `command` is interpreted as a shell string.
    pub args: Vec<String>,
    /// Resolved against the sandbox's workdir under the no-escape rule
    /// before use.
    pub working_dir: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl ExecRequest {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            timeout_ms: None,
        }
    }

    pub fn argv(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: None,
            timeout_ms: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Derive the argv: `[command, ...args]` verbatim when `args` is
    /// non-empty, otherwise wrapped in a shell.
    pub fn argv_or_shell(&self, shell: &[&str]) -> Vec<String> {
        if !self.args.is_empty() {
            let mut v = vec![self.command.clone()];
            v.extend(self.args.iter().cloned());
            v
        } else {
            let mut v: Vec<String> = shell.iter().map(|s| s.to_string()).collect();
            v.push(self.command.clone());
            v
        }
    }
}

/// Full result of a completed exec. `exit_code` is the process's observed
/// exit; transport/timeout failures are surfaced as `SandboxError`, never as
/// a synthesized non-zero exit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A single chunk of a streamed exec. Chunks are byte-accurate copies,
/// ordered within a stream; no ordering is guaranteed between stdout and
/// stderr.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(i64),
}

/// Callback invoked once per streamed chunk/exit event.
pub type ExecEventSink = Arc<dyn Fn(ExecEvent) + Send + Sync>;

/// Filesystem bridge exposed by a sandbox (`Sandbox::fs`).
#[async_trait]
pub trait Fs: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, path: &str, data: &[u8], mkdir: bool) -> Result<()>;
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;
}

/// One immediate child of a listed directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Every sandbox backend — host, container, and the scope manager that
/// dispatches between cached containers — implements this contract.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Acquire resources expensive to build lazily. Idempotent: a second
    /// call is a no-op if already started, or fails fast with the same
    /// cause if the first call failed (sticky start error).
    async fn start(&self) -> Result<()>;

    /// Release resources and remove persistent traces. Safe to call
    /// multiple times, with or without a prior `start`.
    async fn prune(&self) -> Result<()>;

    /// Run a command to completion, collecting full stdout/stderr.
    async fn exec(&self, req: ExecRequest) -> Result<ExecResult>;

    /// Run a command, invoking `on_event` for every stdout/stderr chunk and
    /// a final `Exit` event. Also returns the aggregated `ExecResult`.
    async fn exec_stream(&self, req: ExecRequest, on_event: ExecEventSink) -> Result<ExecResult>;

    /// The filesystem bridge for this sandbox.
    fn fs(&self) -> Arc<dyn Fs>;
}
