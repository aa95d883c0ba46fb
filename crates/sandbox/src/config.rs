//! Sandbox configuration. Immutable after construction: every field feeds
//! the config hash that decides container reuse vs rebuild.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the per-scope workspace is bound into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceAccess {
    /// Read-only bind of the shared workspace.
    ReadOnly,
    /// Read-write bind of the shared workspace.
    ReadWrite,
    /// No shared bind — a fresh per-scope directory under the workspace
    /// root is created and bound read-write instead.
    Isolated,
}

/// Binding of a host workspace directory into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceBinding {
    /// Absolute host source path. Ignored when `access == Isolated`, in
    /// which case a per-scope directory under `workspace_root` is used.
    pub source: Option<String>,
    pub access: WorkspaceAccess,
}

impl Default for WorkspaceBinding {
    fn default() -> Self {
        Self {
            source: None,
            access: WorkspaceAccess::ReadWrite,
        }
    }
}

/// User-supplied additional bind mount, validated by `security::validate_bind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// uid:gid the container runs and writes as.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UserSpec {
    pub uid: u32,
    pub gid: u32,
}

impl Default for UserSpec {
    fn default() -> Self {
        Self { uid: 1000, gid: 1000 }
    }
}

impl UserSpec {
    pub fn as_docker_user(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }
}

/// Resource ceilings applied to the container's host config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub pids_limit: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub memory_swap_bytes: Option<i64>,
    pub cpus: Option<f64>,
    /// `(name, soft, hard)` ulimits, e.g. `("nofile", 1024, 2048)`.
    pub ulimits: Vec<(String, i64, i64)>,
}

/// Kernel security profiles forwarded to the engine, not authored here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityProfiles {
    pub seccomp: Option<String>,
    pub apparmor: Option<String>,
}

/// Idle/age based eviction policy, read by the scope manager's pruning loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub idle_hours: i64,
    pub max_age_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            idle_hours: 0,
            max_age_days: 0,
        }
    }
}

impl RetentionPolicy {
    /// Whether the pruning loop should run at all.
    pub fn enabled(&self) -> bool {
        self.idle_hours > 0 || self.max_age_days > 0
    }
}

/// Routing mode for the scope manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Every request is served by the host sandbox.
    Off,
    /// Every request is routed to a container.
    All,
    /// Only sessions that aren't the agent's main session are routed to a
    /// container. Until session-key propagation is guaranteed system-wide
    /// this is implemented as an alias of `Off`.
    NonMain,
}

/// Unit that shares one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxScope {
    Shared,
    Agent,
    Session,
}

impl Default for SandboxScope {
    fn default() -> Self {
        SandboxScope::Agent
    }
}

/// Immutable sandbox configuration. Drives the config hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub image: String,
    pub container_prefix: String,
    pub workdir: String,
    pub workspace: WorkspaceBinding,
    pub workspace_root: String,
    /// `(mount_point, size_opt)` pairs. A `Vec`, not a map: tmpfs ordering
    /// feeds the config hash the same way binds/DNS ordering does (§8).
    pub tmpfs: Vec<(String, String)>,
    pub network_mode: String,
    pub user: UserSpec,
    pub cap_drop: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub setup_command: Option<String>,
    pub limits: ResourceLimits,
    pub security: SecurityProfiles,
    pub dns: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub binds: Vec<BindMount>,
    pub retention: RetentionPolicy,
    pub mode: SandboxMode,
    pub scope: SandboxScope,
    /// Tool names permitted to run sandboxed. Empty denies every tool: a
    /// sandbox with no explicit allow-list is a sandbox nothing can use yet.
    pub sandboxed_tools: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "opencoordex-sandbox:latest".to_string(),
            container_prefix: "opencoordex-".to_string(),
            workdir: "/workspace".to_string(),
            workspace: WorkspaceBinding::default(),
            workspace_root: "/var/lib/opencoordex/workspaces".to_string(),
            tmpfs: Vec::new(),
            network_mode: "none".to_string(),
            user: UserSpec::default(),
            cap_drop: vec!["ALL".to_string()],
            env: BTreeMap::new(),
            setup_command: None,
            limits: ResourceLimits::default(),
            security: SecurityProfiles::default(),
            dns: Vec::new(),
            extra_hosts: Vec::new(),
            binds: Vec::new(),
            retention: RetentionPolicy::default(),
            mode: SandboxMode::Off,
            scope: SandboxScope::default(),
            sandboxed_tools: Vec::new(),
        }
    }
}
