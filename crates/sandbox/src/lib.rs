#![deny(unused)]
//! Scoped sandbox execution layer for OpenCoordex.
//!
//! Every command an agent runs and every file it touches is routed through
//! a `Sandbox`: either the host process directly, or a long-lived container
//! reused across calls within the same scope. The `ScopeManager` decides
//! which backend serves a given request and keeps the container registry
//! on disk in sync with what the container engine actually has running.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  Tool (shell / fs adapters)  │
//! │    ↓ ExecRequest / Fs calls  │
//! ├──────────────────────────────┤
//! │  ScopeManager                │
//! │    ↓ routes by SandboxMode   │
//! ├────────────┬─────────────────┤
//! │ HostSandbox│ ContainerSandbox│
//! │ (tokio::   │ (bollard +      │
//! │  process)  │  container      │
//! │            │  registry)      │
//! └────────────┴─────────────────┘
//! ```

pub mod config;
pub mod contract;
pub mod container;
pub mod engine;
pub mod error;
pub mod hash;
pub mod host;
pub mod paths;
pub mod registry;
pub mod scope;
pub mod security;
pub mod tools;

pub use config::{
    BindMount, ResourceLimits, RetentionPolicy, SandboxConfig, SandboxMode, SandboxScope,
    SecurityProfiles, UserSpec, WorkspaceAccess, WorkspaceBinding,
};
pub use contract::{DirEntry, ExecEvent, ExecEventSink, ExecRequest, ExecResult, Fs, Sandbox};
pub use container::ContainerSandbox;
pub use engine::{BollardEngine, ContainerEngine};
pub use error::{ErrorKind, Result, SandboxError};
pub use hash::config_hash;
pub use host::HostSandbox;
pub use registry::{slug_container_name, Registry, RegistryEntry};
pub use scope::ScopeManager;
