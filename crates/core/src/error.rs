//! Shared error type for the sandbox execution layer.
//!
//! The variants mirror the error kinds a caller of the sandbox contract is
//! expected to distinguish between (see sandbox `SandboxError` for the
//! sandbox-specific superset); this crate only carries the generic shape
//! needed by the `Tool` seam shared with the (out-of-scope) skills layer.

use thiserror::Error;

/// Result type alias using the shared `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Generic error type shared across the sandbox contract boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound(name.into())
    }

    pub fn tool_execution(msg: impl Into<String>) -> Self {
        Self::ToolExecution(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
