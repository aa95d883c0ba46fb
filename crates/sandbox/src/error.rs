//! Sandbox error type.
//!
//! One error kind per failure mode a caller needs to tell apart: unreachable
//! engine, rejected configuration, missing path/file, policy-denied path,
//! deadline exceeded, context canceled, non-zero setup command, engine
//! transport failure, underlying I/O failure, and invariant violations. A
//! sticky start error latches a kind + message on a sandbox so later calls
//! fail fast with the same cause (see `ContainerSandbox`'s internal start
//! state).

use thiserror::Error;

use crate::contract::ExecResult;

/// Discriminant for the failure modes a caller of the sandbox contract may
/// want to branch on (e.g. retry on `Timeout`, but not on `AccessDenied`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unavailable,
    ConfigurationRejected,
    NotFound,
    AccessDenied,
    Timeout,
    Canceled,
    SetupFailed,
    ExecTransport,
    Io,
    Internal,
}

/// Sandbox-level error. Carries the partial `ExecResult` collected before
/// failure when a process had already started: the caller never loses
/// output a command actually produced.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct SandboxError {
    pub kind: ErrorKind,
    pub message: String,
    pub partial: Option<ExecResult>,
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            partial: None,
        }
    }

    pub fn with_partial(mut self, partial: ExecResult) -> Self {
        self.partial = Some(partial);
        self
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn configuration_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationRejected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn setup_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SetupFailed, message)
    }

    pub fn exec_transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecTransport, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            SandboxError::not_found(e.to_string())
        } else {
            SandboxError::io(e.to_string())
        }
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(e: bollard::errors::Error) -> Self {
        SandboxError::exec_transport(e.to_string())
    }
}
