use std::path::PathBuf;

use crate::guard::GuardViolation;

/// Errors raised while turning an execution request into a running process.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Command rejected by security policy: {0}")]
    PolicyViolation(#[from] GuardViolation),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Sandbox is unavailable on this host: {0}")]
    SandboxUnavailable(String),

    #[error("Invalid execution policy: {0}")]
    InvalidPolicy(String),

    #[error("Failed to load configuration '{path:?}': {reason}")]
    Config { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the process launcher itself.
///
/// `Spawn` is the only variant a caller should expect during normal operation:
/// it means the child was created but its `execve` (or `chdir`) failed, and the
/// child has already been reaped.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create {what} pipe: {source}")]
    Pipe {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create child process: {0}")]
    Fork(#[source] std::io::Error),

    #[error("Argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),
}

impl LaunchError {
    /// True when the OS reported that the executable does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LaunchError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

pub type Result<T, E = WorkspaceError> = std::result::Result<T, E>;
