//! Handle-based API for embedders that poll instead of awaiting.
//!
//! Start a command, then alternate `read_stdout`/`read_stderr` with `is_running`
//! until it reports `false`, drain once more, and `free` the handle. Reads never
//! block. The return value is the number of bytes read, `0` once the stream is
//! closed and drained, or [`READ_RETRY`] when no data is ready yet.
//!
//! All bridge calls share one process-wide [`Engine`] configured from
//! [`EngineConfig::from_env`].

use std::path::PathBuf;
use std::sync::LazyLock;

use crate::command::CommandSpec;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::handle::ProcessHandle;
use crate::launcher::ReadOutcome;
use crate::policy::ExecutionPolicy;

/// Transient condition; try the read again later.
pub const READ_RETRY: isize = -1;

static ENGINE: LazyLock<Engine> = LazyLock::new(|| Engine::new(EngineConfig::from_env()));

/// What a bridge caller can ask for. Mirrors the C options struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRequest {
    /// Shell-mode command text.
    pub command_line: String,
    /// Workspace root and working directory; the process's cwd when `None`.
    pub cwd: Option<PathBuf>,
    pub sandbox: bool,
    pub workspace_id: String,
    pub allow_network: bool,
}

impl BridgeRequest {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            cwd: None,
            sandbox: false,
            workspace_id: "default".to_string(),
            allow_network: true,
        }
    }

    fn policy(&self) -> ExecutionPolicy {
        let root = self
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        ExecutionPolicy::new(self.workspace_id.clone(), root)
            .sandboxed(self.sandbox)
            .allow_network(self.allow_network)
    }
}

/// Start a command. `None` when it was rejected or could not be started; the
/// reason is logged.
pub fn start(request: &BridgeRequest) -> Option<ProcessHandle> {
    match ENGINE.start(&CommandSpec::shell(&request.command_line), &request.policy()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(command = %request.command_line, "start failed: {e}");
            None
        }
    }
}

pub fn read_stdout(handle: &mut ProcessHandle, buf: &mut [u8]) -> isize {
    encode(handle.read_stdout(buf))
}

pub fn read_stderr(handle: &mut ProcessHandle, buf: &mut [u8]) -> isize {
    encode(handle.read_stderr(buf))
}

/// Whether the child is still running. On `false`, `exit_code` receives the
/// encoded exit code.
pub fn is_running(handle: &mut ProcessHandle, exit_code: &mut i32) -> bool {
    if handle.is_running() {
        return true;
    }
    *exit_code = handle.exit_code().unwrap_or(-1);
    false
}

/// Graceful termination request; idempotent.
pub fn kill(handle: &mut ProcessHandle) {
    handle.kill();
}

/// Release the handle, killing and reaping a child that is still running.
pub fn free(handle: ProcessHandle) {
    handle.free();
}

fn encode(outcome: ReadOutcome) -> isize {
    match outcome {
        ReadOutcome::Data(n) => n as isize,
        ReadOutcome::WouldBlock => READ_RETRY,
        ReadOutcome::Closed => 0,
    }
}
