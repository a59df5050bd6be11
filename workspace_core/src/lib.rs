//! # Workspace Core
//!
//! Runs untrusted command lines inside a per-workspace sandbox and streams their
//! output back without blocking.
//!
//! ## Pipeline
//!
//! Every launch goes through the same steps, in order:
//!
//! 1. **Guard**: a heuristic pre-flight check rejects obvious network use
//!    (`curl`, `ssh`, inline `import socket`, ...) when the policy forbids it.
//! 2. **Build**: the command becomes a concrete program and argv, wrapped in the
//!    host shell when given as shell text.
//! 3. **Isolate**: the policy becomes a platform profile. Linux uses a
//!    bubblewrap namespace jail, macOS a Seatbelt profile, Windows an AppContainer
//!    with a restricted token. When the sandbox cannot be set up the command runs
//!    unsandboxed with a warning, unless the engine is configured to refuse.
//! 4. **Launch**: `fork`/`execve` with an exec-status pipe, so a missing binary
//!    or bad working directory fails synchronously with the OS error.
//! 5. **Monitor**: stdout and stderr are drained without blocking, the child is
//!    reaped exactly once, and timeouts escalate from a graceful to a forced kill.
//!
//! ## Entry points
//!
//! - [`Engine`] for async callers: `run` collects a [`CommandResult`].
//! - [`bridge`] for polling callers: start, read, check, kill, free.
//! - [`ffi`] exposes the bridge as a C ABI (`include/workspace_core.h`).
//!
//! ## Modules
//!
//! - **`command`**: shell/direct command construction and tokenizing.
//! - **`guard`**: network-use heuristics.
//! - **`policy`** / **`config`**: per-launch policy and engine-wide settings.
//! - **`profile`**: sandbox profiles and the Landlock self-restriction fallback.
//! - **`launcher`**: platform process creation.
//! - **`handle`** / **`monitor`**: lifecycle state and the polling loop.
//! - **`prerequisites`**: sandbox availability probes.

pub mod bridge;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod guard;
pub mod handle;
pub mod launcher;
pub mod monitor;
pub mod policy;
pub mod prerequisites;
pub mod profile;
pub mod utils;

pub use command::{CommandBuilder, CommandSpec, Invocation};
pub use config::{EngineConfig, FallbackMode};
pub use engine::{Engine, RunOptions};
pub use error::{LaunchError, Result, WorkspaceError};
pub use guard::{GuardMode, GuardViolation, SecurityGuard};
pub use handle::{ProcessHandle, ProcessState};
pub use launcher::{ExitStatus, ReadOutcome, Stream};
pub use monitor::{CommandResult, ProcessMonitor};
pub use policy::ExecutionPolicy;
pub use profile::{ProfileKind, SandboxProfile, SandboxProfileBuilder};
