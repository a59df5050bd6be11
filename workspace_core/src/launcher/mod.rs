//! Platform process creation behind one [`ProcessBackend`] trait.
//!
//! The backend is selected at compile time: `fork`/`execve` with an exec-status
//! pipe on Unix, `CreateProcessW`/`CreateProcessAsUserW` on Windows. Both hand
//! back a child whose stdout and stderr can be read without blocking.

use std::fmt;
use std::io;

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use unix::UnixProcess as PlatformProcess;
#[cfg(windows)]
pub use windows::WindowsProcess as PlatformProcess;

use crate::error::LaunchError;
use crate::profile::LaunchPlan;

/// One of the child's output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        })
    }
}

/// Result of one non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Nothing available right now (`EAGAIN`, `EWOULDBLOCK`, `EINTR`).
    WouldBlock,
    /// Write end closed or stream already released.
    Closed,
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    /// The child was reaped elsewhere and its status is lost.
    Unknown,
}

impl ExitStatus {
    /// `0..=255` for a normal exit, `-128 + signal` for a signal, `-1` when unknown.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signal) => -128 + signal,
            ExitStatus::Unknown => -1,
        }
    }

    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }
}

/// Operations the monitor needs from a running child.
pub trait ProcessBackend: Send + fmt::Debug {
    fn pid(&self) -> u32;

    fn read(&mut self, stream: Stream, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Non-blocking liveness check; `Some` once the child has been reaped.
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    /// Blocking wait, used when a running child must be reaped on drop.
    fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Ask the child to stop (SIGTERM, or TerminateProcess on Windows).
    fn terminate(&mut self) -> io::Result<()>;

    fn force_kill(&mut self) -> io::Result<()>;

    /// Close both streams and free launch resources. Called once, at finalize.
    fn release(&mut self);
}

/// Start the child described by `plan`.
///
/// On error no child is left running and every descriptor created for the
/// launch has been closed.
pub fn launch(plan: LaunchPlan) -> Result<PlatformProcess, LaunchError> {
    tracing::debug!(
        program = %plan.invocation.program,
        args = ?plan.invocation.args,
        cwd = ?plan.cwd,
        profile = %plan.kind,
        "launching"
    );
    #[cfg(unix)]
    {
        unix::spawn(&plan)
    }
    #[cfg(windows)]
    {
        windows::spawn(plan)
    }
}
