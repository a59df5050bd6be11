//! The running child and its lifecycle state.
//!
//! A [`ProcessHandle`] is finalized exactly once, at the first observation that
//! the child has exited. Finalization drains whatever is still buffered in the
//! pipes into memory, caches the exit code, closes both descriptors and releases
//! the launch resources. Reads after that are served from the in-memory tail and
//! then report EOF, so a caller polling `is_running` and `read_*` never loses data.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::launcher::{ExitStatus, PlatformProcess, ProcessBackend, ReadOutcome, Stream};
use crate::profile::ProfileKind;

/// Lifecycle events, as observed by the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The child is running.
    Started,
    /// Graceful termination was requested and the child has not exited yet.
    Terminating,
    Stopped(ExitStatus),
    /// The command never started. Only reported on event channels.
    Failed,
}

#[derive(Debug, Default)]
struct Tail {
    bytes: VecDeque<u8>,
}

impl Tail {
    fn take(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(self.bytes.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    process: PlatformProcess,
    pid: u32,
    exit: Option<ExitStatus>,
    stdout_tail: Tail,
    stderr_tail: Tail,
    kill_requested: bool,
    force_killed: bool,
    started: Instant,
    deadline: Option<Instant>,
    kind: ProfileKind,
    fallback: Option<String>,
}

impl ProcessHandle {
    pub(crate) fn new(
        process: PlatformProcess,
        timeout: Option<Duration>,
        kind: ProfileKind,
        fallback: Option<String>,
    ) -> Self {
        let started = Instant::now();
        Self {
            pid: process.pid(),
            process,
            exit: None,
            stdout_tail: Tail::default(),
            stderr_tail: Tail::default(),
            kill_requested: false,
            force_killed: false,
            started,
            deadline: timeout.map(|t| started + t),
            kind,
            fallback,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Isolation the child actually runs under.
    pub fn profile_kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn is_sandboxed(&self) -> bool {
        self.kind.is_sandboxed()
    }

    /// Why a sandboxed request ran unsandboxed, if it did.
    pub fn sandbox_fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    /// Monotonic deadline computed once at launch.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_finalized(&self) -> bool {
        self.exit.is_some()
    }

    /// Cached exit status once finalized.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Encoded exit code once finalized.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.map(ExitStatus::code)
    }

    /// True once [`ProcessHandle::kill`] has been called.
    pub fn kill_requested(&self) -> bool {
        self.kill_requested
    }

    pub fn state(&self) -> ProcessState {
        match self.exit {
            Some(status) => ProcessState::Stopped(status),
            None if self.kill_requested => ProcessState::Terminating,
            None => ProcessState::Started,
        }
    }

    pub fn read_stdout(&mut self, buf: &mut [u8]) -> ReadOutcome {
        self.read(Stream::Stdout, buf)
    }

    pub fn read_stderr(&mut self, buf: &mut [u8]) -> ReadOutcome {
        self.read(Stream::Stderr, buf)
    }

    /// Non-blocking read from one stream.
    pub fn read(&mut self, stream: Stream, buf: &mut [u8]) -> ReadOutcome {
        if buf.is_empty() {
            return ReadOutcome::WouldBlock;
        }
        if self.is_finalized() {
            let tail = match stream {
                Stream::Stdout => &mut self.stdout_tail,
                Stream::Stderr => &mut self.stderr_tail,
            };
            return match tail.take(buf) {
                0 => ReadOutcome::Closed,
                n => ReadOutcome::Data(n),
            };
        }
        match self.process.read(stream, buf) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::debug!(pid = self.pid, %stream, "read failed: {e}");
                ReadOutcome::Closed
            }
        }
    }

    /// Non-blocking liveness check. Finalizes the handle on the first call that
    /// observes the exit.
    pub fn is_running(&mut self) -> bool {
        if self.is_finalized() {
            return false;
        }
        match self.process.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.finalize(status);
                false
            }
            Err(e) => {
                tracing::warn!(pid = self.pid, "lost track of child: {e}");
                self.finalize(ExitStatus::Unknown);
                false
            }
        }
    }

    /// Request graceful termination. Repeated calls and calls after exit do nothing.
    pub fn kill(&mut self) {
        if self.is_finalized() || self.kill_requested {
            return;
        }
        self.kill_requested = true;
        tracing::debug!(pid = self.pid, "requesting graceful termination");
        if let Err(e) = self.process.terminate() {
            tracing::warn!(pid = self.pid, "graceful termination failed: {e}");
        }
    }

    /// Forced termination, used after the grace window of a timeout.
    pub fn force_kill(&mut self) {
        if self.is_finalized() || self.force_killed {
            return;
        }
        self.kill_requested = true;
        self.force_killed = true;
        tracing::warn!(pid = self.pid, "forcing termination");
        if let Err(e) = self.process.force_kill() {
            tracing::warn!(pid = self.pid, "forced termination failed: {e}");
        }
    }

    /// Release the handle. A child still running is killed and reaped.
    pub fn free(self) {
        drop(self);
    }

    fn finalize(&mut self, status: ExitStatus) {
        if self.is_finalized() {
            return;
        }
        self.drain_into_tail(Stream::Stdout);
        self.drain_into_tail(Stream::Stderr);
        self.process.release();
        self.exit = Some(status);
        tracing::debug!(
            pid = self.pid,
            exit_code = status.code(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "child finalized"
        );
    }

    /// Move everything currently readable into memory. Stops at would-block so
    /// a grandchild holding the pipe open cannot stall finalization.
    fn drain_into_tail(&mut self, stream: Stream) {
        let mut buf = [0u8; 8192];
        loop {
            match self.process.read(stream, &mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    let tail = match stream {
                        Stream::Stdout => &mut self.stdout_tail,
                        Stream::Stderr => &mut self.stderr_tail,
                    };
                    tail.bytes.extend(&buf[..n]);
                }
                Ok(ReadOutcome::WouldBlock | ReadOutcome::Closed) | Err(_) => break,
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_finalized() {
            return;
        }
        if let Ok(Some(status)) = self.process.try_wait() {
            self.finalize(status);
            return;
        }
        tracing::debug!(pid = self.pid, "handle dropped while child is running; killing");
        let _ = self.process.force_kill();
        let status = self.process.wait().unwrap_or(ExitStatus::Unknown);
        self.finalize(status);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::Invocation;
    use crate::launcher::launch;
    use crate::profile::LaunchPlan;

    fn start(script: &str) -> ProcessHandle {
        let plan = LaunchPlan {
            invocation: Invocation::new("/bin/sh", vec!["-c".to_string(), script.to_string()]),
            env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
            cwd: None,
            kind: ProfileKind::Host,
            fallback: None,
        };
        ProcessHandle::new(launch(plan).unwrap(), None, ProfileKind::Host, None)
    }

    fn wait_exit(handle: &mut ProcessHandle) {
        while handle.is_running() {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn output_left_in_pipe_survives_finalization() {
        let mut handle = start("echo buffered");
        wait_exit(&mut handle);
        assert_eq!(handle.exit_code(), Some(0));

        let mut buf = [0u8; 64];
        assert_eq!(handle.read_stdout(&mut buf), ReadOutcome::Data(9));
        assert_eq!(&buf[..9], b"buffered\n");
        assert_eq!(handle.read_stdout(&mut buf), ReadOutcome::Closed);
        assert_eq!(handle.read_stderr(&mut buf), ReadOutcome::Closed);
    }

    #[test]
    fn kill_is_idempotent_and_finalizes_once() {
        let mut handle = start("sleep 30");
        assert_eq!(handle.state(), ProcessState::Started);
        handle.kill();
        handle.kill();
        assert_eq!(handle.state(), ProcessState::Terminating);
        wait_exit(&mut handle);
        assert_eq!(handle.exit_code(), Some(-128 + libc::SIGTERM));
        handle.kill();
        assert!(!handle.is_running());
        assert_eq!(handle.exit_code(), Some(-128 + libc::SIGTERM));
    }

    #[test]
    fn tail_is_served_in_caller_sized_chunks() {
        let mut handle = start("printf abcdef");
        wait_exit(&mut handle);
        let mut buf = [0u8; 4];
        assert_eq!(handle.read_stdout(&mut buf), ReadOutcome::Data(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(handle.read_stdout(&mut buf), ReadOutcome::Data(2));
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn drop_reaps_running_child() {
        let handle = start("sleep 30");
        let pid = handle.pid() as libc::pid_t;
        handle.free();
        // SAFETY: probing with signal 0 has no effect on any process.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "child {pid} still exists after free");
    }
}
