//! Cooperative polling of one child: drain, check liveness, back off, escalate.
//!
//! Each [`ProcessMonitor::tick`] drains stdout and then stderr until they would
//! block, asks the handle whether the child is still alive, and enforces the
//! timeout. The async driver [`ProcessMonitor::run`] repeats ticks, yielding after
//! a productive tick and sleeping for the poll interval after an idle one.
//!
//! Timeouts escalate in two steps: a graceful kill when the deadline passes,
//! then a forced kill once the grace window has elapsed without an exit.

use std::borrow::Cow;
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::handle::{ProcessHandle, ProcessState};
use crate::launcher::{ExitStatus, ReadOutcome, Stream};

/// Callback receiving output chunks as they are read, in per-stream order.
pub type OutputSink = Box<dyn FnMut(Stream, &[u8]) + Send>;

/// Outcome of one monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Data was read; tick again right away.
    Progress,
    /// Nothing happened; back off before the next tick.
    Idle,
    /// The child exited and the handle is finalized.
    Finished,
}

/// Everything known about a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status: ExitStatus,
    /// Encoded exit code, see [`ExitStatus::code`].
    pub exit_code: i32,
    /// Collected output. Empty when a sink consumed it instead.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    /// Killed on request or because the timeout expired.
    pub cancelled: bool,
    pub timed_out: bool,
    pub sandboxed: bool,
    pub sandbox_fallback: Option<String>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success() && !self.cancelled
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

pub struct ProcessMonitor {
    handle: ProcessHandle,
    buf: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    sink: Option<OutputSink>,
    events: Option<mpsc::UnboundedSender<ProcessState>>,
    last_state: Option<ProcessState>,
    poll_interval: Duration,
    kill_grace: Duration,
    term_sent_at: Option<Instant>,
    timed_out: bool,
    cancelled: bool,
}

impl fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("handle", &self.handle)
            .field("stdout_len", &self.stdout.len())
            .field("stderr_len", &self.stderr.len())
            .field("timed_out", &self.timed_out)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl ProcessMonitor {
    pub fn new(handle: ProcessHandle, config: &EngineConfig) -> Self {
        Self {
            handle,
            buf: vec![0u8; config.read_buffer_size.max(1)],
            stdout: Vec::new(),
            stderr: Vec::new(),
            sink: None,
            events: None,
            last_state: None,
            poll_interval: config.poll_interval,
            kill_grace: config.kill_grace,
            term_sent_at: None,
            timed_out: false,
            cancelled: false,
        }
    }

    /// Stream output to `sink` instead of collecting it.
    pub fn with_sink(mut self, sink: OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Publish lifecycle changes on `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ProcessState>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ProcessHandle {
        &mut self.handle
    }

    /// Ask the child to stop; a forced kill follows after the grace window.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            tracing::info!(pid = self.handle.pid(), "cancelling command");
        }
        self.cancelled = true;
        self.begin_termination(Instant::now());
        self.publish();
    }

    /// One non-blocking monitoring step.
    pub fn tick(&mut self) -> Tick {
        let progressed = self.drain(Stream::Stdout) | self.drain(Stream::Stderr);

        if self.handle.is_running() {
            self.enforce_deadline(Instant::now());
            self.publish();
            return if progressed { Tick::Progress } else { Tick::Idle };
        }

        // Finalization moved the last buffered bytes into the handle.
        self.drain(Stream::Stdout);
        self.drain(Stream::Stderr);
        self.publish();
        Tick::Finished
    }

    /// Drive the child to completion.
    pub async fn run(mut self, cancel: &CancellationToken) -> CommandResult {
        self.publish();
        loop {
            if cancel.is_cancelled() && !self.cancelled {
                self.cancel();
            }
            match self.tick() {
                Tick::Finished => break,
                Tick::Progress => tokio::task::yield_now().await,
                Tick::Idle => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled(), if !self.cancelled => {}
                    }
                }
            }
        }
        self.into_result()
    }

    /// Result of a finished command. Call after [`Tick::Finished`].
    pub fn into_result(mut self) -> CommandResult {
        let status = self.handle.exit_status().unwrap_or(ExitStatus::Unknown);
        CommandResult {
            status,
            exit_code: status.code(),
            stdout: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
            duration: self.handle.started_at().elapsed(),
            cancelled: self.cancelled || self.timed_out || self.handle.kill_requested(),
            timed_out: self.timed_out,
            sandboxed: self.handle.is_sandboxed(),
            sandbox_fallback: self.handle.sandbox_fallback().map(str::to_string),
        }
    }

    /// Read `stream` until it would block. Returns whether anything was read.
    fn drain(&mut self, stream: Stream) -> bool {
        let mut progressed = false;
        loop {
            match self.handle.read(stream, &mut self.buf) {
                ReadOutcome::Data(n) => {
                    progressed = true;
                    let chunk = &self.buf[..n];
                    match self.sink.as_mut() {
                        Some(sink) => sink(stream, chunk),
                        None => match stream {
                            Stream::Stdout => self.stdout.extend_from_slice(chunk),
                            Stream::Stderr => self.stderr.extend_from_slice(chunk),
                        },
                    }
                }
                ReadOutcome::WouldBlock | ReadOutcome::Closed => return progressed,
            }
        }
    }

    fn enforce_deadline(&mut self, now: Instant) {
        if !self.timed_out
            && let Some(deadline) = self.handle.deadline()
            && now >= deadline
        {
            self.timed_out = true;
            tracing::warn!(pid = self.handle.pid(), "command timed out");
            self.begin_termination(now);
        }
        if let Some(sent) = self.term_sent_at
            && now.duration_since(sent) >= self.kill_grace
        {
            self.handle.force_kill();
        }
    }

    fn begin_termination(&mut self, now: Instant) {
        if self.term_sent_at.is_none() {
            self.handle.kill();
            self.term_sent_at = Some(now);
        }
    }

    fn publish(&mut self) {
        let state = self.handle.state();
        if self.last_state == Some(state) {
            return;
        }
        self.last_state = Some(state);
        if let Some(events) = &self.events
            && events.send(state).is_err()
        {
            self.events = None;
        }
    }
}
