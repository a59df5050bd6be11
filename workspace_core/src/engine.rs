//! Orchestration: guard, build, isolate, launch, monitor.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandBuilder, CommandSpec};
use crate::config::{EngineConfig, FallbackMode};
use crate::error::{Result, WorkspaceError};
use crate::guard::SecurityGuard;
use crate::handle::{ProcessHandle, ProcessState};
use crate::launcher;
use crate::monitor::{CommandResult, OutputSink, ProcessMonitor};
use crate::policy::ExecutionPolicy;
use crate::profile::{LaunchPlan, SandboxProfile, SandboxProfileBuilder};

/// Entry point for running commands under an [`ExecutionPolicy`].
///
/// An engine holds no per-command state and can be shared between tasks.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    builder: CommandBuilder,
    guard: SecurityGuard,
    profiles: SandboxProfileBuilder,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            builder: CommandBuilder::default(),
            guard: SecurityGuard::new(config.guard_mode),
            profiles: SandboxProfileBuilder::new(&config),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve `spec` under `policy` into a launch plan without starting anything.
    ///
    /// The guard runs first, so a rejected command never reaches the profile
    /// builder. A sandbox that cannot be set up falls back to the host, or is
    /// refused under [`FallbackMode::Deny`].
    pub fn prepare(&self, spec: &CommandSpec, policy: &ExecutionPolicy) -> Result<LaunchPlan> {
        policy.validate()?;
        self.guard.check(&spec.inspection_text(), policy)?;
        let invocation = self.builder.build(spec)?;

        let (profile, fallback) = match self.profiles.build(policy) {
            Ok(profile) => (profile, None),
            Err(WorkspaceError::SandboxUnavailable(reason))
                if self.config.fallback_mode == FallbackMode::Unsandboxed =>
            {
                tracing::warn!(
                    workspace = %policy.workspace_id,
                    "sandbox unavailable ({reason}); running unsandboxed"
                );
                (SandboxProfile::Host, Some(reason))
            }
            Err(e) => return Err(e),
        };

        let mut plan = profile.into_plan(invocation, policy);
        plan.fallback = fallback;
        Ok(plan)
    }

    /// Start `spec` and return its handle without waiting for it.
    pub fn start(&self, spec: &CommandSpec, policy: &ExecutionPolicy) -> Result<ProcessHandle> {
        let plan = self.prepare(spec, policy)?;
        let kind = plan.kind;
        let fallback = plan.fallback.clone();
        let process = launcher::launch(plan)?;
        let handle = ProcessHandle::new(process, policy.timeout, kind, fallback);
        tracing::info!(
            pid = handle.pid(),
            workspace = %policy.workspace_id,
            profile = %kind,
            "command started"
        );
        Ok(handle)
    }

    /// Monitor for a started handle, configured like this engine.
    pub fn monitor(&self, handle: ProcessHandle) -> ProcessMonitor {
        ProcessMonitor::new(handle, &self.config)
    }

    /// Run `spec` to completion and collect its output.
    pub async fn run(&self, spec: &CommandSpec, policy: &ExecutionPolicy) -> Result<CommandResult> {
        self.run_with(spec, policy, RunOptions::default()).await
    }

    /// Run with cancellation, lifecycle events and optional streaming.
    pub async fn run_with(
        &self,
        spec: &CommandSpec,
        policy: &ExecutionPolicy,
        options: RunOptions,
    ) -> Result<CommandResult> {
        let handle = match self.start(spec, policy) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(events) = &options.events {
                    let _ = events.send(ProcessState::Failed);
                }
                return Err(e);
            }
        };
        let mut monitor = self.monitor(handle);
        if let Some(events) = options.events {
            monitor = monitor.with_events(events);
        }
        if let Some(sink) = options.sink {
            monitor = monitor.with_sink(sink);
        }
        let cancel = options.cancel.unwrap_or_default();
        let result = monitor.run(&cancel).await;
        tracing::info!(
            exit_code = result.exit_code,
            cancelled = result.cancelled,
            duration_ms = result.duration.as_millis() as u64,
            "command finished"
        );
        Ok(result)
    }
}

/// Optional extras for [`Engine::run_with`].
#[derive(Default)]
pub struct RunOptions {
    pub cancel: Option<CancellationToken>,
    pub events: Option<mpsc::UnboundedSender<ProcessState>>,
    pub sink: Option<OutputSink>,
}

impl RunOptions {
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn events(mut self, events: mpsc::UnboundedSender<ProcessState>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn sink(mut self, sink: OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }
}
