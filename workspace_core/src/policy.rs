//! Execution policy handed to the engine for a single launch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WorkspaceError};
use crate::utils::duration;

/// What the caller allows a single command to do.
///
/// A policy is immutable once handed to [`crate::Engine`]; the builder methods
/// consume and return `self` so a policy reads top to bottom at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    /// Run inside the platform sandbox.
    pub sandbox: bool,
    /// Permit network access from the command.
    pub allow_network: bool,
    /// Wall-clock limit, measured from launch.
    #[serde(with = "duration::option", rename = "timeout_ms")]
    pub timeout: Option<Duration>,
    /// Working directory override. Relative paths resolve against the workspace root.
    pub working_directory: Option<PathBuf>,
    /// Extra environment entries; they always win over inherited values.
    pub env: BTreeMap<String, String>,
    /// Inherit the parent's environment (outside the Linux sandbox, which uses an allow-list).
    pub include_parent_env: bool,
    /// Logical workspace identifier, used to key per-workspace isolation profiles.
    pub workspace_id: String,
    /// Host directory the command may write to.
    pub workspace_root: PathBuf,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            sandbox: false,
            allow_network: true,
            timeout: None,
            working_directory: None,
            env: BTreeMap::new(),
            include_parent_env: true,
            workspace_id: "default".to_string(),
            workspace_root: PathBuf::from("."),
        }
    }
}

impl ExecutionPolicy {
    /// Policy rooted at `workspace_root`, unsandboxed and with network allowed.
    pub fn new(workspace_id: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            workspace_root: workspace_root.into(),
            ..Self::default()
        }
    }

    pub fn sandboxed(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn allow_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn include_parent_env(mut self, include: bool) -> Self {
        self.include_parent_env = include;
        self
    }

    /// Directory the unsandboxed child should `chdir` into.
    pub fn effective_cwd(&self) -> PathBuf {
        match &self.working_directory {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.workspace_root.join(dir),
            None => self.workspace_root.clone(),
        }
    }

    /// Reject policies that cannot be launched at all.
    pub fn validate(&self) -> Result<()> {
        if self.workspace_id.trim().is_empty() {
            return Err(WorkspaceError::InvalidPolicy(
                "workspace id must not be empty".to_string(),
            ));
        }
        if let Some((key, _)) = self
            .env
            .iter()
            .find(|(k, _)| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(WorkspaceError::InvalidPolicy(format!(
                "invalid environment variable name {key:?}"
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(WorkspaceError::InvalidPolicy(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonical workspace root, falling back to the path as given when it cannot be resolved.
    pub fn canonical_root(&self) -> PathBuf {
        std::fs::canonicalize(&self.workspace_root).unwrap_or_else(|_| self.workspace_root.clone())
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}
