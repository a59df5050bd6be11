//! Engine-wide configuration.
//!
//! Policies describe one launch; [`EngineConfig`] describes how the engine behaves
//! for every launch. It can be built in code, loaded from a TOML file, or located
//! through the `WORKSPACE_SANDBOX_CONFIG` environment variable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WorkspaceError};
use crate::guard::GuardMode;
use crate::profile::linux::DEFAULT_MOUNT_POINT;
use crate::utils::duration;

/// Environment variable naming a TOML config file.
pub const CONFIG_ENV_VAR: &str = "WORKSPACE_SANDBOX_CONFIG";

/// What to do when a sandboxed launch cannot get its sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Log a warning and run the command without isolation.
    #[default]
    Unsandboxed,
    /// Refuse to launch.
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub guard_mode: GuardMode,
    pub fallback_mode: FallbackMode,
    /// Backoff between monitor ticks that read nothing.
    #[serde(with = "duration", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Grace window between the graceful and the forced kill after a timeout.
    #[serde(with = "duration", rename = "kill_grace_ms")]
    pub kill_grace: Duration,
    /// Explicit bubblewrap binary; searched on `PATH` when unset.
    pub bwrap_path: Option<PathBuf>,
    /// Where the workspace appears inside the Linux jail.
    pub sandbox_mount_point: PathBuf,
    /// Size of the scratch buffer used for each read.
    pub read_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            guard_mode: GuardMode::default(),
            fallback_mode: FallbackMode::default(),
            poll_interval: Duration::from_millis(5),
            kill_grace: Duration::from_millis(250),
            bwrap_path: None,
            sandbox_mount_point: PathBuf::from(DEFAULT_MOUNT_POINT),
            read_buffer_size: 8192,
        }
    }
}

impl EngineConfig {
    /// Load a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| WorkspaceError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| WorkspaceError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate().map_err(|reason| WorkspaceError::Config {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    /// Load from `$WORKSPACE_SANDBOX_CONFIG` when set, otherwise defaults.
    ///
    /// A broken config file is logged and ignored; a process-wide bridge has no
    /// caller to report the error to.
    pub fn from_env() -> Self {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => match Self::load(Path::new(&path)) {
                Ok(config) => {
                    tracing::debug!(path = ?path, "loaded engine configuration");
                    config
                }
                Err(e) => {
                    tracing::warn!("{e}; using default engine configuration");
                    Self::default()
                }
            },
            None => Self::default(),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be greater than zero".to_string());
        }
        if !self.sandbox_mount_point.is_absolute() {
            return Err(format!(
                "sandbox_mount_point must be absolute, got {}",
                self.sandbox_mount_point.display()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.kill_grace, Duration::from_millis(250));
        assert_eq!(config.guard_mode, GuardMode::Always);
        assert_eq!(config.fallback_mode, FallbackMode::Unsandboxed);
        assert_eq!(config.sandbox_mount_point, PathBuf::from("/app"));
    }

    #[test]
    fn load_reads_partial_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("engine.toml");
        std::fs::write(
            &path,
            "guard_mode = \"sandbox_only\"\nfallback_mode = \"deny\"\nkill_grace_ms = 1000\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.guard_mode, GuardMode::SandboxOnly);
        assert_eq!(config.fallback_mode, FallbackMode::Deny);
        assert_eq!(config.kill_grace, Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }

    #[test]
    fn load_reports_path_on_failure() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.toml");
        match EngineConfig::load(&missing) {
            Err(WorkspaceError::Config { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected config error, got {other:?}"),
        }

        let bad = temp.path().join("bad.toml");
        std::fs::write(&bad, "sandbox_mount_point = \"relative\"\n").unwrap();
        assert!(matches!(
            EngineConfig::load(&bad),
            Err(WorkspaceError::Config { .. })
        ));
    }
}
