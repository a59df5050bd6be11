//! Translation of an [`ExecutionPolicy`] into a platform isolation profile.
//!
//! The platform strategy is picked at compile time. Linux uses a bubblewrap
//! namespace jail, macOS a Seatbelt profile, Windows an AppContainer with a
//! restricted token. Hosts without a strategy report the sandbox as unavailable.
//!
//! A profile is turned into a [`LaunchPlan`], the exact program, argv, environment
//! and working directory handed to the launcher.

pub mod landlock;
pub mod linux;
pub mod seatbelt;
#[cfg(windows)]
pub mod windows;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use crate::command::Invocation;
use crate::config::EngineConfig;
use crate::error::{Result, WorkspaceError};
use crate::policy::ExecutionPolicy;

pub use linux::NamespaceProfile;
pub use seatbelt::SeatbeltProfile;
#[cfg(windows)]
pub use windows::AppContainerProfile;

/// Which isolation a launch actually ran under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Host,
    Namespace,
    Seatbelt,
    AppContainer,
}

impl ProfileKind {
    pub fn is_sandboxed(self) -> bool {
        self != ProfileKind::Host
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProfileKind::Host => "host",
            ProfileKind::Namespace => "bubblewrap",
            ProfileKind::Seatbelt => "seatbelt",
            ProfileKind::AppContainer => "appcontainer",
        })
    }
}

/// Platform isolation for a single launch.
#[derive(Debug)]
pub enum SandboxProfile {
    /// No isolation.
    Host,
    Namespace(NamespaceProfile),
    Seatbelt(SeatbeltProfile),
    #[cfg(windows)]
    AppContainer(AppContainerProfile),
}

/// Everything the launcher needs, fully resolved.
#[derive(Debug)]
pub struct LaunchPlan {
    pub invocation: Invocation,
    /// Complete child environment; nothing else is inherited.
    pub env: Vec<(String, String)>,
    /// Directory the launcher changes into before exec. `None` when the
    /// isolation layer changes directory itself.
    pub cwd: Option<PathBuf>,
    pub kind: ProfileKind,
    /// Why a sandboxed request ended up running on the host.
    pub fallback: Option<String>,
    #[cfg(windows)]
    pub container: Option<AppContainerProfile>,
}

impl SandboxProfile {
    pub fn kind(&self) -> ProfileKind {
        match self {
            SandboxProfile::Host => ProfileKind::Host,
            SandboxProfile::Namespace(_) => ProfileKind::Namespace,
            SandboxProfile::Seatbelt(_) => ProfileKind::Seatbelt,
            #[cfg(windows)]
            SandboxProfile::AppContainer(_) => ProfileKind::AppContainer,
        }
    }

    /// Wrap `invocation` so it runs under this profile.
    pub fn into_plan(self, invocation: Invocation, policy: &ExecutionPolicy) -> LaunchPlan {
        let kind = self.kind();
        let host_cwd = Some(policy.effective_cwd());

        match self {
            SandboxProfile::Host => LaunchPlan {
                invocation,
                env: host_environment(policy, None),
                cwd: host_cwd,
                kind,
                fallback: None,
                #[cfg(windows)]
                container: None,
            },
            SandboxProfile::Namespace(jail) => {
                let (program, args) = jail.wrap(invocation.argv());
                LaunchPlan {
                    invocation: Invocation::new(program, args),
                    env: jail_environment(policy),
                    cwd: None,
                    kind,
                    fallback: None,
                    #[cfg(windows)]
                    container: None,
                }
            }
            SandboxProfile::Seatbelt(profile) => {
                let temp = profile.temp_dir.to_string_lossy().into_owned();
                let (program, args) = profile.wrap(invocation.argv());
                LaunchPlan {
                    invocation: Invocation::new(program, args),
                    env: host_environment(policy, Some(temp)),
                    cwd: host_cwd,
                    kind,
                    fallback: None,
                    #[cfg(windows)]
                    container: None,
                }
            }
            #[cfg(windows)]
            SandboxProfile::AppContainer(container) => LaunchPlan {
                invocation,
                env: host_environment(policy, None),
                cwd: host_cwd,
                kind,
                fallback: None,
                container: Some(container),
            },
        }
    }
}

/// Builds the profile for the current platform.
#[derive(Debug, Clone, Default)]
pub struct SandboxProfileBuilder {
    bwrap_path: Option<PathBuf>,
    mount_point: PathBuf,
}

impl SandboxProfileBuilder {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            bwrap_path: config.bwrap_path.clone(),
            mount_point: config.sandbox_mount_point.clone(),
        }
    }

    /// Profile for `policy`; [`SandboxProfile::Host`] when sandboxing is off.
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::SandboxUnavailable`] when the platform mechanism is
    /// missing or refuses to set up.
    pub fn build(&self, policy: &ExecutionPolicy) -> Result<SandboxProfile> {
        if !policy.sandbox {
            return Ok(SandboxProfile::Host);
        }
        self.build_platform(policy)
    }

    #[cfg(target_os = "linux")]
    fn build_platform(&self, policy: &ExecutionPolicy) -> Result<SandboxProfile> {
        let bwrap = crate::prerequisites::find_bubblewrap(self.bwrap_path.as_deref())
            .ok_or_else(|| {
                WorkspaceError::SandboxUnavailable("bubblewrap (bwrap) not found".to_string())
            })?;
        let mount_point = if self.mount_point.as_os_str().is_empty() {
            PathBuf::from(linux::DEFAULT_MOUNT_POINT)
        } else {
            self.mount_point.clone()
        };
        Ok(SandboxProfile::Namespace(NamespaceProfile::build(
            policy,
            bwrap,
            &mount_point,
        )))
    }

    #[cfg(target_os = "macos")]
    fn build_platform(&self, policy: &ExecutionPolicy) -> Result<SandboxProfile> {
        crate::prerequisites::check_sandbox_prerequisites()?;
        Ok(SandboxProfile::Seatbelt(SeatbeltProfile::build(policy)))
    }

    #[cfg(windows)]
    fn build_platform(&self, policy: &ExecutionPolicy) -> Result<SandboxProfile> {
        Ok(SandboxProfile::AppContainer(AppContainerProfile::build(
            policy,
        )?))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    fn build_platform(&self, _policy: &ExecutionPolicy) -> Result<SandboxProfile> {
        Err(WorkspaceError::SandboxUnavailable(format!(
            "no sandbox strategy for {}",
            std::env::consts::OS
        )))
    }
}

/// Environment outside the jail: optionally the parent's, then the policy's entries.
fn host_environment(policy: &ExecutionPolicy, tmpdir: Option<String>) -> Vec<(String, String)> {
    let mut env = if policy.include_parent_env {
        unicode_vars(std::env::vars_os())
    } else {
        BTreeMap::new()
    };
    if let Some(tmpdir) = tmpdir {
        env.insert("TMPDIR".to_string(), tmpdir);
    }
    env.extend(policy.env.clone());
    env.into_iter().collect()
}

/// Parent variables that are valid UTF-8. The rest cannot be carried through a
/// launch plan and are skipped.
fn unicode_vars(vars: impl Iterator<Item = (OsString, OsString)>) -> BTreeMap<String, String> {
    vars.filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
        (Ok(key), Ok(value)) => Some((key, value)),
        (key, _) => {
            tracing::debug!(key = ?key, "skipping non-UTF-8 environment variable");
            None
        }
    })
    .collect()
}

/// Environment inside the jail: a short allow-list of the parent's variables.
fn jail_environment(policy: &ExecutionPolicy) -> Vec<(String, String)> {
    let mut env: BTreeMap<String, String> = linux::ENV_PASSTHROUGH
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect();
    // The host home directory does not exist inside the jail.
    env.insert("HOME".to_string(), linux::JAIL_HOME.to_string());
    env.insert("TMPDIR".to_string(), "/tmp".to_string());
    let path = env
        .entry("PATH".to_string())
        .or_insert_with(|| "/usr/local/bin:/usr/bin:/bin".to_string());
    for dir in linux::HOME_TOOL_BIN_DIRS {
        if !path.split(':').any(|entry| entry == *dir) {
            path.push(':');
            path.push_str(dir);
        }
    }
    env.extend(policy.env.clone());
    env.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn unsandboxed_policy_builds_host_profile() {
        let builder = SandboxProfileBuilder::new(&EngineConfig::default());
        let profile = builder.build(&ExecutionPolicy::new("ws", "/tmp")).unwrap();
        assert_eq!(profile.kind(), ProfileKind::Host);
    }

    #[test]
    fn host_plan_runs_in_effective_cwd() {
        let policy = ExecutionPolicy::new("ws", "/srv/ws").working_directory("sub");
        let plan = SandboxProfile::Host.into_plan(Invocation::new("ls", vec![]), &policy);
        assert_eq!(plan.cwd, Some(PathBuf::from("/srv/ws/sub")));
        assert_eq!(plan.invocation.program, "ls");
        assert!(!plan.kind.is_sandboxed());
    }

    #[test]
    fn policy_env_overrides_parent_env() {
        let policy = ExecutionPolicy::new("ws", "/tmp").env("PATH", "/custom");
        let env = host_environment(&policy, None);
        assert_eq!(lookup(&env, "PATH"), Some("/custom"));
    }

    #[test]
    fn cleared_env_contains_only_policy_entries() {
        let policy = ExecutionPolicy::new("ws", "/tmp")
            .include_parent_env(false)
            .env("ONLY", "1");
        let env = host_environment(&policy, None);
        assert_eq!(env, vec![("ONLY".to_string(), "1".to_string())]);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_parent_variables_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let vars = vec![
            (OsString::from("GOOD"), OsString::from("yes")),
            (OsString::from("BAD_VALUE"), OsString::from_vec(vec![0xff, 0xfe])),
            (OsString::from_vec(vec![b'K', 0xff]), OsString::from("v")),
        ];
        let env = unicode_vars(vars.into_iter());
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("GOOD").map(String::as_str), Some("yes"));
    }

    #[test]
    fn jail_env_is_an_allow_list() {
        let policy = ExecutionPolicy::new("ws", "/tmp").env("EXTRA", "yes");
        let env = jail_environment(&policy);
        assert_eq!(lookup(&env, "HOME"), Some("/tmp"));
        assert_eq!(lookup(&env, "EXTRA"), Some("yes"));
        let path = lookup(&env, "PATH").unwrap();
        assert!(path.split(':').any(|d| d == "/tmp/.cargo/bin"));
        assert!(
            env.iter()
                .all(|(k, _)| linux::ENV_PASSTHROUGH.contains(&k.as_str())
                    || ["HOME", "TMPDIR", "EXTRA"].contains(&k.as_str()))
        );
    }

    #[test]
    fn namespace_plan_delegates_cwd_to_bubblewrap() {
        let policy = ExecutionPolicy::new("ws", "/srv/ws").sandboxed(true);
        let jail = NamespaceProfile::build_with(
            &policy,
            PathBuf::from("/usr/bin/bwrap"),
            std::path::Path::new("/app"),
            None,
            |_| linux::HostEntry::Missing,
        );
        let plan = SandboxProfile::Namespace(jail)
            .into_plan(Invocation::new("echo", vec!["hi".into()]), &policy);
        assert_eq!(plan.cwd, None);
        assert_eq!(plan.invocation.program, "/usr/bin/bwrap");
        assert_eq!(plan.kind, ProfileKind::Namespace);
        assert_eq!(plan.invocation.args.last().map(String::as_str), Some("hi"));
    }
}
