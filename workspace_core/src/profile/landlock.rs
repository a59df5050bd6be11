//! Landlock self-restriction, used by the launcher binary when bubblewrap is missing.
//!
//! Unlike the other profiles this restricts the *current* process, and every
//! process it spawns afterwards. It must run before any threads are started.

use anyhow::Result;
use std::path::Path;

/// Restrict the current process to read-only system paths plus a writable workspace.
///
/// Without `allow_network`, TCP bind and connect are denied on kernels that
/// support Landlock network rules (ABI v4); older kernels only get the
/// filesystem restrictions.
#[cfg(target_os = "linux")]
pub fn enforce_landlock_sandbox(workspace_root: &Path, allow_network: bool) -> Result<()> {
    use anyhow::Context;
    use landlock::{
        ABI, Access, AccessFs, AccessNet, PathBeneath, PathFd, Ruleset, RulesetAttr,
        RulesetCreatedAttr,
    };

    let abi = ABI::V4;
    let access_all = AccessFs::from_all(abi);
    let access_read_execute = AccessFs::from_read(abi) | AccessFs::Execute;

    let mut ruleset = Ruleset::default()
        .handle_access(access_all)
        .context("Failed to create Landlock ruleset")?;
    if !allow_network {
        ruleset = ruleset
            .handle_access(AccessNet::from_all(abi))
            .context("Failed to handle Landlock network access")?;
    }
    let mut ruleset = ruleset
        .create()
        .context("Failed to create Landlock ruleset instance")?;

    ruleset = ruleset
        .add_rule(PathBeneath::new(
            PathFd::new(workspace_root).context("Failed to open workspace for Landlock")?,
            access_all,
        ))
        .context("Failed to add Landlock rule for workspace")?;

    for path in [
        "/usr", "/bin", "/sbin", "/etc", "/lib", "/lib64", "/proc", "/dev", "/sys",
    ] {
        if let Ok(fd) = PathFd::new(path) {
            let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, access_read_execute));
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        for tool in [".cargo", ".rustup", ".nvm", ".npm", ".cache"] {
            if let Ok(fd) = PathFd::new(Path::new(&home).join(tool)) {
                let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, access_read_execute));
            }
        }
    }

    if let Ok(fd) = PathFd::new("/tmp") {
        let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, access_all));
    }
    // Directory-only rights are rejected on a plain file.
    if let Ok(fd) = PathFd::new("/dev/null") {
        let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, AccessFs::from_file(abi)));
    }

    let status = ruleset
        .restrict_self()
        .context("Failed to apply Landlock restrictions")?;

    tracing::info!(
        workspace = %workspace_root.display(),
        allow_network,
        "Landlock sandbox enforced (status: {:?})",
        status.ruleset
    );

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enforce_landlock_sandbox(_workspace_root: &Path, _allow_network: bool) -> Result<()> {
    anyhow::bail!("Landlock is only available on Linux")
}
