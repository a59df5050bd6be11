//! Probing whether the platform sandbox can actually be used on this host.

use std::path::{Path, PathBuf};

use crate::error::{Result, WorkspaceError};

/// Locate bubblewrap: an explicit path wins, otherwise `bwrap` on `PATH`.
pub fn find_bubblewrap(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) if path.is_file() => Some(path.to_path_buf()),
        Some(path) => {
            tracing::warn!(path = %path.display(), "configured bwrap path does not exist");
            None
        }
        None => which::which("bwrap").ok(),
    }
}

/// Check that the platform sandbox is usable.
pub fn check_sandbox_prerequisites() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        find_bubblewrap(None).map(|_| ()).ok_or_else(|| {
            WorkspaceError::SandboxUnavailable(
                "bubblewrap (bwrap) is not installed or not on PATH".to_string(),
            )
        })
    }

    #[cfg(target_os = "macos")]
    {
        check_macos_sandbox_available()
    }

    #[cfg(windows)]
    {
        // AppContainer setup is only attempted at launch time.
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        Err(WorkspaceError::SandboxUnavailable(format!(
            "unsupported operating system: {}",
            std::env::consts::OS
        )))
    }
}

#[cfg(target_os = "macos")]
fn check_macos_sandbox_available() -> Result<()> {
    if Path::new(crate::profile::seatbelt::SANDBOX_EXEC).is_file() {
        Ok(())
    } else {
        Err(WorkspaceError::SandboxUnavailable(
            "sandbox-exec is not available".to_string(),
        ))
    }
}

/// True when the kernel advertises Landlock support.
#[cfg(target_os = "linux")]
pub fn landlock_available() -> bool {
    match std::fs::read_to_string("/sys/kernel/security/lsm") {
        Ok(content) => content.split(',').any(|lsm| lsm.trim() == "landlock"),
        Err(_) => kernel_supports_landlock(),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn landlock_available() -> bool {
    false
}

/// Landlock landed in Linux 5.13.
#[cfg(target_os = "linux")]
fn kernel_supports_landlock() -> bool {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|release| release_at_least(&release, 5, 13))
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn release_at_least(release: &str, want_major: u32, want_minor: u32) -> bool {
    let mut parts = release.trim().split(['.', '-']);
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    major > want_major || (major == want_major && minor >= want_minor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_bwrap_path_must_exist() {
        let temp = TempDir::new().unwrap();
        let fake = temp.path().join("bwrap");
        assert_eq!(find_bubblewrap(Some(&fake)), None);

        std::fs::write(&fake, "").unwrap();
        assert_eq!(find_bubblewrap(Some(&fake)), Some(fake));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_kernel_release() {
        assert!(release_at_least("6.1.0-13-amd64", 5, 13));
        assert!(release_at_least("5.13.0", 5, 13));
        assert!(!release_at_least("5.10.200", 5, 13));
        assert!(!release_at_least("garbage", 5, 13));
    }
}
