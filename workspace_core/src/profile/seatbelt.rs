//! macOS Seatbelt profile rendered for `sandbox-exec -p`.

use std::path::{Path, PathBuf};

use crate::policy::ExecutionPolicy;

pub const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";

/// Toolchains commonly installed under `$HOME` that commands need to read.
const USER_TOOL_DIRS: &[&str] = &[".cargo", ".rustup"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatbeltProfile {
    pub text: String,
    /// Per-workspace scratch directory exported as `TMPDIR`.
    pub temp_dir: PathBuf,
}

impl SeatbeltProfile {
    pub fn build(policy: &ExecutionPolicy) -> Self {
        let temp_dir = private_temp_dir(&policy.workspace_id);
        if let Err(e) = std::fs::create_dir_all(&temp_dir) {
            tracing::warn!(dir = %temp_dir.display(), "cannot create sandbox temp dir: {e}");
        }
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let text = render(policy, &policy.canonical_root(), &temp_dir, home.as_deref());
        Self { text, temp_dir }
    }

    /// `sandbox-exec -p <profile> <argv>`.
    pub fn wrap(&self, argv: Vec<String>) -> (String, Vec<String>) {
        let mut args = Vec::with_capacity(argv.len() + 2);
        args.push("-p".to_string());
        args.push(self.text.clone());
        args.extend(argv);
        (SANDBOX_EXEC.to_string(), args)
    }
}

fn private_temp_dir(workspace_id: &str) -> PathBuf {
    let safe: String = workspace_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    std::env::temp_dir().join(format!("workspace-{safe}"))
}

fn render(policy: &ExecutionPolicy, root: &Path, temp_dir: &Path, home: Option<&Path>) -> String {
    let mut user_tool_rules = String::new();
    if let Some(home) = home {
        for tool in USER_TOOL_DIRS {
            let path = home.join(tool);
            if path.exists() {
                user_tool_rules.push_str(&format!(
                    "(allow file-read* (subpath \"{}\"))\n",
                    escape(&path)
                ));
            }
        }
    }

    let network = if policy.allow_network {
        "(allow network*)"
    } else {
        "(deny network*)"
    };

    format!(
        r#"(version 1)
(deny default)
(allow process*)
(allow signal (target same-sandbox))
(allow sysctl-read)
(allow file-read*)
{user_tool_rules}(allow file-write* (subpath "{root}"))
(allow file-write* (subpath "{temp}"))
(allow file-write* (literal "/dev/null"))
(allow file-write* (literal "/dev/tty"))
(allow file-write* (literal "/dev/zero"))
{network}
(allow mach-lookup)
(allow ipc-posix-shm*)
"#,
        root = escape(root),
        temp = escape(temp_dir),
    )
}

/// Quote a path for an SBPL string literal.
fn escape(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(policy: &ExecutionPolicy) -> String {
        render(policy, Path::new("/Users/dev/ws"), Path::new("/tmp/workspace-ws"), None)
    }

    #[test]
    fn denies_by_default_and_allows_workspace_writes() {
        let profile = text(&ExecutionPolicy::new("ws", "/Users/dev/ws"));
        assert!(profile.starts_with("(version 1)\n(deny default)"));
        assert!(profile.contains(r#"(allow file-write* (subpath "/Users/dev/ws"))"#));
        assert!(profile.contains(r#"(allow file-write* (subpath "/tmp/workspace-ws"))"#));
    }

    #[test]
    fn network_line_follows_policy() {
        let offline = text(&ExecutionPolicy::new("ws", "/w").allow_network(false));
        assert!(offline.contains("(deny network*)"));
        assert!(!offline.contains("(allow network*)"));

        let online = text(&ExecutionPolicy::new("ws", "/w").allow_network(true));
        assert!(online.contains("(allow network*)"));
    }

    #[test]
    fn quotes_in_paths_are_escaped() {
        assert_eq!(escape(Path::new(r#"/a "b"/c"#)), r#"/a \"b\"/c"#);
    }

    #[test]
    fn temp_dir_name_is_sanitized() {
        let dir = private_temp_dir("../evil id");
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "workspace-___evil_id");
    }
}
