//! Pre-flight inspection of command text against the network policy.
//!
//! This is a heuristic gate, not an enforcement layer. It looks at the text once,
//! before anything is spawned, and rejects obvious attempts to reach the network when
//! the policy forbids it: a leading network tool (`curl`, `ssh`, `npm`, ...) or an
//! interpreter whose inline script imports a networking API. Obfuscated commands get
//! through; kernel-level isolation in the sandbox profile is what actually blocks them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::command::{first_token, normalized_program_name};
use crate::policy::ExecutionPolicy;

/// Binaries whose main purpose is network I/O.
const NETWORK_BINARIES: &[&str] = &[
    "curl", "wget", "ssh", "scp", "sftp", "rsync", "ftp", "tftp", "telnet", "nc", "ncat",
    "netcat", "socat", "ping", "ping6", "traceroute", "nslookup", "dig", "host", "whois",
    "npm", "npx", "yarn", "pnpm", "pip", "pip3", "gem", "apt", "apt-get", "brew", "git",
    "invoke-webrequest", "invoke-restmethod", "iwr", "irm", "bitsadmin", "certutil",
];

const POWERSHELL: &[&str] = &["powershell", "pwsh"];
const PYTHON: &[&str] = &["python", "python3", "python2", "py", "pypy", "pypy3"];
const NODE: &[&str] = &["node", "nodejs", "deno", "bun"];

static POWERSHELL_NETWORK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(net\.sockets|net\.webclient|webrequest|restmethod|system\.net\.http)")
        .expect("valid powershell pattern")
});

static PYTHON_NETWORK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(import\s+socket|from\s+socket\s+import|urllib|http\.client|import\s+requests|from\s+requests\s+import|import\s+httpx|aiohttp|ftplib|smtplib)",
    )
    .expect("valid python pattern")
});

static NODE_NETWORK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(require\(\s*['"](node:)?(net|http|https|http2|dgram|dns|tls|child_process)['"]\s*\)|from\s+['"](node:)?(net|http|https|dgram|dns|tls|child_process)['"]|\bfetch\s*\(|websocket)"#,
    )
    .expect("valid node pattern")
});

/// When the guard runs relative to the sandbox flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    /// Inspect every command whose policy forbids network access.
    #[default]
    Always,
    /// Inspect only sandboxed commands.
    SandboxOnly,
    /// Never inspect.
    Disabled,
}

/// A command the guard refused to let through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct GuardViolation {
    /// Token or snippet that triggered the rejection.
    pub matched: String,
    pub reason: String,
}

/// Stateless inspector; all rule data is static.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityGuard {
    mode: GuardMode,
}

impl SecurityGuard {
    pub fn new(mode: GuardMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Inspect `command_text` under `policy`, honouring the configured [`GuardMode`].
    pub fn check(&self, command_text: &str, policy: &ExecutionPolicy) -> Result<(), GuardViolation> {
        let applies = match self.mode {
            GuardMode::Always => true,
            GuardMode::SandboxOnly => policy.sandbox,
            GuardMode::Disabled => false,
        };
        if !applies {
            return Ok(());
        }
        inspect(command_text, policy)
    }
}

/// Inspect `command_text` against the network policy, regardless of guard mode.
pub fn inspect(command_text: &str, policy: &ExecutionPolicy) -> Result<(), GuardViolation> {
    if policy.allow_network {
        return Ok(());
    }

    let Some(first) = first_token(command_text) else {
        return Ok(());
    };
    let program = normalized_program_name(first);

    if NETWORK_BINARIES.contains(&program.as_str()) {
        tracing::debug!(program = %program, "guard rejected network binary");
        return Err(GuardViolation {
            matched: program.clone(),
            reason: format!("'{program}' requires network access, which this workspace does not allow"),
        });
    }

    let pattern: Option<(&Regex, &str)> = if POWERSHELL.contains(&program.as_str()) {
        Some((&*POWERSHELL_NETWORK, "PowerShell"))
    } else if is_python(&program) {
        Some((&*PYTHON_NETWORK, "Python"))
    } else if NODE.contains(&program.as_str()) {
        Some((&*NODE_NETWORK, "JavaScript"))
    } else {
        None
    };

    if let Some((regex, language)) = pattern
        && let Some(found) = regex.find(command_text)
    {
        tracing::debug!(language, snippet = found.as_str(), "guard rejected inline network code");
        return Err(GuardViolation {
            matched: found.as_str().to_string(),
            reason: format!(
                "{language} code uses '{}' but network access is not allowed in this workspace",
                found.as_str()
            ),
        });
    }

    Ok(())
}

fn is_python(program: &str) -> bool {
    PYTHON.contains(&program)
        || program
            .strip_prefix("python3.")
            .is_some_and(|minor| minor.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> ExecutionPolicy {
        ExecutionPolicy::new("ws", "/tmp").allow_network(false)
    }

    fn online() -> ExecutionPolicy {
        ExecutionPolicy::new("ws", "/tmp").allow_network(true)
    }

    #[test]
    fn flags_network_binaries_case_insensitively() {
        assert!(inspect("curl https://example.com", &offline()).is_err());
        assert!(inspect("  WGET http://x", &offline()).is_err());
        assert!(inspect("/usr/bin/ssh host", &offline()).is_err());
        assert!(inspect(r"C:\tools\Curl.exe -I x", &offline()).is_err());
    }

    #[test]
    fn allows_everything_when_network_is_permitted() {
        assert!(inspect("curl https://example.com", &online()).is_ok());
        assert!(inspect("python3 -c 'import socket'", &online()).is_ok());
    }

    #[test]
    fn flags_inline_python_networking() {
        let err = inspect("python3 -c 'import socket; socket.socket()'", &offline()).unwrap_err();
        assert!(err.reason.contains("Python"));
        assert!(inspect("python3.12 -c 'import urllib.request'", &offline()).is_err());
        assert!(inspect("python -c 'print(1)'", &offline()).is_ok());
    }

    #[test]
    fn flags_inline_node_and_powershell_networking() {
        assert!(inspect(r#"node -e "require('http').get('x')""#, &offline()).is_err());
        assert!(inspect(r#"node -e "require('child_process').exec('x')""#, &offline()).is_err());
        assert!(inspect("node -e 'console.log(1)'", &offline()).is_ok());
        assert!(inspect("pwsh -c Invoke-RestMethod x", &offline()).is_err());
        assert!(
            inspect(
                "powershell -Command (New-Object Net.Sockets.TcpClient)",
                &offline()
            )
            .is_err()
        );
    }

    #[test]
    fn ignores_idioms_outside_interpreters() {
        assert!(inspect("echo 'import socket'", &offline()).is_ok());
        assert!(inspect("ls -la", &offline()).is_ok());
        assert!(inspect("", &offline()).is_ok());
    }

    #[test]
    fn guard_mode_controls_when_inspection_runs() {
        let unsandboxed = offline();
        let sandboxed = offline().sandboxed(true);
        let cmd = "curl https://example.com";

        assert!(SecurityGuard::new(GuardMode::Always).check(cmd, &unsandboxed).is_err());
        assert!(SecurityGuard::new(GuardMode::SandboxOnly).check(cmd, &unsandboxed).is_ok());
        assert!(SecurityGuard::new(GuardMode::SandboxOnly).check(cmd, &sandboxed).is_err());
        assert!(SecurityGuard::new(GuardMode::Disabled).check(cmd, &sandboxed).is_ok());
    }
}
