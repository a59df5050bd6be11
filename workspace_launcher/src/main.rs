//! # Workspace Launcher
//!
//! Runs one command under a workspace policy and exits with its code, so a host
//! without the C ABI can drive the engine over a plain process boundary.
//!
//! The child's stdout and stderr are forwarded to the launcher's own streams as
//! they arrive. SIGINT and SIGTERM are turned into a graceful kill of the child;
//! the usual grace window and forced kill follow.
//!
//! On Linux hosts where `--sandbox` is requested but bubblewrap is missing, the
//! launcher restricts itself with Landlock before starting the runtime and runs
//! the child unsandboxed underneath that restriction.
//!
//! ## Exit codes
//!
//! - the child's code, with signal deaths reported shell-style as `128 + signal`
//!   (the library's `-128 + signal` encoding does not fit a process exit status)
//! - `97` when the security guard rejected the command
//! - `98` when no command was given
//! - `99` when the command could not be started

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use workspace_core::{
    CommandSpec, Engine, EngineConfig, ExecutionPolicy, ExitStatus, RunOptions, Stream,
    WorkspaceError, utils::logging::init_logging,
};

const EXIT_POLICY_VIOLATION: u8 = 97;
const EXIT_NO_COMMAND: u8 = 98;
const EXIT_LAUNCH_FAILED: u8 = 99;

/// Run a command inside a workspace sandbox.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = "Runs a single command confined to a workspace directory.

Example: workspace_launcher --id demo --workspace . --sandbox --no-net -- cargo test"
)]
struct Cli {
    /// Workspace identifier, used to name sandbox profiles
    #[arg(long, default_value = "default")]
    id: String,

    /// Workspace root directory; the only writable location inside the sandbox
    #[arg(long)]
    workspace: PathBuf,

    /// Run inside the platform sandbox
    #[arg(long)]
    sandbox: bool,

    /// Forbid network access
    #[arg(long)]
    no_net: bool,

    /// Working directory, relative to the workspace root
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Extra environment variables for the child
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Kill the command after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Engine configuration file (TOML); defaults to $WORKSPACE_SANDBOX_CONFIG
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the argv through the shell as a single command line
    #[arg(long)]
    shell: bool,

    /// Log at debug level on stderr (warnings are always shown)
    #[arg(long)]
    debug: bool,

    /// Command and arguments (after --)
    #[arg(allow_hyphen_values = true, trailing_var_arg = true)]
    argv: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Warnings always reach stderr so a dropped or weakened sandbox is visible.
    let log_level = if cli.debug { "debug" } else { "warn" };
    if let Err(e) = init_logging(log_level, false) {
        eprintln!("failed to initialize logging: {e:#}");
    }

    if cli.argv.is_empty() {
        eprintln!("workspace_launcher: no command given");
        return ExitCode::from(EXIT_NO_COMMAND);
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("workspace_launcher: {e:#}");
            return ExitCode::from(EXIT_LAUNCH_FAILED);
        }
    };

    let mut policy = build_policy(&cli);

    // Landlock only restricts threads created after it is applied, so this has to
    // happen before the runtime spawns its workers.
    match self_restrict_if_needed(&config, &policy) {
        Ok(true) => policy = policy.sandboxed(false),
        Ok(false) => {}
        Err(e) => {
            eprintln!("workspace_launcher: {e:#}");
            return ExitCode::from(EXIT_LAUNCH_FAILED);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("workspace_launcher: {e:#}");
            return ExitCode::from(EXIT_LAUNCH_FAILED);
        }
    };

    let spec = if cli.shell {
        CommandSpec::shell(cli.argv.join(" "))
    } else {
        CommandSpec::direct(cli.argv[0].clone(), cli.argv[1..].to_vec())
    };

    runtime.block_on(run(Engine::new(config), spec, policy))
}

fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(EngineConfig::from_env()),
    }
}

fn build_policy(cli: &Cli) -> ExecutionPolicy {
    let mut policy = ExecutionPolicy::new(cli.id.clone(), cli.workspace.clone())
        .sandboxed(cli.sandbox)
        .allow_network(!cli.no_net);
    if let Some(cwd) = &cli.cwd {
        policy = policy.working_directory(cwd.clone());
    }
    if let Some(secs) = cli.timeout {
        policy = policy.timeout(Duration::from_secs(secs));
    }
    for (key, value) in &cli.env {
        policy = policy.env(key.clone(), value.clone());
    }
    policy
}

/// Applies Landlock to this process when bubblewrap cannot provide the jail.
///
/// Returns `true` when the restriction is in place and the child should be
/// started without a profile of its own.
#[cfg(target_os = "linux")]
fn self_restrict_if_needed(config: &EngineConfig, policy: &ExecutionPolicy) -> Result<bool> {
    use workspace_core::prerequisites::{find_bubblewrap, landlock_available};
    use workspace_core::profile::landlock::enforce_landlock_sandbox;

    if !policy.sandbox || find_bubblewrap(config.bwrap_path.as_deref()).is_some() {
        return Ok(false);
    }
    if !landlock_available() {
        return Ok(false);
    }

    policy
        .validate()
        .map_err(|e| anyhow!("Invalid workspace: {e}"))?;
    enforce_landlock_sandbox(&policy.canonical_root(), policy.allow_network)
        .context("Failed to apply Landlock restrictions")?;
    tracing::warn!(
        workspace = %policy.workspace_id,
        "bubblewrap not found; running under Landlock instead"
    );
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
fn self_restrict_if_needed(_config: &EngineConfig, _policy: &ExecutionPolicy) -> Result<bool> {
    Ok(false)
}

async fn run(engine: Engine, spec: CommandSpec, policy: ExecutionPolicy) -> ExitCode {
    let cancel = CancellationToken::new();
    tokio::spawn(forward_signals(cancel.clone()));

    let options = RunOptions::default()
        .cancel(cancel)
        .sink(Box::new(|stream, chunk| {
            // A closed launcher stdout must not take the child down with it.
            let _ = match stream {
                Stream::Stdout => {
                    let mut out = std::io::stdout().lock();
                    out.write_all(chunk).and_then(|()| out.flush())
                }
                Stream::Stderr => std::io::stderr().lock().write_all(chunk),
            };
        }));

    match engine.run_with(&spec, &policy, options).await {
        Ok(result) => {
            if let Some(reason) = &result.sandbox_fallback {
                tracing::warn!("command ran without sandbox: {reason}");
            }
            ExitCode::from(shell_exit_code(result.status))
        }
        Err(WorkspaceError::PolicyViolation(violation)) => {
            eprintln!("workspace_launcher: blocked: {violation}");
            ExitCode::from(EXIT_POLICY_VIOLATION)
        }
        Err(e) => {
            eprintln!("workspace_launcher: {e}");
            ExitCode::from(EXIT_LAUNCH_FAILED)
        }
    }
}

/// Maps the child's status onto a process exit status the way a shell does.
fn shell_exit_code(status: ExitStatus) -> u8 {
    match status {
        ExitStatus::Exited(code) => (code & 0xff) as u8,
        ExitStatus::Signaled(signal) => (128 + (signal & 0x7f)) as u8,
        ExitStatus::Unknown => EXIT_LAUNCH_FAILED,
    }
}

#[cfg(unix)]
async fn forward_signals(cancel: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut interrupt), Ok(mut terminate)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        tracing::warn!("could not install signal handlers");
        return;
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    tracing::info!("signal received; stopping child");
    cancel.cancel();
}

#[cfg(not(unix))]
async fn forward_signals(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Ctrl-C received; stopping child");
        cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_split_on_first_equals() {
        assert_eq!(
            parse_env_pair("A=b=c"),
            Ok(("A".to_string(), "b=c".to_string()))
        );
        assert_eq!(parse_env_pair("EMPTY="), Ok(("EMPTY".to_string(), String::new())));
        assert!(parse_env_pair("=value").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn signal_codes_map_to_shell_convention() {
        assert_eq!(shell_exit_code(ExitStatus::Exited(0)), 0);
        assert_eq!(shell_exit_code(ExitStatus::Exited(42)), 42);
        assert_eq!(shell_exit_code(ExitStatus::Signaled(9)), 137);
        assert_eq!(shell_exit_code(ExitStatus::Signaled(15)), 143);
        assert_eq!(shell_exit_code(ExitStatus::Unknown), EXIT_LAUNCH_FAILED);
    }

    #[test]
    fn cli_collects_policy_flags() {
        let cli = Cli::parse_from([
            "workspace_launcher",
            "--id",
            "demo",
            "--workspace",
            "/tmp",
            "--sandbox",
            "--no-net",
            "--cwd",
            "sub",
            "--env",
            "A=1",
            "--timeout",
            "3",
            "--",
            "ls",
            "-la",
        ]);
        assert_eq!(cli.argv, ["ls", "-la"]);
        let policy = build_policy(&cli);
        assert_eq!(policy.workspace_id, "demo");
        assert!(policy.sandbox);
        assert!(!policy.allow_network);
        assert_eq!(policy.timeout, Some(Duration::from_secs(3)));
        assert_eq!(policy.env.get("A").map(String::as_str), Some("1"));
    }
}
