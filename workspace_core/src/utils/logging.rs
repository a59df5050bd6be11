//! # Logging Initialization
//!
//! One entry point, [`init_logging`], installs the global `tracing` subscriber for
//! an embedding program or for the `workspace_launcher` binary. It is guarded by a
//! `std::sync::Once`, so calling it from several places is harmless.
//!
//! The filter honours `RUST_LOG`; without it the given level applies to all crates
//! and `workspace_core` itself logs at `debug`, unless the level is `warn` or
//! `error`, which then apply to it as well.
//!
//! Output goes either to a daily rolling file in the per-user cache directory
//! (resolved with `directories`) or to stderr with ANSI colours. When the cache
//! directory is missing or not writable the file mode quietly falls back to stderr.
//!
//! The launcher always logs warnings to stderr, so a sandbox fallback is never
//! silent, and switches to `debug` under `--debug`.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// Initialize verbose logging for tests.
pub fn init_test_logging() {
    let _ = init_logging("trace", false);
}

/// Initializes the logging system.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for subscriber setup that can fail.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

        if log_to_file
            && let Some(proj_dirs) = ProjectDirs::from("com", "WorkspaceSandbox", "workspace_core")
        {
            let log_dir = proj_dirs.cache_dir();

            // tracing_appender::rolling::daily panics on permission errors, probe first.
            let file_appender_result = if test_write_permission(log_dir) {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    tracing_appender::rolling::daily(log_dir, "workspace_core.log")
                }))
            } else {
                Err(Box::new("Cannot write to log directory") as Box<dyn std::any::Any + Send>)
            };

            if let Ok(file_appender) = file_appender_result {
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .try_init();
                // Leaked so buffered lines are flushed on exit.
                Box::leak(Box::new(guard));
                return;
            }
        }

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .try_init();
    });

    Ok(())
}

fn default_directives(log_level: &str) -> String {
    let crate_level = match log_level {
        "warn" | "error" => log_level,
        _ => "debug",
    };
    format!("{log_level},workspace_core={crate_level}")
}

/// Creates `dir` if needed and checks that a file can be written into it.
fn test_write_permission(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let test_file = dir.join(".workspace_core_log_test");
    match std::fs::write(&test_file, "test") {
        Ok(()) => {
            let _ = std::fs::remove_file(&test_file);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_permission_probe_creates_missing_directory() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        assert!(test_write_permission(&nested));
        assert!(nested.is_dir());
        assert!(!nested.join(".workspace_core_log_test").exists());
    }

    #[test]
    fn quiet_levels_also_quiet_this_crate() {
        assert_eq!(default_directives("warn"), "warn,workspace_core=warn");
        assert_eq!(default_directives("info"), "info,workspace_core=debug");
    }

    #[test]
    fn init_logging_is_idempotent() {
        assert!(init_logging("info", false).is_ok());
        assert!(init_logging("debug", true).is_ok());
    }
}
