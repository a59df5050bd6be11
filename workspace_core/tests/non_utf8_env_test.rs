//! A parent environment holding non-UTF-8 variables must not break launches.
//!
//! Kept in its own test binary: the test mutates the process environment.
#![cfg(unix)]

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use tempfile::TempDir;
use workspace_core::{CommandSpec, Engine, ExecutionPolicy};

#[tokio::test]
async fn test_non_utf8_parent_variable_is_skipped() {
    // SAFETY: the only test in this binary; nothing else reads the environment yet.
    unsafe {
        std::env::set_var("WORKSPACE_BAD_BYTES", OsString::from_vec(vec![0xff, 0xfe]));
        std::env::set_var("WORKSPACE_GOOD", "kept");
    }

    let temp = TempDir::new().unwrap();
    let policy = ExecutionPolicy::new("env", temp.path());
    let engine = Engine::default();

    assert!(engine.prepare(&CommandSpec::shell("true"), &policy).is_ok());

    let result = engine
        .run(
            &CommandSpec::shell("echo \"${WORKSPACE_GOOD}:${WORKSPACE_BAD_BYTES-unset}\""),
            &policy,
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout_lossy(), "kept:unset\n");
}
