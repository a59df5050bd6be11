//! Launches must not leak descriptors or leave zombie children behind.
//!
//! Kept in its own test binary: counting `/proc/self/fd` is only meaningful when
//! no other test in the process is opening files at the same time.
#![cfg(target_os = "linux")]

use tempfile::TempDir;
use workspace_core::{CommandSpec, Engine, ExecutionPolicy, WorkspaceError};

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

/// Pids of this process's children that exited but were never reaped.
fn zombie_children() -> Vec<u32> {
    let me = std::process::id().to_string();
    std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
            // `pid (comm) state ppid ...`; comm may contain spaces and parens.
            let mut fields = stat[stat.rfind(')')? + 1..].split_whitespace();
            let state = fields.next()?;
            let ppid = fields.next()?;
            (state == "Z" && ppid == me).then_some(pid)
        })
        .collect()
}

/// Every child has been reaped and none is still running.
fn assert_no_children_left() {
    assert_eq!(zombie_children(), Vec::<u32>::new());
    let mut status = 0;
    // SAFETY: WNOHANG never blocks; there must be nothing left to reap.
    let rc = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    let errno = std::io::Error::last_os_error().raw_os_error();
    assert_eq!((rc, errno), (-1, Some(libc::ECHILD)));
}

// Both checks live in one test so nothing else runs concurrently in this binary.
#[test]
fn test_launches_do_not_leak_descriptors() {
    failed_launches_leave_descriptor_count_unchanged();
    finished_handles_release_descriptors();
}

fn failed_launches_leave_descriptor_count_unchanged() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::default();
    let policy = ExecutionPolicy::new("leak", temp.path());
    let missing = CommandSpec::direct("no-such-binary-for-leak-test", Vec::<String>::new());
    let bad_cwd = ExecutionPolicy::new("leak", temp.path()).working_directory("does/not/exist");

    // Warm up lazily initialized state before taking the baseline.
    let _ = engine.start(&missing, &policy);
    let before = open_descriptors();

    for _ in 0..100 {
        assert!(matches!(
            engine.start(&missing, &policy),
            Err(WorkspaceError::Launch(_))
        ));
        assert!(matches!(
            engine.start(&CommandSpec::shell("true"), &bad_cwd),
            Err(WorkspaceError::Launch(_))
        ));
    }

    assert_eq!(open_descriptors(), before);
    assert_no_children_left();
}

fn finished_handles_release_descriptors() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::default();
    let policy = ExecutionPolicy::new("leak", temp.path());

    let mut warmup = engine.start(&CommandSpec::shell("true"), &policy).unwrap();
    while warmup.is_running() {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    warmup.free();
    let before = open_descriptors();

    for _ in 0..20 {
        let mut handle = engine.start(&CommandSpec::shell("echo x"), &policy).unwrap();
        while handle.is_running() {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        // Finalized: both pipes are already closed.
        assert_eq!(open_descriptors(), before);
        handle.kill();
        handle.kill();
        handle.free();
    }

    assert_eq!(open_descriptors(), before);
    assert_no_children_left();
}
