//! C ABI over [`crate::bridge`]. See `include/workspace_core.h`.
//!
//! Handles are opaque pointers created by `workspace_start` and released by
//! `workspace_free_handle`. Using a handle after it was freed, freeing it twice,
//! or sharing it between threads without synchronization is undefined behavior.

use std::ffi::{CStr, c_char};
use std::path::PathBuf;
use std::ptr;

use crate::bridge::{self, BridgeRequest};
use crate::handle::ProcessHandle;

/// Launch options. All strings are NUL-terminated UTF-8 owned by the caller and
/// only read during `workspace_start`.
#[repr(C)]
#[derive(Debug)]
pub struct WorkspaceOptionsC {
    /// Shell command text. Required.
    pub command_line: *const c_char,
    /// Workspace root and working directory; may be null.
    pub cwd: *const c_char,
    pub sandbox: bool,
    /// Workspace identifier; `"default"` when null.
    pub id: *const c_char,
    pub allow_network: bool,
}

/// Borrow a C string as UTF-8. `None` for null or invalid UTF-8.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Start a command. Returns null when the options are invalid, the command is
/// rejected, or it could not be started.
///
/// # Safety
///
/// `options` must be null or point to a valid [`WorkspaceOptionsC`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn workspace_start(options: *const WorkspaceOptionsC) -> *mut ProcessHandle {
    let Some(options) = (unsafe { options.as_ref() }) else {
        return ptr::null_mut();
    };
    let Some(command_line) = (unsafe { c_str(options.command_line) }) else {
        tracing::warn!("workspace_start called without a valid command line");
        return ptr::null_mut();
    };

    let mut request = BridgeRequest::new(command_line);
    request.cwd = unsafe { c_str(options.cwd) }.map(PathBuf::from);
    request.sandbox = options.sandbox;
    request.allow_network = options.allow_network;
    if let Some(id) = unsafe { c_str(options.id) } {
        request.workspace_id = id.to_string();
    }

    match std::panic::catch_unwind(|| bridge::start(&request)) {
        Ok(Some(handle)) => Box::into_raw(Box::new(handle)),
        Ok(None) => ptr::null_mut(),
        Err(_) => {
            tracing::error!("panic while starting command");
            ptr::null_mut()
        }
    }
}

/// # Safety
///
/// `handle` must come from `workspace_start` and not be freed; `buf` must be
/// valid for `len` bytes of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn workspace_read_stdout(
    handle: *mut ProcessHandle,
    buf: *mut u8,
    len: usize,
) -> isize {
    unsafe { read_with(handle, buf, len, bridge::read_stdout) }
}

/// # Safety
///
/// Same contract as [`workspace_read_stdout`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn workspace_read_stderr(
    handle: *mut ProcessHandle,
    buf: *mut u8,
    len: usize,
) -> isize {
    unsafe { read_with(handle, buf, len, bridge::read_stderr) }
}

unsafe fn read_with(
    handle: *mut ProcessHandle,
    buf: *mut u8,
    len: usize,
    read: fn(&mut ProcessHandle, &mut [u8]) -> isize,
) -> isize {
    let Some(handle) = (unsafe { handle.as_mut() }) else {
        return 0;
    };
    if buf.is_null() || len == 0 {
        return 0;
    }
    let buf = unsafe { std::slice::from_raw_parts_mut(buf, len) };
    read(handle, buf)
}

/// Returns `true` while the child runs. Once it returns `false` the encoded exit
/// code is written to `exit_code` (when non-null).
///
/// # Safety
///
/// `handle` must come from `workspace_start` and not be freed; `exit_code` must
/// be null or valid for a write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn workspace_is_running(
    handle: *mut ProcessHandle,
    exit_code: *mut i32,
) -> bool {
    let Some(handle) = (unsafe { handle.as_mut() }) else {
        return false;
    };
    let mut code = -1;
    let running = bridge::is_running(handle, &mut code);
    if !running && let Some(out) = unsafe { exit_code.as_mut() } {
        *out = code;
    }
    running
}

/// # Safety
///
/// `handle` must come from `workspace_start` and not be freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn workspace_kill(handle: *mut ProcessHandle) {
    if let Some(handle) = unsafe { handle.as_mut() } {
        bridge::kill(handle);
    }
}

/// # Safety
///
/// `handle` must come from `workspace_start` and must not be used afterwards.
/// Null is ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn workspace_free_handle(handle: *mut ProcessHandle) {
    if handle.is_null() {
        return;
    }
    bridge::free(*unsafe { Box::from_raw(handle) });
}
