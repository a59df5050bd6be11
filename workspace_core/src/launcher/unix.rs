//! `fork`/`execve` launcher with exec-failure reporting through a status pipe.
//!
//! The status pipe's write end is close-on-exec. After `fork` the parent blocks
//! on the read end: EOF with no bytes means `execve` replaced the child image; four
//! bytes are the child's `errno` from a failed `chdir` or `execve`. Everything the
//! child touches (paths, argv, envp, descriptors) is prepared before `fork`, so the
//! child only makes async-signal-safe calls.

use std::ffi::{CString, c_char};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::{ExitStatus, ProcessBackend, ReadOutcome, Stream};
use crate::error::LaunchError;
use crate::profile::LaunchPlan;

/// Exit status of a child whose exec failed.
const EXEC_FAILED: libc::c_int = 127;

/// NUL-terminated buffers for `execve`, kept until the handle is finalized.
#[derive(Debug)]
struct ArgArena {
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: Option<CString>,
}

impl ArgArena {
    fn build(plan: &LaunchPlan) -> Result<Self, LaunchError> {
        let program = &plan.invocation.program;
        let path = resolve_program(program, &plan.env, plan.cwd.as_deref());

        let argv = plan
            .invocation
            .argv()
            .into_iter()
            .map(cstring)
            .collect::<Result<Vec<_>, _>>()?;
        let envp = plan
            .env
            .iter()
            .map(|(k, v)| cstring(format!("{k}={v}")))
            .collect::<Result<Vec<_>, _>>()?;
        let cwd = plan
            .cwd
            .as_ref()
            .map(|dir| cstring(dir.as_os_str().as_bytes()))
            .transpose()?;

        Ok(Self {
            path: cstring(path.as_os_str().as_bytes())?,
            argv,
            envp,
            cwd,
        })
    }
}

fn cstring(bytes: impl Into<Vec<u8>>) -> Result<CString, LaunchError> {
    CString::new(bytes).map_err(|e| {
        LaunchError::InvalidArgument(String::from_utf8_lossy(&e.into_vec()).into_owned())
    })
}

/// Null-terminated pointer array over `strings`.
fn pointer_array(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Resolve `program` against the child's `PATH` so the child can call plain `execve`.
///
/// Names that cannot be resolved are passed through unchanged; `execve` then fails
/// with `ENOENT`, which is reported through the status pipe like any other exec error.
fn resolve_program(program: &str, env: &[(String, String)], cwd: Option<&Path>) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    let search_path = env
        .iter()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.clone())
        .or_else(|| std::env::var("PATH").ok());
    let cwd = cwd
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));
    which::which_in(program, search_path, cwd).unwrap_or_else(|_| PathBuf::from(program))
}

/// A child started by [`spawn`].
#[derive(Debug)]
pub struct UnixProcess {
    pid: libc::pid_t,
    stdout: Option<File>,
    stderr: Option<File>,
    status: Option<ExitStatus>,
    arena: Option<ArgArena>,
}

/// Fork and exec the plan's invocation.
pub fn spawn(plan: &LaunchPlan) -> Result<UnixProcess, LaunchError> {
    let arena = ArgArena::build(plan)?;
    let argv = pointer_array(&arena.argv);
    let envp = pointer_array(&arena.envp);
    let cwd = arena.cwd.as_ref().map(|c| c.as_ptr());

    let (stdout_read, stdout_write) = pipe("stdout")?;
    let (stderr_read, stderr_write) = pipe("stderr")?;
    let (status_read, status_write) = pipe("exec status")?;
    let stdin = File::open("/dev/null")
        .map(OwnedFd::from)
        .and_then(above_stdio)
        .map_err(|source| LaunchError::Pipe {
            what: "stdin",
            source,
        })?;

    let child = ChildFds {
        stdin: stdin.as_raw_fd(),
        stdout: stdout_write.as_raw_fd(),
        stderr: stderr_write.as_raw_fd(),
        status: status_write.as_raw_fd(),
    };

    // SAFETY: the child branch below only calls async-signal-safe functions on
    // memory prepared before this point, then either execs or `_exit`s.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(LaunchError::Fork(io::Error::last_os_error()));
    }
    if pid == 0 {
        // SAFETY: we are the freshly forked child.
        unsafe { exec_child(&child, arena.path.as_ptr(), &argv, &envp, cwd) }
    }

    // Parent: only the read ends stay open.
    drop(stdin);
    drop(stdout_write);
    drop(stderr_write);
    drop(status_write);

    let program = plan.invocation.program.clone();
    match read_exec_status(status_read) {
        Ok(None) => {}
        Ok(Some(errno)) => {
            let _ = wait_pid(pid);
            return Err(LaunchError::Spawn {
                program,
                source: io::Error::from_raw_os_error(errno),
            });
        }
        Err(source) => {
            // SAFETY: `pid` is our unreaped child.
            unsafe { libc::kill(pid, libc::SIGKILL) };
            let _ = wait_pid(pid);
            return Err(LaunchError::Spawn { program, source });
        }
    }

    let nonblocking = set_nonblocking(&stdout_read).and_then(|()| set_nonblocking(&stderr_read));
    if let Err(source) = nonblocking {
        // SAFETY: `pid` is our unreaped child.
        unsafe { libc::kill(-pid, libc::SIGKILL) };
        let _ = wait_pid(pid);
        return Err(LaunchError::Pipe {
            what: "non-blocking output",
            source,
        });
    }

    tracing::debug!(pid, program = %program, "child exec succeeded");
    Ok(UnixProcess {
        pid,
        stdout: Some(File::from(stdout_read)),
        stderr: Some(File::from(stderr_read)),
        status: None,
        arena: Some(arena),
    })
}

/// Raw descriptors the child wires up before exec.
struct ChildFds {
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
    status: RawFd,
}

/// Child side of the fork. Never returns.
///
/// # Safety
///
/// Must only be called in the child immediately after `fork`, with pointers that
/// stay valid (they live in the parent's copied address space).
unsafe fn exec_child(
    fds: &ChildFds,
    path: *const c_char,
    argv: &[*const c_char],
    envp: &[*const c_char],
    cwd: Option<*const c_char>,
) -> ! {
    unsafe {
        // Own process group, so a kill reaches grandchildren too.
        if libc::setpgid(0, 0) != 0 {
            report_and_exit(fds.status);
        }

        // Rust ignores SIGPIPE; exec keeps ignored dispositions.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

        if libc::dup2(fds.stdin, libc::STDIN_FILENO) < 0
            || libc::dup2(fds.stdout, libc::STDOUT_FILENO) < 0
            || libc::dup2(fds.stderr, libc::STDERR_FILENO) < 0
        {
            report_and_exit(fds.status);
        }

        if let Some(dir) = cwd
            && libc::chdir(dir) != 0
        {
            report_and_exit(fds.status);
        }

        libc::execve(path, argv.as_ptr(), envp.as_ptr());
        report_and_exit(fds.status)
    }
}

/// Write the current `errno` to the status pipe and exit.
unsafe fn report_and_exit(status_fd: RawFd) -> ! {
    let errno = io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL);
    let bytes = errno.to_ne_bytes();
    unsafe {
        libc::write(status_fd, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(EXEC_FAILED)
    }
}

/// `None` when exec succeeded, `Some(errno)` when the child reported a failure.
fn read_exec_status(fd: OwnedFd) -> io::Result<Option<i32>> {
    let mut file = File::from(fd);
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    match filled {
        0 => Ok(None),
        4 => Ok(Some(i32::from_ne_bytes(buf))),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated exec status from child",
        )),
    }
}

/// Close-on-exec pipe whose ends do not collide with the standard descriptors.
fn pipe(what: &'static str) -> Result<(OwnedFd, OwnedFd), LaunchError> {
    let err = |source| LaunchError::Pipe { what, source };
    let (read, write) = cloexec_pipe().map_err(err)?;
    Ok((above_stdio(read).map_err(err)?, above_stdio(write).map_err(err)?))
}

fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    // SAFETY: `fds` has room for two descriptors.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    // SAFETY: `fds` has room for two descriptors.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        set_cloexec(&read)?;
        set_cloexec(&write)?;
    }

    Ok((read, write))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: `fd` is a valid open descriptor.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Move `fd` above 2 when the parent runs with closed standard descriptors,
/// so the child's `dup2` calls cannot clobber each other.
fn above_stdio(fd: OwnedFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() > libc::STDERR_FILENO {
        return Ok(fd);
    }
    // SAFETY: `fd` is valid; the duplicate is owned by the returned OwnedFd.
    let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 3) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is a valid open descriptor for the duration of both calls.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 || libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn decode_status(status: libc::c_int) -> ExitStatus {
    if libc::WIFEXITED(status) {
        ExitStatus::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status))
    } else {
        ExitStatus::Unknown
    }
}

/// Blocking `waitpid`, retried on `EINTR`.
fn wait_pid(pid: libc::pid_t) -> io::Result<ExitStatus> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            return Ok(decode_status(status));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

impl UnixProcess {
    fn stream(&mut self, stream: Stream) -> Option<&mut File> {
        match stream {
            Stream::Stdout => self.stdout.as_mut(),
            Stream::Stderr => self.stderr.as_mut(),
        }
    }

    /// Signal the child's process group, falling back to the child alone.
    fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        // SAFETY: plain syscalls on our own child's pid.
        if unsafe { libc::kill(-self.pid, signal) } == 0 {
            return Ok(());
        }
        if unsafe { libc::kill(self.pid, signal) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

impl ProcessBackend for UnixProcess {
    fn pid(&self) -> u32 {
        self.pid as u32
    }

    fn read(&mut self, stream: Stream, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let Some(file) = self.stream(stream) else {
            return Ok(ReadOutcome::Closed);
        };
        match file.read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadOutcome::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let mut raw: libc::c_int = 0;
        // SAFETY: `raw` is a valid out-pointer.
        let rc = unsafe { libc::waitpid(self.pid, &mut raw, libc::WNOHANG) };
        match rc {
            0 => Ok(None),
            rc if rc == self.pid => {
                let status = decode_status(raw);
                self.status = Some(status);
                Ok(Some(status))
            }
            _ => {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => Ok(None),
                    Some(libc::ECHILD) => {
                        self.status = Some(ExitStatus::Unknown);
                        Err(err)
                    }
                    _ => Err(err),
                }
            }
        }
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = wait_pid(self.pid)?;
        self.status = Some(status);
        Ok(status)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.signal(libc::SIGKILL)
    }

    fn release(&mut self) {
        self.stdout = None;
        self.stderr = None;
        self.arena = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Invocation;
    use crate::profile::ProfileKind;

    fn plan(program: &str, args: &[&str]) -> LaunchPlan {
        LaunchPlan {
            invocation: Invocation::new(program, args.iter().map(|s| s.to_string()).collect()),
            env: vec![(
                "PATH".to_string(),
                "/usr/local/bin:/usr/bin:/bin".to_string(),
            )],
            cwd: None,
            kind: ProfileKind::Host,
            fallback: None,
        }
    }

    fn drain(process: &mut UnixProcess, stream: Stream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match process.read(stream, &mut buf).unwrap() {
                ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
                ReadOutcome::WouldBlock => std::thread::sleep(std::time::Duration::from_millis(2)),
                ReadOutcome::Closed => return out,
            }
        }
    }

    #[test]
    fn resolves_bare_names_on_path() {
        let env = vec![("PATH".to_string(), "/bin:/usr/bin".to_string())];
        let resolved = resolve_program("sh", &env, None);
        assert!(resolved.is_absolute(), "{resolved:?}");
        assert_eq!(
            resolve_program("./local", &env, None),
            PathBuf::from("./local")
        );
        assert_eq!(
            resolve_program("definitely-not-a-program-xyz", &env, None),
            PathBuf::from("definitely-not-a-program-xyz")
        );
    }

    #[test]
    fn interior_nul_is_rejected_before_fork() {
        let err = spawn(&plan("echo", &["a\0b"])).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidArgument(_)));
    }

    #[test]
    fn exec_failure_is_reported_synchronously() {
        let err = spawn(&plan("/nonexistent/binary", &[])).unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[test]
    fn chdir_failure_is_reported_synchronously() {
        let mut p = plan("/bin/sh", &["-c", "true"]);
        p.cwd = Some(PathBuf::from("/nonexistent/dir"));
        let err = spawn(&p).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[test]
    fn captures_output_and_exit_code() {
        let mut child = spawn(&plan("/bin/sh", &["-c", "echo out; echo err >&2; exit 3"])).unwrap();
        assert_eq!(drain(&mut child, Stream::Stdout), b"out\n");
        assert_eq!(drain(&mut child, Stream::Stderr), b"err\n");
        assert_eq!(child.wait().unwrap(), ExitStatus::Exited(3));
        child.release();
        assert_eq!(
            child.read(Stream::Stdout, &mut [0u8; 8]).unwrap(),
            ReadOutcome::Closed
        );
    }

    #[test]
    fn terminate_reports_signal() {
        let mut child = spawn(&plan("/bin/sh", &["-c", "sleep 30"])).unwrap();
        assert_eq!(child.try_wait().unwrap(), None);
        child.terminate().unwrap();
        assert_eq!(child.wait().unwrap(), ExitStatus::Signaled(libc::SIGTERM));
        // Signalling a reaped child is a no-op.
        child.force_kill().unwrap();
    }

    #[test]
    fn environment_is_exactly_the_plan_env() {
        let mut p = plan("/bin/sh", &["-c", "echo \"$ONLY:$HOME\""]);
        p.env.push(("ONLY".to_string(), "yes".to_string()));
        let mut child = spawn(&p).unwrap();
        assert_eq!(drain(&mut child, Stream::Stdout), b"yes:\n");
        child.wait().unwrap();
    }
}
