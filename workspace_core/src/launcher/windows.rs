//! `CreateProcessW` launcher with anonymous pipes and a kill-on-close job object.
//!
//! Unlike `fork`/`execve`, process creation fails synchronously here, so no status
//! pipe is needed. Under an AppContainer profile the child is created with the
//! restricted token and a `SECURITY_CAPABILITIES` attribute.

use std::ffi::c_void;
use std::io;
use std::mem::size_of;

use windows::Win32::Foundation::{
    BOOL, CloseHandle, ERROR_BROKEN_PIPE, ERROR_NO_DATA, HANDLE, HANDLE_FLAG_INHERIT,
    SetHandleInformation, WAIT_OBJECT_0,
};
use windows::Win32::Security::{SECURITY_ATTRIBUTES, SECURITY_CAPABILITIES};
use windows::Win32::Storage::FileSystem::ReadFile;
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation,
    SetInformationJobObject, TerminateJobObject,
};
use windows::Win32::System::Pipes::{CreatePipe, PeekNamedPipe};
use windows::Win32::System::Threading::{
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, CreateProcessAsUserW, CreateProcessW,
    DeleteProcThreadAttributeList, EXTENDED_STARTUPINFO_PRESENT, GetExitCodeProcess,
    INFINITE, InitializeProcThreadAttributeList, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROCESS_INFORMATION, ResumeThread, STARTF_USESTDHANDLES, STARTUPINFOEXW,
    TerminateProcess, UpdateProcThreadAttribute, WaitForSingleObject,
};
use windows::core::{PCWSTR, PWSTR};

use super::{ExitStatus, ProcessBackend, ReadOutcome, Stream};
use crate::error::LaunchError;
use crate::profile::LaunchPlan;
use crate::profile::windows::AppContainerProfile;

const PROC_THREAD_ATTRIBUTE_SECURITY_CAPABILITIES: usize = 0x0002_0009;

/// Exit code used when the child is terminated from here.
const TERMINATED_EXIT_CODE: u32 = 1;

/// Owned Win32 handle, closed on drop.
#[derive(Debug)]
struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() && !self.0.0.is_null() {
            // SAFETY: the handle is owned and closed exactly once.
            let _ = unsafe { CloseHandle(self.0) };
        }
    }
}

/// Buffers that must outlive `CreateProcess*`, kept until finalize.
#[derive(Debug)]
struct LaunchBuffers {
    command_line: Vec<u16>,
    environment: Vec<u16>,
    cwd: Option<Vec<u16>>,
    container: Option<AppContainerProfile>,
}

#[derive(Debug)]
pub struct WindowsProcess {
    pid: u32,
    process: OwnedHandle,
    job: Option<OwnedHandle>,
    stdout: Option<OwnedHandle>,
    stderr: Option<OwnedHandle>,
    status: Option<ExitStatus>,
    buffers: Option<LaunchBuffers>,
}

// SAFETY: all handles are exclusively owned; Win32 handles may be used from any thread.
unsafe impl Send for WindowsProcess {}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// `KEY=VALUE\0...\0\0` as `CreateProcessW` expects with `CREATE_UNICODE_ENVIRONMENT`.
fn environment_block(env: &[(String, String)]) -> Vec<u16> {
    let mut block = Vec::new();
    for (key, value) in env {
        block.extend(format!("{key}={value}").encode_utf16());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

fn inheritable_pipe(what: &'static str) -> Result<(OwnedHandle, OwnedHandle), LaunchError> {
    let attributes = SECURITY_ATTRIBUTES {
        nLength: size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: true.into(),
    };
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    // SAFETY: out-pointers are valid; attributes outlive the call.
    unsafe { CreatePipe(&mut read, &mut write, Some(&attributes), 0) }
        .map_err(|e| LaunchError::Pipe { what, source: e.into() })?;
    let (read, write) = (OwnedHandle(read), OwnedHandle(write));
    // The parent's end must not leak into the child.
    // SAFETY: `read` is a valid handle we own.
    unsafe { SetHandleInformation(read.raw(), HANDLE_FLAG_INHERIT.0, Default::default()) }
        .map_err(|e| LaunchError::Pipe { what, source: e.into() })?;
    Ok((read, write))
}

fn kill_on_close_job() -> io::Result<OwnedHandle> {
    // SAFETY: creating an anonymous job object.
    let job = OwnedHandle(unsafe { CreateJobObjectW(None, PCWSTR::null()) }?);
    let mut limits = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
    limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
    // SAFETY: `limits` is the structure the information class expects.
    unsafe {
        SetInformationJobObject(
            job.raw(),
            JobObjectExtendedLimitInformation,
            &limits as *const _ as *const c_void,
            size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    }?;
    Ok(job)
}

pub fn spawn(plan: LaunchPlan) -> Result<WindowsProcess, LaunchError> {
    let program = plan.invocation.program.clone();
    let spawn_err = |source: io::Error| LaunchError::Spawn {
        program: program.clone(),
        source,
    };

    let mut buffers = LaunchBuffers {
        command_line: wide(&plan.invocation.windows_command_line()),
        environment: environment_block(&plan.env),
        cwd: plan.cwd.as_ref().map(|dir| wide(&dir.to_string_lossy())),
        container: plan.container,
    };

    let (stdout_read, stdout_write) = inheritable_pipe("stdout")?;
    let (stderr_read, stderr_write) = inheritable_pipe("stderr")?;

    let mut startup = STARTUPINFOEXW::default();
    startup.StartupInfo.cb = size_of::<STARTUPINFOEXW>() as u32;
    startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
    startup.StartupInfo.hStdInput = HANDLE::default();
    startup.StartupInfo.hStdOutput = stdout_write.raw();
    startup.StartupInfo.hStdError = stderr_write.raw();

    let mut flags = CREATE_UNICODE_ENVIRONMENT | CREATE_SUSPENDED;
    let mut attribute_storage: Vec<u8> = Vec::new();
    let mut capabilities = SECURITY_CAPABILITIES::default();

    if let Some(container) = buffers.container.as_mut() {
        capabilities.AppContainerSid = container.sid();
        let caps = container.capabilities_mut();
        capabilities.CapabilityCount = caps.len() as u32;
        if !caps.is_empty() {
            capabilities.Capabilities = caps.as_mut_ptr();
        }

        let mut size = 0usize;
        // SAFETY: size query with a null list is the documented first call.
        let _ = unsafe {
            InitializeProcThreadAttributeList(LPPROC_THREAD_ATTRIBUTE_LIST::default(), 1, 0, &mut size)
        };
        attribute_storage = vec![0u8; size];
        let list = LPPROC_THREAD_ATTRIBUTE_LIST(attribute_storage.as_mut_ptr().cast());
        // SAFETY: `attribute_storage` has the size reported above.
        unsafe { InitializeProcThreadAttributeList(list, 1, 0, &mut size) }
            .map_err(|e| spawn_err(e.into()))?;
        // SAFETY: `capabilities` and the SIDs it points to outlive CreateProcessAsUserW.
        unsafe {
            UpdateProcThreadAttribute(
                list,
                0,
                PROC_THREAD_ATTRIBUTE_SECURITY_CAPABILITIES,
                Some(&capabilities as *const _ as *const c_void),
                size_of::<SECURITY_CAPABILITIES>(),
                None,
                None,
            )
        }
        .map_err(|e| spawn_err(e.into()))?;
        startup.lpAttributeList = list;
        flags |= EXTENDED_STARTUPINFO_PRESENT;
    }

    let cwd = buffers
        .cwd
        .as_ref()
        .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr()));
    let mut info = PROCESS_INFORMATION::default();

    // SAFETY: every pointer refers to a buffer owned by `buffers`, `startup` or
    // `capabilities`, all alive until after the call.
    let created = unsafe {
        match buffers.container.as_ref() {
            Some(container) => CreateProcessAsUserW(
                container.token(),
                PCWSTR::null(),
                PWSTR(buffers.command_line.as_mut_ptr()),
                None,
                None,
                BOOL::from(true),
                flags,
                Some(buffers.environment.as_ptr().cast()),
                cwd,
                &startup.StartupInfo,
                &mut info,
            ),
            None => CreateProcessW(
                PCWSTR::null(),
                PWSTR(buffers.command_line.as_mut_ptr()),
                None,
                None,
                BOOL::from(true),
                flags,
                Some(buffers.environment.as_ptr().cast()),
                cwd,
                &startup.StartupInfo,
                &mut info,
            ),
        }
    };

    if !startup.lpAttributeList.0.is_null() {
        // SAFETY: initialized above and deleted once.
        unsafe { DeleteProcThreadAttributeList(startup.lpAttributeList) };
    }
    drop(attribute_storage);
    created.map_err(|e| spawn_err(e.into()))?;

    // The child owns the write ends now.
    drop(stdout_write);
    drop(stderr_write);

    let process = OwnedHandle(info.hProcess);
    let thread = OwnedHandle(info.hThread);

    let job = match kill_on_close_job() {
        Ok(job) => {
            // SAFETY: both handles are valid.
            match unsafe { AssignProcessToJobObject(job.raw(), process.raw()) } {
                Ok(()) => Some(job),
                Err(e) => {
                    tracing::debug!("cannot assign child to job object: {e}");
                    None
                }
            }
        }
        Err(e) => {
            tracing::debug!("cannot create job object: {e}");
            None
        }
    };

    // SAFETY: the primary thread was created suspended.
    unsafe { ResumeThread(thread.raw()) };
    drop(thread);

    tracing::debug!(pid = info.dwProcessId, program = %program, "child created");
    Ok(WindowsProcess {
        pid: info.dwProcessId,
        process,
        job,
        stdout: Some(stdout_read),
        stderr: Some(stderr_read),
        status: None,
        buffers: Some(buffers),
    })
}

impl WindowsProcess {
    fn pipe(&self, stream: Stream) -> Option<&OwnedHandle> {
        match stream {
            Stream::Stdout => self.stdout.as_ref(),
            Stream::Stderr => self.stderr.as_ref(),
        }
    }

    fn exit_code(&self) -> io::Result<ExitStatus> {
        let mut code = 0u32;
        // SAFETY: `code` is a valid out-pointer.
        unsafe { GetExitCodeProcess(self.process.raw(), &mut code) }?;
        Ok(ExitStatus::Exited(code as i32))
    }

    fn terminate_tree(&mut self) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        // SAFETY: handles are valid until release.
        let result = match &self.job {
            Some(job) => unsafe { TerminateJobObject(job.raw(), TERMINATED_EXIT_CODE) },
            None => unsafe { TerminateProcess(self.process.raw(), TERMINATED_EXIT_CODE) },
        };
        result.map_err(io::Error::from)
    }
}

impl ProcessBackend for WindowsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn read(&mut self, stream: Stream, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let Some(pipe) = self.pipe(stream) else {
            return Ok(ReadOutcome::Closed);
        };
        let mut available = 0u32;
        // SAFETY: peek without copying; only the availability count is written.
        if let Err(e) = unsafe {
            PeekNamedPipe(pipe.raw(), None, 0, None, Some(&mut available), None)
        } {
            return if e.code() == ERROR_BROKEN_PIPE.to_hresult() {
                Ok(ReadOutcome::Closed)
            } else {
                Err(e.into())
            };
        }
        if available == 0 {
            return Ok(ReadOutcome::WouldBlock);
        }

        let want = buf.len().min(available as usize);
        let mut read = 0u32;
        // SAFETY: at least `want` bytes are available, so ReadFile does not block.
        match unsafe { ReadFile(pipe.raw(), Some(&mut buf[..want]), Some(&mut read), None) } {
            Ok(()) if read == 0 => Ok(ReadOutcome::WouldBlock),
            Ok(()) => Ok(ReadOutcome::Data(read as usize)),
            Err(e)
                if e.code() == ERROR_BROKEN_PIPE.to_hresult()
                    || e.code() == ERROR_NO_DATA.to_hresult() =>
            {
                Ok(ReadOutcome::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        // SAFETY: zero timeout, never blocks.
        if unsafe { WaitForSingleObject(self.process.raw(), 0) } != WAIT_OBJECT_0 {
            return Ok(None);
        }
        let status = self.exit_code()?;
        self.status = Some(status);
        Ok(Some(status))
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        // SAFETY: waits on our own process handle.
        unsafe { WaitForSingleObject(self.process.raw(), INFINITE) };
        let status = self.exit_code()?;
        self.status = Some(status);
        Ok(status)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.terminate_tree()
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.terminate_tree()
    }

    fn release(&mut self) {
        self.stdout = None;
        self.stderr = None;
        self.job = None;
        self.buffers = None;
    }
}
