//! Windows isolation: an AppContainer profile per workspace plus a restricted token.
//!
//! Every Win32 failure is reported as [`WorkspaceError::SandboxUnavailable`] so the
//! engine can decide between falling back and refusing.

use windows::Win32::Foundation::{CloseHandle, HANDLE, HLOCAL, LocalFree};
use windows::Win32::Security::Isolation::{
    CreateAppContainerProfile, DeriveAppContainerSidFromAppContainerName,
};
use windows::Win32::Security::{
    CreateRestrictedToken, CreateWellKnownSid, DISABLE_MAX_PRIVILEGE, FreeSid, PSID,
    SE_GROUP_ENABLED, SID_AND_ATTRIBUTES, SECURITY_MAX_SID_SIZE, TOKEN_ADJUST_DEFAULT,
    TOKEN_ASSIGN_PRIMARY, TOKEN_DUPLICATE, TOKEN_QUERY, WinCapabilityInternetClientSid,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use windows::core::{HSTRING, PCWSTR};

use crate::error::{Result, WorkspaceError};
use crate::policy::ExecutionPolicy;

/// HRESULT_FROM_WIN32(ERROR_ALREADY_EXISTS).
const PROFILE_ALREADY_EXISTS: i32 = 0x800700B7_u32 as i32;

/// Container SID, freed with the API that allocated it.
#[derive(Debug)]
struct ContainerSid {
    sid: PSID,
    from_create: bool,
}

impl Drop for ContainerSid {
    fn drop(&mut self) {
        if self.sid.0.is_null() {
            return;
        }
        // SAFETY: the SID was returned by CreateAppContainerProfile or
        // DeriveAppContainerSidFromAppContainerName and is freed exactly once.
        unsafe {
            if self.from_create {
                FreeSid(self.sid);
            } else {
                let _ = LocalFree(HLOCAL(self.sid.0));
            }
        }
    }
}

/// AppContainer identity and restricted token for one launch.
///
/// Owned by the process handle until finalization, which releases the token
/// and both SIDs.
#[derive(Debug)]
pub struct AppContainerProfile {
    pub name: String,
    container: ContainerSid,
    token: HANDLE,
    capability_sid: Option<Box<[u8]>>,
    capabilities: Vec<SID_AND_ATTRIBUTES>,
}

// SAFETY: the raw SID and token are exclusively owned by this value and only
// touched through `&mut self` or `Drop`.
unsafe impl Send for AppContainerProfile {}

impl AppContainerProfile {
    pub fn build(policy: &ExecutionPolicy) -> Result<Self> {
        let name = format!("{}_workspace", policy.workspace_id);
        let container = container_sid(&name)?;
        let token = restricted_token()?;

        let mut profile = Self {
            name,
            container,
            token,
            capability_sid: None,
            capabilities: Vec::new(),
        };
        if policy.allow_network {
            profile.grant_internet_client()?;
        }
        tracing::debug!(container = %profile.name, network = policy.allow_network, "AppContainer profile ready");
        Ok(profile)
    }

    pub fn token(&self) -> HANDLE {
        self.token
    }

    pub fn sid(&self) -> PSID {
        self.container.sid
    }

    /// Capability list for `SECURITY_CAPABILITIES`; the pointers stay valid for
    /// the lifetime of `self`.
    pub fn capabilities_mut(&mut self) -> &mut [SID_AND_ATTRIBUTES] {
        &mut self.capabilities
    }

    fn grant_internet_client(&mut self) -> Result<()> {
        let mut buffer = vec![0u8; SECURITY_MAX_SID_SIZE as usize].into_boxed_slice();
        let mut size = buffer.len() as u32;
        // SAFETY: `buffer` is SECURITY_MAX_SID_SIZE bytes and `size` reports it.
        unsafe {
            CreateWellKnownSid(
                WinCapabilityInternetClientSid,
                PSID::default(),
                PSID(buffer.as_mut_ptr().cast()),
                &mut size,
            )
        }
        .map_err(|e| unavailable("CreateWellKnownSid", e))?;

        self.capabilities.push(SID_AND_ATTRIBUTES {
            Sid: PSID(buffer.as_mut_ptr().cast()),
            Attributes: SE_GROUP_ENABLED as u32,
        });
        self.capability_sid = Some(buffer);
        Ok(())
    }
}

impl Drop for AppContainerProfile {
    fn drop(&mut self) {
        if !self.token.is_invalid() {
            // SAFETY: the token was opened by `restricted_token` and is closed once.
            let _ = unsafe { CloseHandle(self.token) };
        }
    }
}

fn container_sid(name: &str) -> Result<ContainerSid> {
    let wide = HSTRING::from(name);
    let description = HSTRING::from("Workspace sandbox");
    // SAFETY: all strings outlive the call.
    match unsafe {
        CreateAppContainerProfile(
            PCWSTR(wide.as_ptr()),
            PCWSTR(wide.as_ptr()),
            PCWSTR(description.as_ptr()),
            None,
        )
    } {
        Ok(sid) => Ok(ContainerSid {
            sid,
            from_create: true,
        }),
        Err(e) if e.code().0 == PROFILE_ALREADY_EXISTS => {
            tracing::debug!(container = name, "reusing existing AppContainer profile");
            // SAFETY: `wide` outlives the call.
            let sid = unsafe { DeriveAppContainerSidFromAppContainerName(PCWSTR(wide.as_ptr())) }
                .map_err(|e| unavailable("DeriveAppContainerSidFromAppContainerName", e))?;
            Ok(ContainerSid {
                sid,
                from_create: false,
            })
        }
        Err(e) => Err(unavailable("CreateAppContainerProfile", e)),
    }
}

fn restricted_token() -> Result<HANDLE> {
    let mut process_token = HANDLE::default();
    // SAFETY: the pseudo handle from GetCurrentProcess needs no cleanup.
    unsafe {
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_DUPLICATE | TOKEN_ASSIGN_PRIMARY | TOKEN_QUERY | TOKEN_ADJUST_DEFAULT,
            &mut process_token,
        )
    }
    .map_err(|e| unavailable("OpenProcessToken", e))?;

    let mut restricted = HANDLE::default();
    // SAFETY: `process_token` is valid until closed below.
    let result = unsafe {
        CreateRestrictedToken(
            process_token,
            DISABLE_MAX_PRIVILEGE,
            None,
            None,
            None,
            &mut restricted,
        )
    };
    // SAFETY: opened above, closed once.
    let _ = unsafe { CloseHandle(process_token) };
    result.map_err(|e| unavailable("CreateRestrictedToken", e))?;
    Ok(restricted)
}

fn unavailable(call: &str, error: windows::core::Error) -> WorkspaceError {
    WorkspaceError::SandboxUnavailable(format!("{call} failed: {error}"))
}
