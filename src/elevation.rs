//! Privilege elevation and helper process lifecycle.
//!
//! The client launches the helper through a [`HelperLauncher`]; on Windows
//! that is `ShellExecuteExW` with the `runas` verb (one UAC prompt), while
//! development builds and tests use a plain process spawn.

use std::path::PathBuf;
use std::process::{Child, Command};

use anyhow::{Context, Result};
use log::debug;

/// Whether this process already has administrator rights.
pub fn is_elevated() -> bool {
    #[cfg(windows)]
    {
        windows_impl::is_elevated()
    }
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(any(windows, unix)))]
    {
        false
    }
}

/// A running helper process owned by the client.
pub trait HelperProcess: Send {
    /// Exit code if the helper has terminated, `None` while it runs.
    fn poll_exit(&mut self) -> Result<Option<i32>>;

    /// Kill the helper.
    fn terminate(&mut self) -> Result<()>;
}

/// Launches the helper executable with the given arguments.
pub trait HelperLauncher: Send {
    fn launch(&self, args: &[String]) -> Result<Box<dyn HelperProcess>>;
}

/// Platform-default launcher: elevated on Windows, plain spawn elsewhere.
pub fn default_launcher(helper_path: PathBuf) -> Box<dyn HelperLauncher> {
    #[cfg(windows)]
    {
        Box::new(windows_impl::ElevatedLauncher { helper_path })
    }
    #[cfg(not(windows))]
    {
        Box::new(SpawnLauncher { helper_path })
    }
}

/// Direct spawn without elevation. Used by development builds and the
/// end-to-end tests, and by callers that are already elevated.
pub struct SpawnLauncher {
    pub helper_path: PathBuf,
}

impl HelperLauncher for SpawnLauncher {
    fn launch(&self, args: &[String]) -> Result<Box<dyn HelperProcess>> {
        debug!("spawning {} {:?}", self.helper_path.display(), args);
        let child = Command::new(&self.helper_path)
            .args(args)
            .spawn()
            .with_context(|| format!("could not spawn {}", self.helper_path.display()))?;
        Ok(Box::new(SpawnedHelper { child }))
    }
}

struct SpawnedHelper {
    child: Child,
}

impl HelperProcess for SpawnedHelper {
    fn poll_exit(&mut self) -> Result<Option<i32>> {
        let status = self.child.try_wait().context("could not poll helper")?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    fn terminate(&mut self) -> Result<()> {
        self.child.kill().context("could not kill helper")?;
        let _ = self.child.wait();
        Ok(())
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::{HelperLauncher, HelperProcess};
    use crate::error::ImagerError;
    use std::path::PathBuf;
    use std::ptr;

    use anyhow::{bail, Result};
    use log::debug;
    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_CANCELLED, ERROR_FILE_NOT_FOUND,
        ERROR_PATH_NOT_FOUND, HANDLE,
    };
    use windows_sys::Win32::Security::{
        GetTokenInformation, OpenProcessToken, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{
        GetCurrentProcess, GetExitCodeProcess, TerminateProcess,
    };
    use windows_sys::Win32::UI::Shell::{ShellExecuteExW, SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
    use windows_sys::Win32::UI::WindowsAndMessaging::SW_HIDE;

    const STILL_ACTIVE: u32 = 259;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub fn is_elevated() -> bool {
        unsafe {
            let mut token: HANDLE = ptr::null_mut();
            if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                return false;
            }
            let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
            let mut returned: u32 = 0;
            let ok = GetTokenInformation(
                token,
                TokenElevation,
                &mut elevation as *mut _ as *mut _,
                std::mem::size_of::<TOKEN_ELEVATION>() as u32,
                &mut returned,
            );
            CloseHandle(token);
            ok != 0 && elevation.TokenIsElevated != 0
        }
    }

    /// Launches the helper through the UAC `runas` verb.
    pub struct ElevatedLauncher {
        pub helper_path: PathBuf,
    }

    impl HelperLauncher for ElevatedLauncher {
        fn launch(&self, args: &[String]) -> Result<Box<dyn HelperProcess>> {
            let parameters = args
                .iter()
                .map(|a| {
                    if a.contains(' ') || a.contains('"') {
                        format!("\"{}\"", a.replace('"', "\\\""))
                    } else {
                        a.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");

            debug!(
                "elevating {} with args: {parameters}",
                self.helper_path.display()
            );

            let file_w = wide(&self.helper_path.display().to_string());
            let params_w = wide(&parameters);
            let verb_w = wide("runas");

            let mut info: SHELLEXECUTEINFOW = unsafe { std::mem::zeroed() };
            info.cbSize = std::mem::size_of::<SHELLEXECUTEINFOW>() as u32;
            info.fMask = SEE_MASK_NOCLOSEPROCESS;
            info.lpVerb = verb_w.as_ptr();
            info.lpFile = file_w.as_ptr();
            info.lpParameters = params_w.as_ptr();
            info.nShow = SW_HIDE;

            let ok = unsafe { ShellExecuteExW(&mut info) };
            if ok == 0 {
                let code = unsafe { GetLastError() };
                let message = match code {
                    ERROR_CANCELLED => "operation cancelled by user".to_string(),
                    ERROR_FILE_NOT_FOUND => format!(
                        "helper executable not found: {}",
                        self.helper_path.display()
                    ),
                    ERROR_PATH_NOT_FOUND => {
                        format!("helper path not found: {}", self.helper_path.display())
                    }
                    ERROR_ACCESS_DENIED => "elevation denied (access denied)".to_string(),
                    other => format!("ShellExecuteEx failed with error {other}"),
                };
                return Err(ImagerError::Elevation(message).into());
            }
            if info.hProcess.is_null() {
                return Err(ImagerError::Elevation(
                    "elevation produced no process handle".to_string(),
                )
                .into());
            }

            Ok(Box::new(ElevatedHelper {
                handle: info.hProcess,
            }))
        }
    }

    struct ElevatedHelper {
        handle: HANDLE,
    }

    // Process handles are process-global kernel objects.
    unsafe impl Send for ElevatedHelper {}

    impl HelperProcess for ElevatedHelper {
        fn poll_exit(&mut self) -> Result<Option<i32>> {
            let mut code: u32 = 0;
            let ok = unsafe { GetExitCodeProcess(self.handle, &mut code) };
            if ok == 0 {
                bail!("GetExitCodeProcess failed with {}", unsafe {
                    GetLastError()
                });
            }
            if code == STILL_ACTIVE {
                Ok(None)
            } else {
                Ok(Some(code as i32))
            }
        }

        fn terminate(&mut self) -> Result<()> {
            let ok = unsafe { TerminateProcess(self.handle, 1) };
            if ok == 0 {
                bail!("TerminateProcess failed with {}", unsafe {
                    GetLastError()
                });
            }
            Ok(())
        }
    }

    impl Drop for ElevatedHelper {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.handle) };
        }
    }
}
