//! Windows raw-device plumbing: the CreateFileW open ladder, the volume
//! lock/dismount IOCTLs, sector-size probing, and Win32 error formatting.
//!
//! Lock and dismount failures downgrade to warnings: the MBR-last write
//! sequencing keeps a half-written disk unmountable even when the volume
//! could not be locked up front.

use std::ffi::c_void;
use std::fs::File;
use std::os::windows::io::FromRawHandle;
use std::ptr;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND,
    ERROR_SHARING_VIOLATION, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetDiskFreeSpaceW, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_NO_BUFFERING,
    FILE_FLAG_WRITE_THROUGH, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Diagnostics::Debug::{
    FormatMessageW, FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS,
};
use windows_sys::Win32::System::Ioctl::{
    FSCTL_ALLOW_EXTENDED_DASD_IO, FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME,
    FSCTL_UNLOCK_VOLUME,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

use super::{FileDisk, Target, DEFAULT_SECTOR_SIZE};
use crate::error::ImagerError;

const OPEN_RETRY_DELAY: Duration = Duration::from_secs(2);
const LOCK_RETRY_DELAY: Duration = Duration::from_secs(2);

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Human-readable text for a Win32 error code.
pub fn format_win32_error(code: u32) -> String {
    let mut buf = [0u16; 512];
    let len = unsafe {
        FormatMessageW(
            FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
            ptr::null(),
            code,
            0,
            buf.as_mut_ptr(),
            buf.len() as u32,
            ptr::null(),
        )
    };
    if len == 0 {
        return format!("error code {code}");
    }
    let text = String::from_utf16_lossy(&buf[..len as usize]);
    format!("error code {code}: {}", text.trim())
}

/// Attach the well-known specializations to a device-open failure.
fn describe_open_failure(code: u32, path: &str) -> String {
    let mut message = format_win32_error(code);
    match code {
        ERROR_ACCESS_DENIED => {
            message.push_str(" - access denied, helper requires administrator privileges");
        }
        ERROR_FILE_NOT_FOUND => {
            message.push_str(&format!(" - device not found, invalid path: {path}"));
        }
        ERROR_SHARING_VIOLATION => {
            message.push_str(" - device is in use by another process");
        }
        _ => {}
    }
    message
}

struct OpenAttempt {
    share: u32,
    flags: u32,
    label: &'static str,
}

fn try_open(path_w: &[u16], attempt: &OpenAttempt) -> Result<HANDLE, u32> {
    let handle = unsafe {
        CreateFileW(
            path_w.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            attempt.share,
            ptr::null(),
            OPEN_EXISTING,
            attempt.flags,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        Err(unsafe { GetLastError() })
    } else {
        Ok(handle)
    }
}

fn device_io(handle: HANDLE, code: u32) -> Result<(), u32> {
    let mut returned: u32 = 0;
    let ok = unsafe {
        DeviceIoControl(
            handle,
            code,
            ptr::null(),
            0,
            ptr::null_mut(),
            0,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        Err(unsafe { GetLastError() })
    } else {
        Ok(())
    }
}

/// Probe the filesystem sector size of a mounted volume.
fn probe_sector_size(letter: char) -> u32 {
    let root = wide(&format!("{letter}:\\"));
    let mut sectors_per_cluster: u32 = 0;
    let mut bytes_per_sector: u32 = 0;
    let mut free_clusters: u32 = 0;
    let mut total_clusters: u32 = 0;
    let ok = unsafe {
        GetDiskFreeSpaceW(
            root.as_ptr(),
            &mut sectors_per_cluster,
            &mut bytes_per_sector,
            &mut free_clusters,
            &mut total_clusters,
        )
    };
    if ok == 0 || bytes_per_sector == 0 {
        warn!(
            "sector size probe failed for {letter}: ({}), using {DEFAULT_SECTOR_SIZE}",
            format_win32_error(unsafe { GetLastError() })
        );
        return DEFAULT_SECTOR_SIZE;
    }
    bytes_per_sector
}

/// Open a write target with the retry ladder, then apply the control
/// IOCTLs. Lock/dismount failures downgrade to warnings.
pub fn open_target(target: &Target) -> Result<FileDisk> {
    let path = target.device_path();
    let path_w = wide(&path);

    let ladder: &[OpenAttempt] = match target {
        Target::Physical { .. } => &[
            OpenAttempt {
                share: FILE_SHARE_READ | FILE_SHARE_WRITE,
                flags: FILE_FLAG_NO_BUFFERING,
                label: "shared read+write, no buffering",
            },
            OpenAttempt {
                share: 0,
                flags: FILE_FLAG_NO_BUFFERING,
                label: "exclusive, no buffering",
            },
            OpenAttempt {
                share: 0,
                flags: FILE_ATTRIBUTE_NORMAL,
                label: "normal attributes",
            },
        ],
        Target::Volume { .. } => &[
            OpenAttempt {
                share: 0,
                flags: FILE_FLAG_WRITE_THROUGH,
                label: "exclusive, write-through",
            },
            OpenAttempt {
                share: FILE_SHARE_READ,
                flags: FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH,
                label: "shared read, no buffering, write-through",
            },
        ],
    };

    let mut handle = None;
    let mut last_code = 0;
    for (i, attempt) in ladder.iter().enumerate() {
        match try_open(&path_w, attempt) {
            Ok(h) => {
                debug!("opened {path} ({})", attempt.label);
                handle = Some(h);
                break;
            }
            Err(code) => {
                last_code = code;
                warn!(
                    "open attempt {} of {path} ({}) failed: {}",
                    i + 1,
                    attempt.label,
                    describe_open_failure(code, &path)
                );
                sleep(OPEN_RETRY_DELAY);
            }
        }
    }
    let handle = handle.ok_or_else(|| ImagerError::Device {
        code: last_code,
        message: describe_open_failure(last_code, &path),
    })?;

    // Allow I/O past the filesystem's idea of the volume end.
    if let Err(code) = device_io(handle, FSCTL_ALLOW_EXTENDED_DASD_IO) {
        warn!("extended DASD I/O not granted: {}", format_win32_error(code));
    }

    let mut locked = device_io(handle, FSCTL_LOCK_VOLUME);
    if locked.is_err() {
        sleep(LOCK_RETRY_DELAY);
        locked = device_io(handle, FSCTL_LOCK_VOLUME);
    }
    match locked {
        Ok(()) => debug!("volume locked"),
        Err(code) => warn!("could not lock volume: {}", format_win32_error(code)),
    }

    if let Err(code) = device_io(handle, FSCTL_DISMOUNT_VOLUME) {
        warn!("could not dismount volume: {}", format_win32_error(code));
    }

    let sector_size = match target {
        Target::Volume { letter } => probe_sector_size(*letter),
        Target::Physical { .. } => DEFAULT_SECTOR_SIZE,
    };

    let file = unsafe { File::from_raw_handle(handle as *mut c_void) };
    Ok(FileDisk::new(file, sector_size))
}

/// Best-effort unlock used when the post-write rescan was skipped.
pub fn unlock_volume_best_effort(target: &Target) {
    let path = target.device_path();
    let path_w = wide(&path);
    let attempt = OpenAttempt {
        share: FILE_SHARE_READ | FILE_SHARE_WRITE,
        flags: FILE_ATTRIBUTE_NORMAL,
        label: "shared, for unlock",
    };
    match try_open(&path_w, &attempt) {
        Ok(handle) => {
            if let Err(code) = device_io(handle, FSCTL_UNLOCK_VOLUME) {
                warn!("could not unlock {path}: {}", format_win32_error(code));
            }
            unsafe { CloseHandle(handle) };
        }
        Err(code) => {
            warn!(
                "could not reopen {path} for unlock: {}",
                format_win32_error(code)
            );
        }
    }
}
