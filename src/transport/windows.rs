//! Windows named pipe transport.
//!
//! The elevated helper binds `\\.\pipe\<name>` with a world-access security
//! descriptor so the non-elevated client can connect. The pipe runs in byte
//! mode; accepts are polled through `PIPE_NOWAIT` and switched to blocking
//! mode once a client is attached, and reads are polled with
//! `PeekNamedPipe` so the event loop never parks inside `ReadFile`.

use std::ffi::c_void;
use std::io;
use std::ptr;

use log::{debug, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, LocalFree, ERROR_BROKEN_PIPE, ERROR_NO_DATA,
    ERROR_PIPE_CONNECTED, ERROR_PIPE_LISTENING, ERROR_PIPE_NOT_CONNECTED, GENERIC_READ,
    GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, ReadFile, WriteFile, OPEN_EXISTING,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PeekNamedPipe,
    SetNamedPipeHandleState, PIPE_ACCESS_DUPLEX, PIPE_NOWAIT, PIPE_READMODE_BYTE,
    PIPE_TYPE_BYTE, PIPE_WAIT,
};

use super::{Listener, Stream};

/// Grants GENERIC_READ + GENERIC_WRITE to Everyone (WD = world).
const WORLD_ACCESS_SDDL: &str = "D:(A;;GRGW;;;WD)";

const PIPE_BUFFER_SIZE: u32 = 64 * 1024;

pub fn endpoint_path(name: &str) -> String {
    format!(r"\\.\pipe\{name}")
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

/// Owned pipe handle. Raw handles are process-global, so moving one across
/// threads is sound even though the pointer type itself is not `Send`.
struct PipeHandle(HANDLE);

unsafe impl Send for PipeHandle {}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        if self.0 != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.0) };
        }
    }
}

pub fn bind(name: &str) -> io::Result<Box<dyn Listener>> {
    // Named pipes vanish with their last handle, so there is no stale
    // endpoint to unlink the way the Unix transport does.
    debug!("binding named pipe {}", endpoint_path(name));
    Ok(Box::new(NamedPipeListener {
        path: wide(&endpoint_path(name)),
        pending: None,
    }))
}

pub fn connect(name: &str) -> io::Result<Box<dyn Stream>> {
    let path = wide(&endpoint_path(name));
    let handle = unsafe {
        CreateFileW(
            path.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            ptr::null(),
            OPEN_EXISTING,
            0,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(last_error());
    }
    Ok(Box::new(NamedPipeStream {
        handle: PipeHandle(handle),
    }))
}

struct NamedPipeListener {
    path: Vec<u16>,
    pending: Option<PipeHandle>,
}

impl NamedPipeListener {
    fn create_instance(&self) -> io::Result<PipeHandle> {
        // World-access descriptor so the non-elevated client can connect.
        let sddl = wide(WORLD_ACCESS_SDDL);
        let mut descriptor: *mut c_void = ptr::null_mut();
        let ok = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl.as_ptr(),
                SDDL_REVISION_1,
                &mut descriptor,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_error());
        }

        let attrs = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: descriptor,
            bInheritHandle: 0,
        };

        let handle = unsafe {
            CreateNamedPipeW(
                self.path.as_ptr(),
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_NOWAIT,
                1,
                PIPE_BUFFER_SIZE,
                PIPE_BUFFER_SIZE,
                0,
                &attrs,
            )
        };
        let err = last_error();
        unsafe { LocalFree(descriptor) };

        if handle == INVALID_HANDLE_VALUE {
            return Err(err);
        }
        Ok(PipeHandle(handle))
    }
}

impl Listener for NamedPipeListener {
    fn accept(&mut self) -> io::Result<Option<Box<dyn Stream>>> {
        if self.pending.is_none() {
            self.pending = Some(self.create_instance()?);
        }
        let instance = self.pending.as_ref().expect("instance created above");

        let connected = unsafe { ConnectNamedPipe(instance.0, ptr::null_mut()) };
        let code = unsafe { GetLastError() };

        if connected != 0 || code == ERROR_PIPE_CONNECTED {
            let instance = self.pending.take().expect("instance present");
            // Back to blocking mode; PIPE_NOWAIT was only for the accept.
            let mode = PIPE_READMODE_BYTE | PIPE_WAIT;
            let ok = unsafe {
                SetNamedPipeHandleState(instance.0, &mode, ptr::null(), ptr::null())
            };
            if ok == 0 {
                warn!("could not restore blocking pipe mode: {}", last_error());
            }
            return Ok(Some(Box::new(NamedPipeStream { handle: instance })));
        }

        match code {
            ERROR_PIPE_LISTENING => Ok(None),
            ERROR_NO_DATA => {
                // A client connected and disconnected before we looked.
                unsafe { DisconnectNamedPipe(instance.0) };
                self.pending = None;
                Ok(None)
            }
            _ => Err(io::Error::from_raw_os_error(code as i32)),
        }
    }
}

struct NamedPipeStream {
    handle: PipeHandle,
}

impl Stream for NamedPipeStream {
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut available: u32 = 0;
        let ok = unsafe {
            PeekNamedPipe(
                self.handle.0,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut available,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            return match code {
                ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer disconnected",
                )),
                _ => Err(io::Error::from_raw_os_error(code as i32)),
            };
        }
        if available == 0 {
            return Ok(0);
        }

        let want = buf.len().min(available as usize) as u32;
        let mut read: u32 = 0;
        let ok = unsafe {
            ReadFile(
                self.handle.0,
                buf.as_mut_ptr(),
                want,
                &mut read,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_error());
        }
        Ok(read as usize)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut written_total = 0usize;
        while written_total < data.len() {
            let mut written: u32 = 0;
            let remaining = &data[written_total..];
            let ok = unsafe {
                WriteFile(
                    self.handle.0,
                    remaining.as_ptr(),
                    remaining.len() as u32,
                    &mut written,
                    ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(last_error());
            }
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "pipe closed during write",
                ));
            }
            written_total += written as usize;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        let ok = unsafe { FlushFileBuffers(self.handle.0) };
        if ok == 0 {
            return Err(last_error());
        }
        Ok(())
    }
}
