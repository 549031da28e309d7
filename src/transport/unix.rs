//! Unix domain socket transport.
//!
//! Mirrors what the helper needs from a Windows named pipe: a single
//! world-connectable endpoint with non-blocking accept and polled reads.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use log::debug;

use super::{Listener, Stream};

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.sock"))
}

pub fn endpoint_path(name: &str) -> String {
    socket_path(name).display().to_string()
}

pub fn bind(name: &str) -> io::Result<Box<dyn Listener>> {
    let path = socket_path(name);
    // Remove any stale socket from a previous run; bind would fail otherwise.
    let _ = fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    // Allow a non-privileged client to connect to the elevated helper.
    fs::set_permissions(&path, fs::Permissions::from_mode(0o666))?;
    listener.set_nonblocking(true)?;
    debug!("bound local socket {}", path.display());

    Ok(Box::new(UnixSocketListener { listener, path }))
}

pub fn connect(name: &str) -> io::Result<Box<dyn Stream>> {
    let stream = UnixStream::connect(socket_path(name))?;
    stream.set_nonblocking(true)?;
    Ok(Box::new(UnixSocketStream { stream }))
}

struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl Listener for UnixSocketListener {
    fn accept(&mut self) -> io::Result<Option<Box<dyn Stream>>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(true)?;
                Ok(Some(Box::new(UnixSocketStream { stream })))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

struct UnixSocketStream {
    stream: UnixStream,
}

impl Stream for UnixSocketStream {
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer disconnected",
            )),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        // The stream is in non-blocking mode for reads; writes must still
        // complete fully, so spin on WouldBlock with a short sleep.
        let mut written = 0;
        while written < data.len() {
            match self.stream.write(&data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket closed during write",
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
