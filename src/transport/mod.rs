//! Local-socket transport between the client and the elevated helper.
//!
//! On Windows the endpoint is a named pipe (`\\.\pipe\<name>`) bound with a
//! world-access security descriptor, since the elevated helper owns the pipe
//! and the non-elevated client must be able to connect. On Unix a domain
//! socket in the temp directory stands in, which is what the development
//! builds and the end-to-end tests run against.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as imp;
#[cfg(windows)]
use windows as imp;

/// Default socket name when none is configured.
pub const DEFAULT_SOCKET_NAME: &str = "rpihelperlocalsocket";

/// One side of an established local-socket connection.
///
/// Reads are polled: [`Stream::poll_read`] returns `Ok(0)` when no bytes are
/// currently available and an error once the peer has gone away. This keeps
/// the single-threaded event loops on both sides from blocking indefinitely.
pub trait Stream: Send {
    /// Read whatever is available right now, up to `buf.len()` bytes.
    ///
    /// `Ok(0)` means "nothing available yet", not end-of-stream; a
    /// disconnected peer surfaces as `Err` of kind `UnexpectedEof`.
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// A bound server endpoint accepting at most one client at a time.
pub trait Listener: Send {
    /// Accept a pending client if one is waiting. Non-blocking.
    fn accept(&mut self) -> io::Result<Option<Box<dyn Stream>>>;
}

/// Bind the server side of the socket, removing any stale endpoint of the
/// same name first.
pub fn bind(name: &str) -> io::Result<Box<dyn Listener>> {
    imp::bind(name)
}

/// Connect to a helper already listening on `name`.
pub fn connect(name: &str) -> io::Result<Box<dyn Stream>> {
    imp::connect(name)
}

/// The OS-level path backing a socket name, for diagnostics.
pub fn endpoint_path(name: &str) -> String {
    imp::endpoint_path(name)
}
