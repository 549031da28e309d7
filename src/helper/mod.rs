//! The elevated helper service: accepts one client over the local socket,
//! performs the HELLO/READY handshake, and dispatches commands.
//!
//! The whole service is a single-threaded cooperative loop. Long-running
//! operations emit progress between 10 MiB chunks through the reporter, so
//! frames interleave with device I/O without a second thread.

pub mod command;
pub mod progress;

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};

use crate::customize;
use crate::error::ImagerError;
use crate::fat::FatVolume;
use crate::format;
use crate::protocol::{
    encode_text, Frame, FrameReader, ProgressKind, TOKEN_FAILURE, TOKEN_HELLO, TOKEN_READY,
    TOKEN_SUCCESS,
};
use crate::transport::{self, Listener, Stream};
use crate::verify;
use crate::writer::{self, WriteSummary};
use command::{parse_command, HelperCommand};
use progress::ProgressReporter;

/// How long the helper waits for the client's READY.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// A handshake state older than this is force-reset.
const STUCK_STATE_LIMIT: Duration = Duration::from_secs(10);
/// Event-loop nap when nothing is pending.
const IDLE_SLEEP: Duration = Duration::from_millis(20);

const SIGNAL_FILE_NAME: &str = "rpi-imager-helper-running.txt";

/// Connection state of the helper side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    Idle,
    Connected,
    HandshakeSending,
    HandshakeReceiving,
    Ready,
    Processing,
    Error,
}

/// One step of the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStep {
    Continue,
    Exit(i32),
}

pub struct HelperService {
    socket_name: String,
    listener: Box<dyn Listener>,
    daemon: bool,
    state: HelperState,
    state_since: Instant,
    client: Option<Box<dyn Stream>>,
    frames: FrameReader,
    reporter: ProgressReporter,
    current_command: Option<String>,
    last_write: Option<WriteSummary>,
    shutdown_requested: bool,
    had_client: bool,
    signal_file: Option<PathBuf>,
}

impl HelperService {
    /// Bind the helper socket (removing any stale endpoint) and start in
    /// `Idle`.
    pub fn bind(socket_name: &str, daemon: bool) -> Result<Self> {
        let listener = transport::bind(socket_name)
            .with_context(|| format!("cannot bind helper socket {socket_name:?}"))?;
        info!(
            "helper listening on {}",
            transport::endpoint_path(socket_name)
        );
        Ok(Self::with_listener(listener, socket_name, daemon))
    }

    /// Build a service around an existing listener. Tests inject in-memory
    /// transports through this.
    pub fn with_listener(listener: Box<dyn Listener>, socket_name: &str, daemon: bool) -> Self {
        Self {
            socket_name: socket_name.to_string(),
            listener,
            daemon,
            state: HelperState::Idle,
            state_since: Instant::now(),
            client: None,
            frames: FrameReader::new(),
            reporter: ProgressReporter::new(),
            current_command: None,
            last_write: None,
            shutdown_requested: false,
            had_client: false,
            signal_file: None,
        }
    }

    pub fn state(&self) -> HelperState {
        self.state
    }

    pub fn current_command(&self) -> Option<&str> {
        self.current_command.as_deref()
    }

    /// Run the event loop until SHUTDOWN or client disconnect.
    pub fn run(&mut self) -> Result<i32> {
        if self.daemon {
            self.write_signal_file();
        }

        let code = loop {
            match self.poll_once() {
                ServiceStep::Continue => {}
                ServiceStep::Exit(code) => break code,
            }
        };

        self.remove_signal_file();
        Ok(code)
    }

    /// Advance the state machine by one step.
    pub fn poll_once(&mut self) -> ServiceStep {
        self.force_reset_if_stuck();

        match self.state {
            HelperState::Idle => self.step_idle(),
            HelperState::Connected => self.step_connected(),
            // Sends are synchronous; these states are only ever observed
            // between the sub-steps of a single poll.
            HelperState::HandshakeSending => {
                self.set_state(HelperState::HandshakeReceiving);
                ServiceStep::Continue
            }
            HelperState::HandshakeReceiving => self.step_handshake_receiving(),
            HelperState::Ready => self.step_ready(),
            HelperState::Processing => ServiceStep::Continue,
            HelperState::Error => self.step_error(),
        }
    }

    fn step_idle(&mut self) -> ServiceStep {
        match self.listener.accept() {
            Ok(Some(stream)) => {
                // At most one client: a newcomer replaces nobody, because a
                // connected client keeps the single pipe instance occupied.
                self.client = Some(stream);
                self.frames = FrameReader::new();
                self.reporter = ProgressReporter::new();
                self.had_client = true;
                info!("client connected");
                self.set_state(HelperState::Connected);
            }
            Ok(None) => std::thread::sleep(IDLE_SLEEP),
            Err(e) => {
                error!("accept failed: {e}");
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        ServiceStep::Continue
    }

    fn step_connected(&mut self) -> ServiceStep {
        self.set_state(HelperState::HandshakeSending);
        match self.send_text(TOKEN_HELLO) {
            Ok(()) => {
                self.set_state(HelperState::HandshakeReceiving);
                ServiceStep::Continue
            }
            Err(e) => {
                error!("could not send HELLO: {e}");
                self.enter_error();
                ServiceStep::Continue
            }
        }
    }

    fn step_handshake_receiving(&mut self) -> ServiceStep {
        if self.state_since.elapsed() > HANDSHAKE_TIMEOUT {
            warn!("handshake timed out waiting for READY");
            self.enter_error();
            return ServiceStep::Continue;
        }
        match self.poll_frame() {
            Ok(Some(Frame::Text(token))) if token == TOKEN_READY => {
                self.set_state(HelperState::Ready);
            }
            Ok(Some(frame)) => {
                warn!("unexpected frame during handshake: {frame:?}");
                self.enter_error();
            }
            Ok(None) => std::thread::sleep(IDLE_SLEEP),
            Err(e) => {
                warn!("handshake receive failed: {e}");
                self.enter_error();
            }
        }
        ServiceStep::Continue
    }

    fn step_ready(&mut self) -> ServiceStep {
        match self.poll_frame() {
            Ok(Some(Frame::Text(line))) => {
                info!("command received: {}", summarize(&line));
                self.current_command = Some(line.clone());
                self.set_state(HelperState::Processing);

                let success = self.dispatch(&line);
                let token = if success { TOKEN_SUCCESS } else { TOKEN_FAILURE };
                let sent = self.send_text(token);

                self.current_command = None;
                if self.shutdown_requested {
                    info!("shutting down on request");
                    return ServiceStep::Exit(0);
                }
                match sent {
                    Ok(()) => self.set_state(HelperState::Ready),
                    Err(e) => {
                        error!("could not send completion token: {e}");
                        self.enter_error();
                    }
                }
                ServiceStep::Continue
            }
            Ok(Some(frame)) => {
                warn!("client sent a non-command frame: {frame:?}");
                self.enter_error();
                ServiceStep::Continue
            }
            Ok(None) => {
                std::thread::sleep(IDLE_SLEEP);
                ServiceStep::Continue
            }
            Err(e) if is_disconnect(&e) => {
                info!("client disconnected");
                self.reset();
                if self.daemon {
                    // An orphaned elevated helper must not linger.
                    ServiceStep::Exit(0)
                } else {
                    ServiceStep::Continue
                }
            }
            Err(e) => {
                warn!("receive failed: {e}");
                self.enter_error();
                ServiceStep::Continue
            }
        }
    }

    fn step_error(&mut self) -> ServiceStep {
        self.reset();
        if self.daemon && self.had_client {
            // The connection is gone either way; exit rather than orphan an
            // elevated process nobody is talking to.
            ServiceStep::Exit(1)
        } else {
            ServiceStep::Continue
        }
    }

    /// Reset a handshake that has been stuck past its deadline.
    fn force_reset_if_stuck(&mut self) {
        let stuck = matches!(
            self.state,
            HelperState::Connected
                | HelperState::HandshakeSending
                | HelperState::HandshakeReceiving
        ) && self.state_since.elapsed() > STUCK_STATE_LIMIT;
        if stuck {
            warn!("handshake stuck in {:?}, resetting", self.state);
            self.reset();
        }
    }

    fn set_state(&mut self, new: HelperState) {
        if self.state != new {
            debug!("helper state {:?} -> {new:?}", self.state);
            self.state = new;
            self.state_since = Instant::now();
        }
    }

    fn enter_error(&mut self) {
        self.set_state(HelperState::Error);
    }

    fn reset(&mut self) {
        self.client = None;
        self.frames = FrameReader::new();
        self.current_command = None;
        self.set_state(HelperState::Idle);
    }

    fn send_text(&mut self, token: &str) -> io::Result<()> {
        let stream = self
            .client
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no client"))?;
        stream.write_all(&encode_text(token))?;
        stream.flush()
    }

    /// Pull buffered or freshly arrived bytes and decode one frame.
    fn poll_frame(&mut self) -> Result<Option<Frame>, ImagerError> {
        if let Some(frame) = self.frames.next_frame()? {
            return Ok(Some(frame));
        }
        let stream = self.client.as_mut().ok_or(ImagerError::NotConnected)?;
        let mut buf = [0u8; 4096];
        let n = stream.poll_read(&mut buf)?;
        if n > 0 {
            self.frames.extend(&buf[..n]);
        }
        self.frames.next_frame()
    }

    /// Execute one command line; the return value becomes SUCCESS/FAILURE.
    fn dispatch(&mut self, line: &str) -> bool {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("rejected command: {e}");
                return false;
            }
        };

        match command {
            HelperCommand::Shutdown => {
                self.shutdown_requested = true;
                true
            }
            HelperCommand::Format { device } => match format::format_drive(&device) {
                Ok(()) => true,
                Err(e) => {
                    error!("format failed: {e:#}");
                    false
                }
            },
            HelperCommand::Write { device, source } => self.run_write(&device, &source),
            HelperCommand::Verify {
                device,
                source,
                expected_hash,
            } => self.run_verify(&device, &source, &expected_hash),
            HelperCommand::Customize { device, custom } => self.run_customize(&device, &custom),
        }
    }

    fn run_write(&mut self, device: &str, source: &str) -> bool {
        let mut stream = match self.client.take() {
            Some(stream) => stream,
            None => return false,
        };
        let reporter = &mut self.reporter;

        let result = writer::write_image_file(device, Path::new(source), &mut |now, total| {
            reporter.tick(
                stream.as_mut(),
                ProgressKind::Write,
                now as i64,
                total as i64,
            );
        });

        let success = match result {
            Ok(summary) => {
                reporter.force(
                    stream.as_mut(),
                    ProgressKind::Write,
                    summary.bytes_total as i64,
                    summary.bytes_total as i64,
                );
                info!(
                    "write complete: {} bytes, sha256 {}",
                    summary.bytes_total, summary.source_hash
                );
                self.last_write = Some(summary);
                true
            }
            Err(e) => {
                error!("write failed: {e:#}");
                false
            }
        };
        self.client = Some(stream);
        success
    }

    fn run_verify(&mut self, device: &str, source: &str, expected_hash: &str) -> bool {
        let expected = if !expected_hash.is_empty() {
            expected_hash.to_string()
        } else if let Some(last) = &self.last_write {
            last.source_hash.clone()
        } else {
            warn!("VERIFY without an expected hash and no preceding write");
            return false;
        };

        let bytes_total = match fs::metadata(source) {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!("cannot stat source {source:?}: {e}");
                return false;
            }
        };

        let path = resolve_device_path(device);
        let mut dev = match OpenOptions::new().read(true).open(&path) {
            Ok(dev) => dev,
            Err(e) => {
                error!("cannot open {path:?} for verification: {e}");
                return false;
            }
        };

        let mut stream = match self.client.take() {
            Some(stream) => stream,
            None => return false,
        };
        let reporter = &mut self.reporter;

        let result = verify::verify_device(&mut dev, bytes_total, &expected, &mut |now, total| {
            reporter.tick(
                stream.as_mut(),
                ProgressKind::Verify,
                now as i64,
                total as i64,
            );
        });
        reporter.force(
            stream.as_mut(),
            ProgressKind::Verify,
            bytes_total as i64,
            bytes_total as i64,
        );
        self.client = Some(stream);

        match result {
            Ok(matched) => matched,
            Err(e) => {
                error!("verification failed to run: {e:#}");
                false
            }
        }
    }

    fn run_customize(&mut self, device: &str, custom: &customize::Customization) -> bool {
        if custom.is_empty() {
            debug!("customization is empty, nothing to do");
            return true;
        }

        let path = resolve_device_path(device);
        let dev = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(dev) => dev,
            Err(e) => {
                error!("cannot open {path:?} for customization: {e}");
                return false;
            }
        };

        let mut volume = match FatVolume::open_boot_partition(dev) {
            Ok(volume) => volume,
            Err(e) => {
                error!("no FAT boot partition on {path:?}: {e:#}");
                return false;
            }
        };

        match customize::apply(custom, &mut volume) {
            Ok(()) => true,
            Err(e) => {
                error!("customization failed: {e:#}");
                false
            }
        }
    }

    fn write_signal_file(&mut self) {
        let dir = dirs::document_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join("Documents")))
            .unwrap_or_else(std::env::temp_dir);
        let path = dir.join(SIGNAL_FILE_NAME);
        let contents = format!(
            "socket: {}\npid: {}\nstarted: {}\n",
            self.socket_name,
            std::process::id(),
            Utc::now().to_rfc3339(),
        );
        match fs::write(&path, contents) {
            Ok(()) => {
                debug!("daemon signal file at {}", path.display());
                self.signal_file = Some(path);
            }
            Err(e) => warn!("could not write signal file {}: {e}", path.display()),
        }
    }

    fn remove_signal_file(&mut self) {
        if let Some(path) = self.signal_file.take() {
            let _ = fs::remove_file(path);
        }
    }
}

impl Drop for HelperService {
    fn drop(&mut self) {
        self.remove_signal_file();
    }
}

/// Canonicalize a device argument. Unparseable paths pass through, which is
/// what the development builds use (plain files as fake devices).
fn resolve_device_path(device: &str) -> String {
    #[cfg(windows)]
    {
        match crate::disk::Target::parse(device) {
            Ok(target) => target.device_path(),
            Err(_) => device.to_string(),
        }
    }
    #[cfg(not(windows))]
    {
        device.to_string()
    }
}

fn is_disconnect(err: &ImagerError) -> bool {
    matches!(
        err,
        ImagerError::Io(e) if matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
        )
    )
}

/// Shorten a command line for the log: CUSTOMIZE payloads are base64 blobs
/// nobody wants dumped at info level.
fn summarize(line: &str) -> String {
    const MAX: usize = 96;
    if line.len() <= MAX {
        line.to_string()
    } else {
        let head: String = line.chars().take(MAX).collect();
        format!("{head}... ({} bytes)", line.len())
    }
}
