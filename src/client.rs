//! Client side of the helper connection.
//!
//! The GUI owns one [`HelperClient`] for the lifetime of the application.
//! `ensure_running` launches the elevated helper and completes the
//! handshake; command submission then blocks (pumping progress frames) until
//! a completion token, a timeout, or the helper process dying.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info, warn};

use crate::customize::Customization;
use crate::elevation::{HelperLauncher, HelperProcess};
use crate::error::ImagerError;
use crate::helper::command::quote_arg;
use crate::protocol::{
    encode_text, Frame, FrameReader, ProgressKind, TOKEN_FAILURE, TOKEN_HELLO, TOKEN_READY,
    TOKEN_SUCCESS,
};
use crate::transport::{self, Stream};

/// Default ceiling for one operation; writes of large images stay under it
/// comfortably on any sane medium.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Attempts (at 100 ms apart) to reach a freshly launched helper's socket.
const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_POLL: Duration = Duration::from_millis(100);

/// How long the client waits for the helper's HELLO.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A transitional state younger than this refuses a second `ensure_running`.
const TRANSITIONAL_GRACE: Duration = Duration::from_secs(10);

const RECEIVE_POLL: Duration = Duration::from_millis(10);

/// Connection state of the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    HandshakeSending,
    HandshakeReceiving,
    Connected,
    Error,
}

pub struct HelperClient {
    launcher: Box<dyn HelperLauncher>,
    socket_name: String,
    state: ClientState,
    state_since: Instant,
    stream: Option<Box<dyn Stream>>,
    frames: FrameReader,
    process: Option<Box<dyn HelperProcess>>,
    operation_complete: bool,
    /// Per-operation timeout; callers may shorten it for tests.
    pub operation_timeout: Duration,
}

impl HelperClient {
    pub fn new(launcher: Box<dyn HelperLauncher>, socket_name: impl Into<String>) -> Self {
        Self {
            launcher,
            socket_name: socket_name.into(),
            state: ClientState::Disconnected,
            state_since: Instant::now(),
            stream: None,
            frames: FrameReader::new(),
            process: None,
            operation_complete: true,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// A socket name unique to this client instance.
    pub fn generate_socket_name() -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        format!("rpi-imager-helper-{}-{nanos:08x}", std::process::id())
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn operation_complete(&self) -> bool {
        self.operation_complete
    }

    /// Launch the helper (if needed) and complete the handshake. Idempotent:
    /// an established connection returns immediately, and a transitional
    /// state that is still young refuses rather than double-launching.
    pub fn ensure_running(&mut self) -> Result<()> {
        match self.state {
            ClientState::Connected => return Ok(()),
            ClientState::Disconnected => {}
            ClientState::Error => self.reset(),
            _ => {
                if self.state_since.elapsed() < TRANSITIONAL_GRACE {
                    anyhow::bail!(
                        "helper connection already in progress ({:?})",
                        self.state
                    );
                }
                warn!("stale transitional state {:?}, resetting", self.state);
                self.reset();
            }
        }

        self.set_state(ClientState::Connecting);

        let helper_alive = match &mut self.process {
            Some(process) => process.poll_exit()?.is_none(),
            None => false,
        };
        if !helper_alive {
            info!("launching elevated helper for socket {}", self.socket_name);
            let args = vec![
                "--daemon".to_string(),
                "--socket".to_string(),
                self.socket_name.clone(),
            ];
            match self.launcher.launch(&args) {
                Ok(process) => self.process = Some(process),
                Err(e) => {
                    self.set_state(ClientState::Error);
                    return Err(e).context("could not launch the elevated helper");
                }
            }
        }

        // The helper needs a moment to bind its socket after elevation.
        let mut stream = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match transport::connect(&self.socket_name) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => std::thread::sleep(CONNECT_POLL),
            }
        }
        let stream = match stream {
            Some(stream) => stream,
            None => {
                self.set_state(ClientState::Error);
                anyhow::bail!("helper socket never became connectable");
            }
        };
        self.stream = Some(stream);
        self.frames = FrameReader::new();

        self.set_state(ClientState::HandshakeReceiving);
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            match self.poll_frame() {
                Ok(Some(Frame::Text(token))) if token == TOKEN_HELLO => break,
                Ok(Some(frame)) => {
                    self.set_state(ClientState::Error);
                    anyhow::bail!("unexpected frame during handshake: {frame:?}");
                }
                Ok(None) => {
                    if Instant::now() > deadline {
                        self.set_state(ClientState::Error);
                        return Err(ImagerError::HandshakeTimeout(
                            HANDSHAKE_TIMEOUT.as_millis() as u64,
                        )
                        .into());
                    }
                    std::thread::sleep(RECEIVE_POLL);
                }
                Err(e) => {
                    self.set_state(ClientState::Error);
                    return Err(e).context("handshake receive failed");
                }
            }
        }

        self.set_state(ClientState::HandshakeSending);
        let sent = {
            let stream = self.stream.as_mut().ok_or(ImagerError::NotConnected)?;
            stream
                .write_all(&encode_text(TOKEN_READY))
                .and_then(|_| stream.flush())
        };
        if let Err(e) = sent {
            self.set_state(ClientState::Error);
            return Err(e).context("could not send READY");
        }

        self.set_state(ClientState::Connected);
        info!("helper handshake complete");
        Ok(())
    }

    /// Submit one command and block until its completion token.
    ///
    /// Progress frames received while waiting are handed to `on_progress`.
    /// Returns `Ok(true)` for SUCCESS, `Ok(false)` for FAILURE; timeouts and
    /// transport failures are errors and poison the connection.
    pub fn submit(
        &mut self,
        command: &str,
        on_progress: &mut dyn FnMut(ProgressKind, i64, i64),
    ) -> Result<bool> {
        if self.state != ClientState::Connected {
            return Err(ImagerError::NotConnected.into());
        }

        debug!("submitting: {command}");
        self.operation_complete = false;
        let sent = {
            let stream = self.stream.as_mut().ok_or(ImagerError::NotConnected)?;
            stream
                .write_all(&encode_text(command))
                .and_then(|_| stream.flush())
        };
        if let Err(e) = sent {
            self.set_state(ClientState::Error);
            return Err(e).context("could not send command");
        }

        let deadline = Instant::now() + self.operation_timeout;
        loop {
            match self.poll_frame() {
                Ok(Some(Frame::Text(token))) => {
                    self.operation_complete = true;
                    return match token.as_str() {
                        TOKEN_SUCCESS => Ok(true),
                        TOKEN_FAILURE => Ok(false),
                        other => {
                            self.set_state(ClientState::Error);
                            Err(ImagerError::UnexpectedToken {
                                expected: "SUCCESS or FAILURE",
                                got: other.to_string(),
                            }
                            .into())
                        }
                    };
                }
                Ok(Some(Frame::Progress { kind, now, total })) => {
                    on_progress(kind, now, total);
                }
                Ok(None) => {
                    if let Some(process) = &mut self.process {
                        if let Some(code) = process.poll_exit()? {
                            self.set_state(ClientState::Error);
                            self.operation_complete = true;
                            return Err(ImagerError::HelperExited(code).into());
                        }
                    }
                    if Instant::now() > deadline {
                        self.set_state(ClientState::Error);
                        self.operation_complete = true;
                        return Err(ImagerError::Timeout(
                            self.operation_timeout.as_millis() as u64
                        )
                        .into());
                    }
                    std::thread::sleep(RECEIVE_POLL);
                }
                Err(e) => {
                    self.set_state(ClientState::Error);
                    self.operation_complete = true;
                    return Err(e).context("connection lost while waiting for completion");
                }
            }
        }
    }

    /// FORMAT a drive.
    pub fn run_format_drive(&mut self, device: &str) -> Result<bool> {
        self.ensure_running()?;
        self.submit(&format!("FORMAT {}", quote_arg(device)), &mut |_, _, _| {})
    }

    /// WRITE an image to a drive, forwarding progress.
    pub fn run_write_to_drive(
        &mut self,
        device: &str,
        source: &str,
        on_progress: &mut dyn FnMut(ProgressKind, i64, i64),
    ) -> Result<bool> {
        self.ensure_running()?;
        let command = format!("WRITE {} {}", quote_arg(device), quote_arg(source));
        self.submit(&command, on_progress)
    }

    /// VERIFY a written drive against `expected_hash` (hex), or against the
    /// helper's retained hash when `None`.
    pub fn run_verify(
        &mut self,
        device: &str,
        source: &str,
        expected_hash: Option<&str>,
        on_progress: &mut dyn FnMut(ProgressKind, i64, i64),
    ) -> Result<bool> {
        self.ensure_running()?;
        let hash64 = expected_hash
            .map(|h| BASE64.encode(h.as_bytes()))
            .unwrap_or_default();
        let command = format!(
            "VERIFY {} {} {}",
            quote_arg(device),
            quote_arg(source),
            quote_arg(&hash64),
        );
        self.submit(&command, on_progress)
    }

    /// CUSTOMIZE the boot partition.
    pub fn run_customize(&mut self, device: &str, custom: &Customization) -> Result<bool> {
        self.ensure_running()?;
        let command = format!(
            "CUSTOMIZE {} {} {} {} {} {} {}",
            quote_arg(device),
            quote_arg(&BASE64.encode(&custom.config)),
            quote_arg(&BASE64.encode(&custom.cmdline)),
            quote_arg(&BASE64.encode(&custom.firstrun)),
            quote_arg(&BASE64.encode(&custom.cloudinit_user_data)),
            quote_arg(&BASE64.encode(&custom.cloudinit_network)),
            quote_arg(&BASE64.encode(&custom.init_format)),
        );
        self.submit(&command, &mut |_, _, _| {})
    }

    /// Ask the helper to exit and drop the connection.
    pub fn shutdown(&mut self) {
        if self.state == ClientState::Connected {
            match self.submit("SHUTDOWN", &mut |_, _, _| {}) {
                Ok(_) => debug!("helper acknowledged shutdown"),
                Err(e) => debug!("shutdown handshake incomplete: {e:#}"),
            }
        }
        if let Some(mut process) = self.process.take() {
            match process.poll_exit() {
                Ok(Some(code)) => debug!("helper exited with code {code}"),
                _ => {
                    if let Err(e) = process.terminate() {
                        warn!("could not terminate helper: {e:#}");
                    }
                }
            }
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.stream = None;
        self.frames = FrameReader::new();
        self.operation_complete = true;
        self.set_state(ClientState::Disconnected);
    }

    fn set_state(&mut self, new: ClientState) {
        if self.state != new {
            debug!("client state {:?} -> {new:?}", self.state);
            self.state = new;
            self.state_since = Instant::now();
        }
    }

    fn poll_frame(&mut self) -> Result<Option<Frame>, ImagerError> {
        if let Some(frame) = self.frames.next_frame()? {
            return Ok(Some(frame));
        }
        let stream = self.stream.as_mut().ok_or(ImagerError::NotConnected)?;
        let mut buf = [0u8; 4096];
        let n = stream.poll_read(&mut buf)?;
        if n > 0 {
            self.frames.extend(&buf[..n]);
        }
        self.frames.next_frame()
    }
}

impl Drop for HelperClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
