use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImagerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unexpected token: expected {expected}, got {got:?}")]
    UnexpectedToken { expected: &'static str, got: String },

    #[error("Handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Helper is not connected")]
    NotConnected,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Device error (code {code}): {message}")]
    Device { code: u32, message: String },

    #[error("Elevation failed: {0}")]
    Elevation(String),

    #[error("Subprocess failed: {0}")]
    Subprocess(String),

    #[error("Invalid MBR: {0}")]
    InvalidMbr(String),

    #[error("Helper process exited with code {0}")]
    HelperExited(i32),
}
