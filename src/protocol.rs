//! Framed wire protocol between the imaging client and the elevated helper.
//!
//! Two frame shapes travel over the local socket:
//!
//!   string frame:   `[u32 block length][u32 UTF-16 byte length][UTF-16BE data]`
//!   progress frame: `[i32 kind][i64 now][i64 total]` (exactly 20 bytes)
//!
//! All integers are big-endian. The string frame is the serialized form the
//! original Qt client produced (a length-prefixed block wrapping a
//! length-prefixed UTF-16 string), so `"HELLO"` is 18 bytes on the wire.
//! Progress frames carry no outer prefix; they are distinguishable because a
//! string frame's block length is at least [`MIN_STRING_BLOCK`] while a
//! progress kind is in `1..=3`.

use byteorder::{BigEndian, ByteOrder};

use crate::error::ImagerError;

/// Wire serializer version shared by both sides. Any change to this constant
/// is a breaking protocol change.
pub const WIRE_VERSION: u32 = 20;

/// Handshake token sent by the helper once a client connects.
pub const TOKEN_HELLO: &str = "HELLO";
/// Handshake token the client answers with.
pub const TOKEN_READY: &str = "READY";
/// Completion token for a command that succeeded.
pub const TOKEN_SUCCESS: &str = "SUCCESS";
/// Completion token for a command that failed.
pub const TOKEN_FAILURE: &str = "FAILURE";

/// Upper bound on a string frame's block length. CUSTOMIZE commands carry
/// base64 payloads, so this is generous, but it still rejects garbage that
/// would otherwise stall the reader waiting for gigabytes.
pub const MAX_STRING_BLOCK: u32 = 32 * 1024 * 1024;

/// Smallest block length a string frame can carry: the inner length word
/// alone (an empty string). Every block length therefore sits above the
/// progress-kind range (1..=3), which is what makes the two frame shapes
/// distinguishable from their first word.
const MIN_STRING_BLOCK: u32 = 4;

const PROGRESS_FRAME_LEN: usize = 4 + 8 + 8;

/// Progress frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Download = 1,
    Verify = 2,
    Write = 3,
}

impl ProgressKind {
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            1 => Some(ProgressKind::Download),
            2 => Some(ProgressKind::Verify),
            3 => Some(ProgressKind::Write),
            _ => None,
        }
    }
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Progress {
        kind: ProgressKind,
        now: i64,
        total: i64,
    },
}

/// Encode a string frame.
pub fn encode_text(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let inner_len = (units.len() * 2) as u32;
    let block_len = 4 + inner_len;

    let mut out = Vec::with_capacity(4 + block_len as usize);
    out.extend_from_slice(&block_len.to_be_bytes());
    out.extend_from_slice(&inner_len.to_be_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

/// Encode a progress frame.
pub fn encode_progress(kind: ProgressKind, now: i64, total: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(PROGRESS_FRAME_LEN);
    out.extend_from_slice(&(kind as i32).to_be_bytes());
    out.extend_from_slice(&now.to_be_bytes());
    out.extend_from_slice(&total.to_be_bytes());
    out
}

/// Incremental frame decoder with rollback.
///
/// Bytes are appended as they arrive; [`FrameReader::next_frame`] either
/// consumes exactly one frame, leaves the buffer untouched when a frame is
/// incomplete, or reports a malformed prefix. Unparsed bytes are never
/// silently dropped, since that would desynchronize framing for good.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not-yet-decoded bytes.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Attempt to decode the next frame.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame (the
    /// read position is rolled back so the caller can wait for more bytes).
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ImagerError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let first = BigEndian::read_u32(&self.buf[0..4]);

        if let Some(kind) = ProgressKind::from_wire(first as i32) {
            if self.buf.len() < PROGRESS_FRAME_LEN {
                return Ok(None);
            }
            let now = BigEndian::read_i64(&self.buf[4..12]);
            let total = BigEndian::read_i64(&self.buf[12..20]);
            self.buf.drain(..PROGRESS_FRAME_LEN);
            return Ok(Some(Frame::Progress { kind, now, total }));
        }

        // String frame.
        if first < MIN_STRING_BLOCK || first > MAX_STRING_BLOCK {
            return Err(ImagerError::MalformedFrame(format!(
                "implausible block length {first}"
            )));
        }
        let block_len = first as usize;
        if self.buf.len() < 4 + block_len {
            return Ok(None);
        }

        let inner_len = BigEndian::read_u32(&self.buf[4..8]) as usize;
        if inner_len != block_len - 4 {
            return Err(ImagerError::MalformedFrame(format!(
                "inner length {inner_len} disagrees with block length {block_len}"
            )));
        }
        if inner_len % 2 != 0 {
            return Err(ImagerError::MalformedFrame(format!(
                "odd UTF-16 byte length {inner_len}"
            )));
        }

        let data = &self.buf[8..8 + inner_len];
        let units: Vec<u16> = data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16(&units)
            .map_err(|e| ImagerError::MalformedFrame(format!("invalid UTF-16: {e}")))?;

        self.buf.drain(..4 + block_len);
        Ok(Some(Frame::Text(text)))
    }
}
