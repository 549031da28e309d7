//! Raw device access.
//!
//! [`Target`] classifies the device paths the helper accepts,
//! [`RawDisk`] is the seam the write pipeline streams through, and the
//! platform modules provide the real open/lock/unlock sequences.

pub mod diskpart;
#[cfg(windows)]
pub mod windows;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::ImagerError;

/// Fallback sector size when the target cannot be probed.
pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

/// A write target the helper understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `\\.\PhysicalDrive<N>`, a whole physical disk.
    Physical { number: u32 },
    /// `X:`, a mounted volume.
    Volume { letter: char },
}

impl Target {
    /// Parse a device path. Doubled backslashes from sloppy quoting are
    /// collapsed before matching.
    pub fn parse(device: &str) -> Result<Self, ImagerError> {
        let mut normalized = device.trim().to_string();
        while normalized.contains(r"\\\\") {
            normalized = normalized.replace(r"\\\\", r"\\");
        }

        let stripped = normalized
            .trim_start_matches('\\')
            .trim_start_matches('.')
            .trim_start_matches('\\');

        let lower = stripped.to_ascii_lowercase();
        if let Some(num) = lower.strip_prefix("physicaldrive") {
            let number: u32 = num.parse().map_err(|_| {
                ImagerError::InvalidCommand(format!("bad physical drive number in {device:?}"))
            })?;
            return Ok(Target::Physical { number });
        }

        let mut chars = stripped.chars();
        if let (Some(letter), Some(':'), None) = (chars.next(), chars.next(), chars.next()) {
            if letter.is_ascii_alphabetic() {
                return Ok(Target::Volume {
                    letter: letter.to_ascii_uppercase(),
                });
            }
        }

        Err(ImagerError::InvalidCommand(format!(
            "unrecognized device path {device:?}"
        )))
    }

    /// The canonical OS path of this target.
    pub fn device_path(&self) -> String {
        match self {
            Target::Physical { number } => format!(r"\\.\PhysicalDrive{number}"),
            Target::Volume { letter } => format!(r"\\.\{letter}:"),
        }
    }

    pub fn drive_number(&self) -> Option<u32> {
        match self {
            Target::Physical { number } => Some(*number),
            Target::Volume { .. } => None,
        }
    }
}

/// A device the write pipeline can stream to.
///
/// Every write length handed to the OS must be a multiple of
/// [`RawDisk::sector_size`]; the pipeline pads and the implementations only
/// pass bytes through.
pub trait RawDisk: Read + Write + Seek + Send {
    fn sector_size(&self) -> u32;

    /// Push all buffered bytes to the medium (`FlushFileBuffers` on
    /// Windows).
    fn flush_device(&mut self) -> io::Result<()>;
}

/// A file-backed disk: regular files in development and tests, and the
/// opened device handle in production.
pub struct FileDisk {
    file: File,
    sector_size: u32,
}

impl FileDisk {
    pub fn new(file: File, sector_size: u32) -> Self {
        Self { file, sector_size }
    }

    /// Open a plain path read+write without any Windows ceremony. This is
    /// the development/test path; production targets go through
    /// [`windows::open_target`].
    pub fn open_path(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("cannot open {} for writing", path.display()))?;
        Ok(Self::new(file, 512))
    }
}

impl Read for FileDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl RawDisk for FileDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn flush_device(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}
