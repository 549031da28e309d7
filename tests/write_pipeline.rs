//! End-to-end scenarios for the raw write pipeline and verifier, run
//! against an in-memory device that records the order of every write.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use rpi_imager_helper::disk::RawDisk;
use rpi_imager_helper::verify::{hash_device, verify_device};
use rpi_imager_helper::writer::stream_image;
use sha2::{Digest, Sha256};

/// In-memory fake physical drive. Records `(offset, len)` for every write
/// so tests can assert ordering.
struct MemDisk {
    data: Vec<u8>,
    pos: u64,
    sector_size: u32,
    writes: Vec<(u64, usize)>,
}

impl MemDisk {
    fn new(capacity: usize, sector_size: u32) -> Self {
        Self {
            data: vec![0u8; capacity],
            pos: 0,
            sector_size,
            writes: Vec::new(),
        }
    }
}

impl Read for MemDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos as usize;
        if pos >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - pos);
        buf[..n].copy_from_slice(&self.data[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pos = self.pos as usize;
        if pos + buf.len() > self.data.len() {
            self.data.resize(pos + buf.len(), 0);
        }
        self.data[pos..pos + buf.len()].copy_from_slice(buf);
        self.writes.push((self.pos, buf.len()));
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.data.len() as i64 + delta,
        };
        if new < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek"));
        }
        self.pos = new as u64;
        Ok(self.pos)
    }
}

impl RawDisk for MemDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn flush_device(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Deterministic pseudorandom bytes (xorshift with a fixed seed).
fn pseudorandom(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[test]
fn happy_path_20_mib_write() {
    const TOTAL: usize = 20 * 1024 * 1024;
    let source = pseudorandom(TOTAL, 0x5eed_cafe);
    let mut disk = MemDisk::new(TOTAL, 512);
    let mut frames = Vec::new();

    let summary = stream_image(
        &mut Cursor::new(source.clone()),
        TOTAL as u64,
        &mut disk,
        &mut |now, total| frames.push((now, total)),
    )
    .unwrap();

    // Device contents equal the source byte for byte.
    assert_eq!(summary.bytes_total, 20_971_520);
    assert_eq!(&disk.data[..TOTAL], &source[..]);

    // Progress: fixed total, monotonically non-decreasing, ending complete.
    assert!(frames.iter().all(|&(_, total)| total == 20_971_520));
    assert!(frames.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(frames.first(), Some(&(0, 20_971_520)));
    assert_eq!(frames.last(), Some(&(20_971_520, 20_971_520)));
}

#[test]
fn verify_detects_corruption_after_write() {
    const TOTAL: usize = 4 * 1024 * 1024;
    let source = pseudorandom(TOTAL, 42);
    let mut disk = MemDisk::new(TOTAL, 512);

    let summary = stream_image(
        &mut Cursor::new(source.clone()),
        TOTAL as u64,
        &mut disk,
        &mut |_, _| {},
    )
    .unwrap();

    // Clean device verifies.
    disk.pos = 0;
    assert!(verify_device(&mut disk, TOTAL as u64, &summary.source_hash, &mut |_, _| {}).unwrap());

    // Flip bit 0 of the byte at offset 1 MiB.
    disk.data[1_048_576] ^= 0x01;
    disk.pos = 0;
    assert!(!verify_device(&mut disk, TOTAL as u64, &summary.source_hash, &mut |_, _| {}).unwrap());
}

#[test]
fn mbr_region_is_written_last() {
    let source = pseudorandom(4096, 7);
    let mut disk = MemDisk::new(8192, 512);

    stream_image(
        &mut Cursor::new(source),
        4096,
        &mut disk,
        &mut |_, _| {},
    )
    .unwrap();

    let writes = &disk.writes;
    assert!(!writes.is_empty());

    // Exactly one write touched offset zero, and it came after every body
    // write; all body writes sit at or beyond the MBR boundary.
    let (last_offset, _) = *writes.last().unwrap();
    assert_eq!(last_offset, 0, "MBR must be the final write");
    assert_eq!(writes.iter().filter(|(off, _)| *off == 0).count(), 1);
    assert!(writes[..writes.len() - 1].iter().all(|(off, _)| *off >= 512));
}

#[test]
fn unaligned_tail_is_zero_padded() {
    // 2.5 sectors of payload on a 4096-byte-sector device.
    let source = pseudorandom(512 + 700, 9);
    let mut disk = MemDisk::new(64 * 1024, 4096);

    let summary = stream_image(
        &mut Cursor::new(source.clone()),
        source.len() as u64,
        &mut disk,
        &mut |_, _| {},
    )
    .unwrap();

    // Unpadded length reported; every submitted write sector-aligned.
    assert_eq!(summary.bytes_total, 1212);
    assert!(disk.writes.iter().all(|(_, len)| len % 4096 == 0));
    assert_eq!(&disk.data[..1212], &source[..]);
    assert!(disk.data[1212..4096].iter().all(|&b| b == 0));
}

#[test]
fn source_shorter_than_mbr_disables_deferred_write() {
    let source = pseudorandom(300, 3);
    let mut disk = MemDisk::new(4096, 512);

    let summary = stream_image(
        &mut Cursor::new(source.clone()),
        300,
        &mut disk,
        &mut |_, _| {},
    )
    .unwrap();

    // A single sequential write at offset zero; no deferred MBR pass.
    assert_eq!(summary.bytes_total, 300);
    assert_eq!(disk.writes, vec![(0, 512)]);
    assert_eq!(&disk.data[..300], &source[..]);
}

#[test]
fn writer_and_verifier_agree_on_hash() {
    let source = pseudorandom(3 * 1024 * 1024 + 123, 11);
    let mut disk = MemDisk::new(4 * 1024 * 1024, 512);

    let summary = stream_image(
        &mut Cursor::new(source.clone()),
        source.len() as u64,
        &mut disk,
        &mut |_, _| {},
    )
    .unwrap();

    disk.pos = 0;
    let device_hash = hash_device(&mut disk, source.len() as u64, &mut |_, _| {}).unwrap();
    assert_eq!(device_hash, summary.source_hash);

    // Both equal the plain SHA-256 of the source image.
    assert_eq!(device_hash, format!("{:x}", Sha256::digest(&source)));
}
