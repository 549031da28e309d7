//! The raw-image write pipeline.
//!
//! The first 512 bytes of the source (the MBR, carrying the partition
//! table) are held back in memory and written only after every other byte
//! has landed. An interrupted write therefore leaves a disk Windows still
//! considers blank instead of a half-populated filesystem it would happily
//! auto-mount.
//!
//! Every length submitted to the device is rounded up to the sector size
//! with a zero-filled tail; the unpadded byte counts drive both the rolling
//! hash and progress accounting.

use std::fs::File;
#[cfg_attr(not(test), allow(unused_imports))]
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::disk::RawDisk;
#[cfg(not(windows))]
use crate::disk::FileDisk;
#[cfg(windows)]
use crate::disk::{diskpart, windows, Target};

/// Streaming chunk size.
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;
/// The master boot record: the part of the source written last.
pub const MBR_SIZE: usize = 512;

const WRITE_RETRY_DELAY: Duration = Duration::from_secs(1);
const MBR_WRITE_ATTEMPTS: u32 = 3;
const MBR_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Outcome of a completed write.
#[derive(Debug, Clone)]
pub struct WriteSummary {
    /// Unpadded bytes of source content on the device.
    pub bytes_total: u64,
    /// Hex SHA-256 of the source content, in source order.
    pub source_hash: String,
}

fn pad_len(len: usize, sector: usize) -> usize {
    len.div_ceil(sector) * sector
}

/// Read until `buf` is full or the source is exhausted.
fn read_full(source: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source
            .read(&mut buf[filled..])
            .context("failed to read source")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write `data` at `offset`, retrying once after a short pause.
fn write_with_retry<D: RawDisk>(disk: &mut D, offset: u64, data: &[u8]) -> Result<()> {
    disk.seek(SeekFrom::Start(offset))
        .with_context(|| format!("seek to {offset} failed"))?;
    if let Err(first) = disk.write_all(data) {
        warn!(
            "write of {} bytes at {offset} failed ({first}), retrying",
            data.len()
        );
        sleep(WRITE_RETRY_DELAY);
        disk.seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek to {offset} failed"))?;
        disk.write_all(data).with_context(|| {
            format!("write of {} bytes at {offset} failed twice", data.len())
        })?;
    }
    Ok(())
}

/// Stream a source image onto a device, MBR last.
///
/// `progress` is invoked with `(bytes_written, bytes_total)` after every
/// chunk, once up front with zero and once at completion; the caller is
/// expected to forward it between chunks so progress frames interleave with
/// the I/O.
pub fn stream_image<S, D>(
    source: &mut S,
    bytes_total: u64,
    disk: &mut D,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<WriteSummary>
where
    S: Read,
    D: RawDisk,
{
    let sector = disk.sector_size() as usize;
    let mut hasher = Sha256::new();

    progress(0, bytes_total);

    // Stash the MBR; it is hashed now (source order) but written last.
    let mut mbr = vec![0u8; MBR_SIZE];
    let mbr_len = read_full(source, &mut mbr)?;
    mbr.truncate(mbr_len);
    hasher.update(&mbr);

    let mut body_written: u64 = 0;

    if mbr_len < MBR_SIZE {
        // The whole source fits inside one MBR block; there is no partition
        // table worth deferring. Plain sequential write.
        debug!("source is only {mbr_len} bytes; MBR-last disabled");
        if !mbr.is_empty() {
            let mut block = vec![0u8; pad_len(mbr.len(), sector)];
            block[..mbr.len()].copy_from_slice(&mbr);
            write_with_retry(disk, 0, &block)?;
        }
    } else {
        // When the sector size exceeds one MBR block, the deferred write at
        // offset zero spans the first body bytes too; keep a copy so the
        // final write does not zero them out.
        let block_len = pad_len(MBR_SIZE, sector);
        let mut head_tail = vec![0u8; block_len - MBR_SIZE];

        let mut buf = vec![0u8; CHUNK_SIZE + sector];
        loop {
            let n = read_full(source, &mut buf[..CHUNK_SIZE])?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);

            if (body_written as usize) < head_tail.len() {
                let start = body_written as usize;
                let take = (head_tail.len() - start).min(n);
                head_tail[start..start + take].copy_from_slice(&buf[..take]);
            }

            let padded = pad_len(n, sector);
            buf[n..padded].fill(0);
            // The MBR slot stays empty for now, so the body lands shifted by
            // one MBR block past the bytes already written.
            let offset = MBR_SIZE as u64 + body_written;
            write_with_retry(disk, offset, &buf[..padded])?;

            body_written += n as u64;
            progress(body_written, bytes_total);
        }

        let mut block = vec![0u8; block_len];
        block[..MBR_SIZE].copy_from_slice(&mbr);
        block[MBR_SIZE..].copy_from_slice(&head_tail);
        let mut attempts = 0;
        loop {
            attempts += 1;
            disk.seek(SeekFrom::Start(0)).context("seek to MBR failed")?;
            match disk.write_all(&block) {
                Ok(()) => break,
                Err(e) if attempts < MBR_WRITE_ATTEMPTS => {
                    warn!("MBR write attempt {attempts} failed: {e}");
                    sleep(MBR_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(e).context("MBR write failed after final attempt");
                }
            }
        }
    }

    disk.flush_device().context("device flush failed")?;

    let written_total = mbr_len as u64 + body_written;
    if written_total != bytes_total {
        bail!("source delivered {written_total} bytes, expected {bytes_total}");
    }
    progress(bytes_total, bytes_total);

    Ok(WriteSummary {
        bytes_total,
        source_hash: format!("{:x}", hasher.finalize()),
    })
}

/// Full WRITE operation: prepare the disk, open it, stream the image, then
/// hand the disk back to the OS.
pub fn write_image_file(
    device: &str,
    source_path: &Path,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<WriteSummary> {
    let mut source = File::open(source_path)
        .with_context(|| format!("cannot open source image {}", source_path.display()))?;
    let bytes_total = source
        .metadata()
        .context("cannot stat source image")?
        .len();
    debug!(
        "writing {} ({bytes_total} bytes) to {device}",
        source_path.display()
    );

    #[cfg(windows)]
    {
        let target = Target::parse(device)?;
        if let Some(number) = target.drive_number() {
            diskpart::prepare_disk(number).context("disk preparation failed")?;
        }

        let mut disk = windows::open_target(&target)?;
        let summary = stream_image(&mut source, bytes_total, &mut disk, progress)?;
        // The handle must be closed before diskpart can rescan the disk.
        drop(disk);
        drop(source);

        match target.drive_number() {
            Some(number) => {
                if let Err(e) = diskpart::rescan_disk(number) {
                    warn!("post-write rescan failed: {e:#}");
                }
            }
            None => windows::unlock_volume_best_effort(&target),
        }
        Ok(summary)
    }

    #[cfg(not(windows))]
    {
        // Development path: the "device" is a plain file.
        let mut disk = FileDisk::open_path(Path::new(device))?;
        stream_image(&mut source, bytes_total, &mut disk, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor, Write};

    struct TestDisk {
        cursor: Cursor<Vec<u8>>,
        sector_size: u32,
    }

    impl TestDisk {
        fn new(capacity: usize, sector_size: u32) -> Self {
            Self {
                cursor: Cursor::new(vec![0u8; capacity]),
                sector_size,
            }
        }

        fn contents(&self) -> &[u8] {
            self.cursor.get_ref()
        }
    }

    impl Read for TestDisk {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.cursor.read(buf)
        }
    }

    impl Write for TestDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.cursor.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for TestDisk {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.cursor.seek(pos)
        }
    }

    impl RawDisk for TestDisk {
        fn sector_size(&self) -> u32 {
            self.sector_size
        }

        fn flush_device(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn device_matches_source_after_write() {
        let source = patterned(3 * 512 + 100);
        let mut disk = TestDisk::new(4096, 512);
        let summary = stream_image(
            &mut Cursor::new(source.clone()),
            source.len() as u64,
            &mut disk,
            &mut |_, _| {},
        )
        .unwrap();

        assert_eq!(summary.bytes_total, source.len() as u64);
        assert_eq!(&disk.contents()[..source.len()], &source[..]);
        // The padded tail is zero-filled.
        assert!(disk.contents()[source.len()..2048].iter().all(|&b| b == 0));
    }

    #[test]
    fn hash_is_plain_sha256_of_source() {
        let source = patterned(8192);
        let mut disk = TestDisk::new(8192, 512);
        let summary = stream_image(
            &mut Cursor::new(source.clone()),
            source.len() as u64,
            &mut disk,
            &mut |_, _| {},
        )
        .unwrap();

        let expected = format!("{:x}", Sha256::digest(&source));
        assert_eq!(summary.source_hash, expected);
    }

    #[test]
    fn short_source_uses_sequential_fallback() {
        let source = patterned(300);
        let mut disk = TestDisk::new(1024, 512);
        let summary = stream_image(
            &mut Cursor::new(source.clone()),
            source.len() as u64,
            &mut disk,
            &mut |_, _| {},
        )
        .unwrap();

        assert_eq!(summary.bytes_total, 300);
        assert_eq!(&disk.contents()[..300], &source[..]);
        assert!(disk.contents()[300..512].iter().all(|&b| b == 0));
    }

    #[test]
    fn progress_reports_unpadded_lengths() {
        let source = patterned(512 + 700);
        let mut disk = TestDisk::new(4096, 512);
        let mut seen = Vec::new();
        stream_image(
            &mut Cursor::new(source.clone()),
            source.len() as u64,
            &mut disk,
            &mut |now, total| seen.push((now, total)),
        )
        .unwrap();

        assert_eq!(seen.first(), Some(&(0, 1212)));
        assert_eq!(seen.last(), Some(&(1212, 1212)));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn truncated_source_is_an_error() {
        let source = patterned(2048);
        let mut disk = TestDisk::new(8192, 512);
        // Claim more bytes than the stream will deliver.
        let result = stream_image(
            &mut Cursor::new(source),
            4096,
            &mut disk,
            &mut |_, _| {},
        );
        assert!(result.is_err());
    }

    #[test]
    fn pad_len_rounds_to_sector() {
        assert_eq!(pad_len(0, 512), 0);
        assert_eq!(pad_len(1, 512), 512);
        assert_eq!(pad_len(512, 512), 512);
        assert_eq!(pad_len(513, 4096), 4096);
    }
}
