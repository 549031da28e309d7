//! Post-write verification.
//!
//! Re-reads the device and hashes the same byte sequence the writer hashed:
//! the MBR block first, then the body from offset 512. The digest of a good
//! write equals the plain SHA-256 of the source image, so the comparison
//! works both against the hash retained from the preceding WRITE and
//! against an expected hash the client computed on its own.

use std::io::{Read, Seek, SeekFrom};

use anyhow::{Context, Result};
use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::writer::{CHUNK_SIZE, MBR_SIZE};

/// Hash the first `bytes_total` bytes of the device in source order.
pub fn hash_device<D: Read + Seek>(
    dev: &mut D,
    bytes_total: u64,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut hashed: u64 = 0;

    progress(0, bytes_total);

    // MBR block first, mirroring the writer's hash order.
    let head_len = bytes_total.min(MBR_SIZE as u64) as usize;
    if head_len > 0 {
        let mut head = vec![0u8; head_len];
        dev.seek(SeekFrom::Start(0)).context("seek to MBR failed")?;
        dev.read_exact(&mut head).context("cannot read MBR block")?;
        hasher.update(&head);
        hashed += head_len as u64;
        progress(hashed, bytes_total);
    }

    // Then the body, in one pass from offset 512.
    if bytes_total > MBR_SIZE as u64 {
        dev.seek(SeekFrom::Start(MBR_SIZE as u64))
            .context("seek to body failed")?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while hashed < bytes_total {
            let want = ((bytes_total - hashed) as usize).min(CHUNK_SIZE);
            let mut filled = 0;
            while filled < want {
                let n = dev
                    .read(&mut buf[filled..want])
                    .context("device read failed during verify")?;
                if n == 0 {
                    anyhow::bail!(
                        "device ended after {} of {bytes_total} bytes",
                        hashed + filled as u64
                    );
                }
                filled += n;
            }
            hasher.update(&buf[..filled]);
            hashed += filled as u64;
            progress(hashed, bytes_total);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare the device contents against an expected digest.
pub fn verify_device<D: Read + Seek>(
    dev: &mut D,
    bytes_total: u64,
    expected_hash: &str,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<bool> {
    let actual = hash_device(dev, bytes_total, progress)?;
    if actual.eq_ignore_ascii_case(expected_hash) {
        debug!("verification passed ({actual})");
        Ok(true)
    } else {
        warn!("verification failed: device {actual}, expected {expected_hash}");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn digest_matches_plain_sha256() {
        let data = patterned(4096 + 77);
        let mut padded = data.clone();
        padded.resize(8192, 0);
        let mut dev = Cursor::new(padded);

        let digest = hash_device(&mut dev, data.len() as u64, &mut |_, _| {}).unwrap();
        assert_eq!(digest, format!("{:x}", Sha256::digest(&data)));
    }

    #[test]
    fn detects_single_byte_corruption() {
        let data = patterned(8192);
        let expected = format!("{:x}", Sha256::digest(&data));

        let mut corrupted = data.clone();
        corrupted[1024] ^= 0x01;
        let mut dev = Cursor::new(corrupted);
        assert!(!verify_device(&mut dev, data.len() as u64, &expected, &mut |_, _| {}).unwrap());

        let mut dev = Cursor::new(data);
        assert!(verify_device(&mut dev, 8192, &expected, &mut |_, _| {}).unwrap());
    }

    #[test]
    fn short_device_is_an_error() {
        let mut dev = Cursor::new(vec![0u8; 1024]);
        assert!(hash_device(&mut dev, 4096, &mut |_, _| {}).is_err());
    }

    #[test]
    fn progress_covers_the_full_range() {
        let data = patterned(2048);
        let mut dev = Cursor::new(data.clone());
        let mut seen = Vec::new();
        hash_device(&mut dev, 2048, &mut |now, total| seen.push((now, total))).unwrap();
        assert_eq!(seen.first(), Some(&(0, 2048)));
        assert_eq!(seen.last(), Some(&(2048, 2048)));
    }
}
