//! The FORMAT operation: FAT32-format a drive through `fat32format`.
//!
//! `fat32format` exists because diskpart refuses FAT32 above 32 GB. A
//! drive-letter target is formatted directly; a physical-drive target is
//! first given a single primary partition, whose freshly assigned letter is
//! found by diffing the volume listing around the diskpart call.

#[cfg(windows)]
use std::process::{Command, Stdio};
#[cfg(windows)]
use std::time::{Duration, Instant};

use anyhow::Result;
#[cfg(windows)]
use anyhow::{bail, Context};
#[cfg(windows)]
use log::{debug, info, warn};

#[cfg(windows)]
use crate::disk::{diskpart, Target};
#[cfg(not(windows))]
use crate::error::ImagerError;

/// Ceiling for one fat32format run.
#[cfg(windows)]
const FAT32FORMAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Format a target drive as FAT32.
#[cfg(windows)]
pub fn format_drive(device: &str) -> Result<()> {
    let target = Target::parse(device)?;
    match target {
        Target::Volume { letter } => run_fat32format(letter),
        Target::Physical { number } => {
            let before = diskpart::parse_volume_letters(&diskpart::run_diskpart(
                &diskpart::list_volumes_script(),
            )?);

            diskpart::run_diskpart(&diskpart::create_partition_script(number))
                .context("could not repartition the disk")?;
            std::thread::sleep(diskpart::RESCAN_SETTLE);

            let after = diskpart::parse_volume_letters(&diskpart::run_diskpart(
                &diskpart::list_volumes_script(),
            )?);

            let letter = after
                .iter()
                .find(|l| !before.contains(l))
                .copied()
                .context("no drive letter appeared after repartitioning")?;
            info!("new partition assigned {letter}:");
            run_fat32format(letter)
        }
    }
}

#[cfg(not(windows))]
pub fn format_drive(device: &str) -> Result<()> {
    Err(ImagerError::Subprocess(format!(
        "formatting {device} requires the Windows fat32format utility"
    ))
    .into())
}

#[cfg(windows)]
fn run_fat32format(letter: char) -> Result<()> {
    let drive = format!("{letter}:");
    debug!("fat32format -y {drive}");

    let mut child = Command::new("fat32format")
        .arg("-y")
        .arg(&drive)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("could not launch fat32format")?;

    let deadline = Instant::now() + FAT32FORMAT_TIMEOUT;
    let status = loop {
        match child.try_wait().context("could not poll fat32format")? {
            Some(status) => break status,
            None if Instant::now() > deadline => {
                warn!("fat32format exceeded its time limit, killing it");
                let _ = child.kill();
                let _ = child.wait();
                bail!("fat32format timed out after {FAT32FORMAT_TIMEOUT:?}");
            }
            None => std::thread::sleep(Duration::from_millis(500)),
        }
    };

    let output = child
        .wait_with_output()
        .context("could not collect fat32format output")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        debug!("fat32format: {}", stdout.trim());
    }

    if !status.success() {
        bail!(
            "fat32format exited with {}: {}",
            status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    info!("{drive} formatted as FAT32");
    Ok(())
}
