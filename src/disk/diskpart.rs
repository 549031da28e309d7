//! Disk preparation and rediscovery through `diskpart`.
//!
//! The helper shells out to the administrative disk utility rather than
//! issuing IOCTLs itself: scripts are fed to `diskpart` on stdin (CRLF
//! terminated), stdout/stderr are captured and logged, exit code 0 is
//! success. Script builders and output parsers are plain functions so they
//! stay testable off-Windows.

use std::sync::OnceLock;

use regex::Regex;

#[cfg(windows)]
use std::io::Write as _;
#[cfg(windows)]
use std::process::{Command, Stdio};

#[cfg(windows)]
use anyhow::{bail, Context, Result};
#[cfg(windows)]
use log::{debug, info, warn};

/// Sleep after bringing a disk back online, before volumes are usable.
#[cfg(windows)]
pub const RESCAN_SETTLE: std::time::Duration = std::time::Duration::from_secs(3);

fn crlf_script(lines: &[String]) -> String {
    let mut script = String::new();
    for line in lines {
        script.push_str(line);
        script.push_str("\r\n");
    }
    script
}

/// First invocation: inspect what is currently on the disk.
pub fn inspect_script(disk: u32) -> String {
    crlf_script(&[format!("select disk {disk}"), "list volume".to_string()])
}

/// System-wide volume listing, used to spot freshly assigned letters.
pub fn list_volumes_script() -> String {
    crlf_script(&["list volume".to_string()])
}

/// Second invocation: take the disk offline and drop the read-only flag.
pub fn offline_script(disk: u32) -> String {
    crlf_script(&[
        format!("select disk {disk}"),
        "offline disk".to_string(),
        "attributes disk clear readonly".to_string(),
    ])
}

/// Conditional third invocation: wipe the existing partition table. The
/// image supplies its own partitions, so nothing is created here.
pub fn clean_script(disk: u32) -> String {
    crlf_script(&[format!("select disk {disk}"), "clean".to_string()])
}

/// Post-write: bring the disk online and rescan so Windows rediscovers the
/// freshly written partition table.
pub fn online_script(disk: u32) -> String {
    crlf_script(&[
        format!("select disk {disk}"),
        "online disk".to_string(),
        "rescan".to_string(),
    ])
}

pub fn list_partition_script(disk: u32) -> String {
    crlf_script(&[format!("select disk {disk}"), "list partition".to_string()])
}

/// Give one partition a drive letter.
pub fn assign_script(disk: u32, partition: u32) -> String {
    crlf_script(&[
        format!("select disk {disk}"),
        format!("select partition {partition}"),
        "assign".to_string(),
    ])
}

/// Create and format a single FAT-ready primary partition (FORMAT command).
pub fn create_partition_script(disk: u32) -> String {
    crlf_script(&[
        format!("select disk {disk}"),
        "clean".to_string(),
        "create partition primary".to_string(),
        "assign".to_string(),
    ])
}

fn volume_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*Volume\s+\d+").expect("static regex"))
}

fn partition_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*Partition\s+(\d+)").expect("static regex"))
}

fn volume_letter_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*Volume\s+\d+\s+([A-Z])\s").expect("static regex")
    })
}

/// Count the volume rows in `list volume` output.
pub fn parse_volume_count(output: &str) -> usize {
    volume_row_regex().find_iter(output).count()
}

/// Partition numbers present in `list partition` output.
pub fn parse_partition_numbers(output: &str) -> Vec<u32> {
    partition_row_regex()
        .captures_iter(output)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Drive letters visible in `list volume` output.
pub fn parse_volume_letters(output: &str) -> Vec<char> {
    volume_letter_regex()
        .captures_iter(output)
        .filter_map(|c| c[1].chars().next())
        .collect()
}

/// Run a diskpart script, returning captured stdout on success.
#[cfg(windows)]
pub fn run_diskpart(script: &str) -> Result<String> {
    debug!("diskpart script:\n{}", script.trim_end());

    let mut child = Command::new("diskpart")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("could not launch diskpart")?;

    child
        .stdin
        .as_mut()
        .context("diskpart stdin unavailable")?
        .write_all(script.as_bytes())
        .context("could not feed diskpart script")?;

    let output = child
        .wait_with_output()
        .context("diskpart did not complete")?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!("diskpart stdout:\n{}", stdout.trim_end());
    if !stderr.trim().is_empty() {
        warn!("diskpart stderr:\n{}", stderr.trim_end());
    }

    if !output.status.success() {
        bail!(
            "diskpart exited with {}",
            output.status.code().unwrap_or(-1)
        );
    }
    Ok(stdout)
}

/// Offline preparation before a raw write (§ write sequence, step 1).
#[cfg(windows)]
pub fn prepare_disk(disk: u32) -> Result<()> {
    let listing = run_diskpart(&inspect_script(disk))?;
    let volumes = parse_volume_count(&listing);
    info!("disk {disk}: {volumes} volume(s) before write");

    run_diskpart(&offline_script(disk)).context("taking disk offline")?;

    if volumes > 0 {
        run_diskpart(&clean_script(disk)).context("cleaning existing partitions")?;
    }
    Ok(())
}

/// Bring the disk back and hand out drive letters (step 9). Failures here
/// are the caller's to downgrade: the write itself already succeeded.
#[cfg(windows)]
pub fn rescan_disk(disk: u32) -> Result<()> {
    run_diskpart(&online_script(disk)).context("bringing disk online")?;
    std::thread::sleep(RESCAN_SETTLE);

    let listing = run_diskpart(&list_partition_script(disk))?;
    let partitions = parse_partition_numbers(&listing);
    info!("disk {disk}: partitions after write: {partitions:?}");

    for partition in [1u32, 2] {
        if partitions.contains(&partition) {
            if let Err(e) = run_diskpart(&assign_script(disk, partition)) {
                warn!("could not assign a letter to partition {partition}: {e:#}");
            }
        }
    }
    Ok(())
}
