//! Logger setup for the helper binary.
//!
//! Dual dispatch: colored stderr for interactive runs plus a plain-text log
//! file, since the helper usually runs hidden behind a UAC boundary where
//! nobody sees its console.

use std::io::stderr;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use fern::colors::Color::{Blue, Green, Magenta, Red, Yellow};
use fern::colors::ColoredLevelConfig;
use fern::Dispatch;
use humantime::format_rfc3339;
use log::LevelFilter;

const LOG_FILE_NAME: &str = "rpi-imager-helper.log";

#[cfg(debug_assertions)]
const LOG_LEVEL: LevelFilter = LevelFilter::Debug;

#[cfg(not(debug_assertions))]
const LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Initialize logging. The log file lands in `log_dir`; stderr output is
/// always on.
pub fn initialize(log_dir: &Path) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .trace(Magenta)
        .debug(Blue)
        .info(Green)
        .warn(Yellow)
        .error(Red);

    let stderr_dispatch = Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                format_rfc3339(SystemTime::now()),
                colors.color(record.level()),
                message
            ))
        })
        .chain(stderr());

    let log_path = log_dir.join(LOG_FILE_NAME);
    let file_dispatch = Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {}] {} [{}:{}]",
                format_rfc3339(SystemTime::now()),
                record.level(),
                message,
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0)
            ))
        })
        .chain(
            fern::log_file(&log_path)
                .with_context(|| format!("cannot create log file {}", log_path.display()))?,
        );

    Dispatch::new()
        .level(LOG_LEVEL)
        .chain(stderr_dispatch)
        .chain(file_dispatch)
        .apply()
        .context("logger already initialized")?;

    Ok(())
}
