//! Helper binary entry point.
//!
//! Exit codes: 0 success, 1 operation failed, 2 argument error, 3 no
//! operation requested (help shown).

use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use log::{error, info, warn};

use rpi_imager_helper::elevation;
use rpi_imager_helper::helper::progress::ProgressReporter;
use rpi_imager_helper::helper::HelperService;
use rpi_imager_helper::protocol::ProgressKind;
use rpi_imager_helper::transport::{self, DEFAULT_SOCKET_NAME};
use rpi_imager_helper::{format, logging, writer};

/// Raspberry Pi Imager disk writer helper
#[derive(Parser)]
#[command(name = "rpi-imager-helper")]
#[command(version = env!("APP_VERSION"))]
#[command(about = "Performs raw disk writes on behalf of Raspberry Pi Imager")]
struct Options {
    /// Format the drive
    #[arg(short = 'f', long = "format", value_name = "drive")]
    format: Option<String>,

    /// Write an image to the drive
    #[arg(short = 'w', long = "write", value_name = "drive")]
    write: Option<String>,

    /// Source image file for --write
    #[arg(short = 's', long = "source", value_name = "file")]
    source: Option<String>,

    /// Socket name for progress reporting and daemon mode
    #[arg(long = "socket", value_name = "name")]
    socket: Option<String>,

    /// Stay alive and serve commands until SHUTDOWN or disconnect
    #[arg(long)]
    daemon: bool,
}

fn main() -> ExitCode {
    let options = Options::parse();

    let log_dir = std::env::temp_dir();
    if let Err(e) = logging::initialize(&log_dir) {
        eprintln!("logging setup failed: {e:#}");
    }

    if elevation::is_elevated() {
        info!("helper running with administrator privileges");
    } else {
        // Keep going so failure paths stay testable without elevation.
        error!("WARNING: helper is NOT running with administrator privileges!");
        error!("         Disk write operations will likely fail.");
        error!("         Ensure the manifest is embedded in the executable.");
    }

    let socket_name = options
        .socket
        .clone()
        .unwrap_or_else(|| DEFAULT_SOCKET_NAME.to_string());

    if options.daemon {
        return run_daemon(&socket_name);
    }

    if let Some(drive) = &options.format {
        return match format::format_drive(drive) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("format failed: {e:#}");
                ExitCode::from(1)
            }
        };
    }

    if let Some(drive) = &options.write {
        let Some(source) = &options.source else {
            error!("a source file must be specified for a write operation");
            return ExitCode::from(2);
        };
        return run_one_shot_write(drive, source, options.socket.as_deref());
    }

    // No operation requested.
    let _ = Options::command().print_help();
    ExitCode::from(3)
}

fn run_daemon(socket_name: &str) -> ExitCode {
    let mut service = match HelperService::bind(socket_name, true) {
        Ok(service) => service,
        Err(e) => {
            error!("could not start daemon: {e:#}");
            return ExitCode::from(1);
        }
    };
    match service.run() {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            error!("daemon loop failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// One-shot `--write`: stream the image, reporting progress over the socket
/// when a client is attached to it.
fn run_one_shot_write(drive: &str, source: &str, socket: Option<&str>) -> ExitCode {
    let mut client = None;
    if let Some(name) = socket {
        match transport::bind(name) {
            Ok(mut listener) => {
                // Give the launching client a short window to attach.
                for _ in 0..20 {
                    match listener.accept() {
                        Ok(Some(stream)) => {
                            client = Some(stream);
                            break;
                        }
                        Ok(None) => std::thread::sleep(std::time::Duration::from_millis(100)),
                        Err(e) => {
                            warn!("progress socket accept failed: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("could not bind progress socket {name:?}: {e}"),
        }
        if client.is_none() {
            info!("no progress client connected; writing without progress frames");
        }
    }

    let mut reporter = ProgressReporter::new();
    let result = writer::write_image_file(drive, std::path::Path::new(source), &mut |now, total| {
        if let Some(stream) = client.as_mut() {
            reporter.tick(stream.as_mut(), ProgressKind::Write, now as i64, total as i64);
        }
    });

    match result {
        Ok(summary) => {
            if let Some(stream) = client.as_mut() {
                reporter.force(
                    stream.as_mut(),
                    ProgressKind::Write,
                    summary.bytes_total as i64,
                    summary.bytes_total as i64,
                );
            }
            info!(
                "write complete: {} bytes, sha256 {}",
                summary.bytes_total, summary.source_hash
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("write failed: {e:#}");
            ExitCode::from(1)
        }
    }
}
