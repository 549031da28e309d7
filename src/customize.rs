//! First-boot customization of the FAT boot partition.
//!
//! Applies the edits Raspberry Pi Imager collects in its OS customization
//! dialog: `config.txt` merging, `cmdline.txt` kernel arguments,
//! `firstrun.sh` for pi-gen images and `user-data`/`network-config` for
//! cloud-init images.

use anyhow::{Context, Result};
use log::{debug, info};

/// Kernel arguments that run `firstrun.sh` once on first boot.
const FIRSTRUN_CMDLINE: &str =
    "systemd.run=/boot/firstrun.sh systemd.run_success_action=reboot systemd.unit=kernel-command-line.target";

const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

/// File-level access to the boot partition.
///
/// The production implementation is [`crate::fat::FatVolume`]; tests use an
/// in-memory map.
pub trait BootFiles: Send {
    fn exists(&mut self, name: &str) -> Result<bool>;
    fn read(&mut self, name: &str) -> Result<Vec<u8>>;
    fn write(&mut self, name: &str, data: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// How first-boot scripts are wired into the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFormat {
    /// pi-gen images: `firstrun.sh` invoked from the kernel command line.
    Systemd,
    /// cloud-init images: `user-data` / `network-config`.
    CloudInit,
}

/// The decoded payload of a CUSTOMIZE command. Empty fields are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Customization {
    pub config: String,
    pub cmdline: String,
    pub firstrun: String,
    pub cloudinit_user_data: String,
    pub cloudinit_network: String,
    /// `"auto"`, `"systemd"`, `"cloudinit"`, or empty (treated as auto).
    pub init_format: String,
}

impl Customization {
    pub fn is_empty(&self) -> bool {
        self.config.is_empty()
            && self.cmdline.is_empty()
            && self.firstrun.is_empty()
            && self.cloudinit_user_data.is_empty()
            && self.cloudinit_network.is_empty()
    }
}

/// Apply a customization to an open boot partition.
pub fn apply(custom: &Customization, files: &mut dyn BootFiles) -> Result<()> {
    if !custom.config.is_empty() {
        let existing = if files.exists("config.txt")? {
            String::from_utf8_lossy(&files.read("config.txt")?).into_owned()
        } else {
            String::new()
        };
        let merged = merge_config(&existing, &custom.config);
        files
            .write("config.txt", merged.as_bytes())
            .context("writing config.txt")?;
        debug!("config.txt updated ({} bytes)", merged.len());
    }

    let format = resolve_init_format(&custom.init_format, files)?;
    info!("customizing image using {format:?} first-boot wiring");

    match format {
        InitFormat::Systemd => {
            if !custom.firstrun.is_empty() {
                files
                    .write("firstrun.sh", custom.firstrun.as_bytes())
                    .context("writing firstrun.sh")?;

                let existing = if files.exists("cmdline.txt")? {
                    String::from_utf8_lossy(&files.read("cmdline.txt")?).into_owned()
                } else {
                    String::new()
                };
                let cmdline = append_cmdline(&existing, FIRSTRUN_CMDLINE);
                files
                    .write("cmdline.txt", cmdline.as_bytes())
                    .context("writing cmdline.txt")?;
            }
        }
        InitFormat::CloudInit => {
            if !custom.cloudinit_user_data.is_empty() {
                let user_data = ensure_cloud_config_header(&custom.cloudinit_user_data);
                files
                    .write("user-data", user_data.as_bytes())
                    .context("writing user-data")?;
            }
            if !custom.cloudinit_network.is_empty() {
                files
                    .write("network-config", custom.cloudinit_network.as_bytes())
                    .context("writing network-config")?;
            }
        }
    }

    if !custom.cmdline.is_empty() {
        let existing = if files.exists("cmdline.txt")? {
            String::from_utf8_lossy(&files.read("cmdline.txt")?).into_owned()
        } else {
            String::new()
        };
        let cmdline = append_cmdline(&existing, custom.cmdline.trim());
        files
            .write("cmdline.txt", cmdline.as_bytes())
            .context("writing cmdline.txt")?;
    }

    files.sync().context("syncing boot partition")?;
    Ok(())
}

/// Decide the first-boot wiring for an image.
///
/// Explicit `systemd`/`cloudinit` requests win; `auto` (or anything else)
/// inspects the partition: a `user-data` file marks a cloud-init image, a
/// pi-gen `issue.txt` marks a systemd one, and cloud-init is the default.
pub fn resolve_init_format(requested: &str, files: &mut dyn BootFiles) -> Result<InitFormat> {
    match requested {
        "systemd" => Ok(InitFormat::Systemd),
        "cloudinit" => Ok(InitFormat::CloudInit),
        _ => {
            if files.exists("user-data")? {
                return Ok(InitFormat::CloudInit);
            }
            if files.exists("issue.txt")? {
                let issue = files.read("issue.txt")?;
                if String::from_utf8_lossy(&issue).contains("pi-gen") {
                    return Ok(InitFormat::Systemd);
                }
            }
            Ok(InitFormat::CloudInit)
        }
    }
}

/// Merge requested `config.txt` lines into the existing content.
///
/// Per line: an existing commented copy (`#line`) is uncommented, an
/// existing live copy is left alone, anything else is appended.
fn merge_config(existing: &str, additions: &str) -> String {
    let mut lines: Vec<String> = if existing.is_empty() {
        Vec::new()
    } else {
        existing.lines().map(str::to_string).collect()
    };

    for wanted in additions.lines() {
        let wanted = wanted.trim_end();
        if wanted.is_empty() {
            continue;
        }
        let commented = format!("#{wanted}");

        if lines.iter().any(|l| l.trim() == wanted) {
            continue;
        }
        if let Some(line) = lines.iter_mut().find(|l| l.trim() == commented) {
            *line = wanted.to_string();
            continue;
        }
        lines.push(wanted.to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Append kernel arguments to a cmdline, trimming the existing content
/// first. `cmdline.txt` is a single line.
fn append_cmdline(existing: &str, args: &str) -> String {
    let existing = existing.trim();
    if existing.is_empty() {
        format!("{args}\n")
    } else if existing.contains(args) {
        format!("{existing}\n")
    } else {
        format!("{existing} {args}\n")
    }
}

fn ensure_cloud_config_header(user_data: &str) -> String {
    if user_data.starts_with("#cloud-config") {
        user_data.to_string()
    } else {
        format!("{CLOUD_CONFIG_HEADER}{user_data}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemFiles {
        files: HashMap<String, Vec<u8>>,
        synced: bool,
    }

    impl MemFiles {
        fn with(entries: &[(&str, &str)]) -> Self {
            Self {
                files: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                    .collect(),
                synced: false,
            }
        }

        fn text(&self, name: &str) -> String {
            String::from_utf8_lossy(self.files.get(name).expect(name)).into_owned()
        }
    }

    impl BootFiles for MemFiles {
        fn exists(&mut self, name: &str) -> Result<bool> {
            Ok(self.files.contains_key(name))
        }

        fn read(&mut self, name: &str) -> Result<Vec<u8>> {
            self.files
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{name} not found"))
        }

        fn write(&mut self, name: &str, data: &[u8]) -> Result<()> {
            self.files.insert(name.to_string(), data.to_vec());
            Ok(())
        }

        fn sync(&mut self) -> Result<()> {
            self.synced = true;
            Ok(())
        }
    }

    #[test]
    fn config_merge_uncomments_keeps_and_appends() {
        let existing = "#dtparam=audio=on\narm_64bit=1\ngpu_mem=64\n";
        let merged = merge_config(existing, "dtparam=audio=on\narm_64bit=1\nhdmi_safe=1\n");
        assert_eq!(
            merged,
            "dtparam=audio=on\narm_64bit=1\ngpu_mem=64\nhdmi_safe=1\n"
        );
    }

    #[test]
    fn config_merge_into_missing_file() {
        assert_eq!(merge_config("", "arm_64bit=1"), "arm_64bit=1\n");
    }

    #[test]
    fn cmdline_append_trims_and_deduplicates() {
        assert_eq!(
            append_cmdline("console=serial0,115200 rootwait \n", "quiet"),
            "console=serial0,115200 rootwait quiet\n"
        );
        assert_eq!(append_cmdline("rootwait quiet", "quiet"), "rootwait quiet\n");
        assert_eq!(append_cmdline("", "quiet"), "quiet\n");
    }

    #[test]
    fn auto_detect_prefers_cloud_init_when_user_data_present() {
        let mut files = MemFiles::with(&[("user-data", ""), ("issue.txt", "pi-gen build")]);
        assert_eq!(
            resolve_init_format("auto", &mut files).unwrap(),
            InitFormat::CloudInit
        );
    }

    #[test]
    fn auto_detect_uses_systemd_for_pi_gen() {
        let mut files = MemFiles::with(&[("issue.txt", "Raspberry Pi reference (pi-gen)")]);
        assert_eq!(
            resolve_init_format("auto", &mut files).unwrap(),
            InitFormat::Systemd
        );
    }

    #[test]
    fn auto_detect_defaults_to_cloud_init() {
        let mut files = MemFiles::default();
        assert_eq!(
            resolve_init_format("auto", &mut files).unwrap(),
            InitFormat::CloudInit
        );
    }

    #[test]
    fn systemd_customization_writes_firstrun_and_cmdline() {
        let mut files = MemFiles::with(&[
            ("issue.txt", "pi-gen"),
            ("cmdline.txt", "console=tty1 rootwait\n"),
        ]);
        let custom = Customization {
            firstrun: "#!/bin/bash\nset +e\n".into(),
            init_format: "auto".into(),
            ..Default::default()
        };
        apply(&custom, &mut files).unwrap();

        assert_eq!(files.text("firstrun.sh"), "#!/bin/bash\nset +e\n");
        assert_eq!(
            files.text("cmdline.txt"),
            format!("console=tty1 rootwait {FIRSTRUN_CMDLINE}\n")
        );
        assert!(files.synced);
    }

    #[test]
    fn cloud_init_customization_prepends_header() {
        let mut files = MemFiles::default();
        let custom = Customization {
            cloudinit_user_data: "hostname: pi\n".into(),
            cloudinit_network: "version: 2\n".into(),
            init_format: "cloudinit".into(),
            ..Default::default()
        };
        apply(&custom, &mut files).unwrap();

        assert_eq!(files.text("user-data"), "#cloud-config\nhostname: pi\n");
        assert_eq!(files.text("network-config"), "version: 2\n");
    }

    #[test]
    fn header_not_duplicated() {
        assert_eq!(
            ensure_cloud_config_header("#cloud-config\nhostname: pi\n"),
            "#cloud-config\nhostname: pi\n"
        );
    }
}
