//! Disk image conversion between storage representations.
//!
//! All format work is delegated to `qemu-img`; this module decides which
//! invocation each [`TargetMode`] needs, allocates destination files under
//! the work directory and owns them until the caller is done.
//!
//! Conversion flow:
//! 1. Validate options against the target (before anything is allocated)
//! 2. Allocate destination / backing / overlay files as temporaries
//! 3. Run exactly the `qemu-img` (or `cp`) calls the target needs
//! 4. Return a [`Conversion`] that removes the temporaries on drop
//!
//! A failing step drops the half-built handle, so nothing is left behind,
//! even when `keep` was requested.

mod conversion;
mod target;

pub use conversion::Conversion;
pub use target::{ConversionOptions, StorageTarget, TargetMode, TARGET_TAGS};

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;

use conversion::Temporaries;

/// Format details reported by `qemu-img info --output=json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub filename: String,
    pub format: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "backing-filename", default)]
    pub backing_filename: Option<String>,
    #[serde(rename = "backing-filename-format", default)]
    pub backing_format: Option<String>,
}

/// Drives `qemu-img` for conversions and probes.
#[derive(Debug, Clone)]
pub struct ImageConverter {
    qemu_img: String,
}

impl ImageConverter {
    pub fn new(qemu_img: impl Into<String>) -> Self {
        Self {
            qemu_img: qemu_img.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.qemu_img.clone())
    }

    /// Convert a qcow2 `source` into `mode`, allocating outputs under `work_dir`.
    pub fn convert(
        &self,
        source: &Path,
        work_dir: &Path,
        mode: &TargetMode,
        options: &ConversionOptions,
    ) -> Result<Conversion> {
        mode.validate(options)?;

        let source = fs::canonicalize(source).at(source)?;
        fs::create_dir_all(work_dir).at(work_dir)?;
        let work_dir = fs::canonicalize(work_dir).at(work_dir)?;

        tracing::info!("Converting {} -> {}", source.display(), mode);

        let mut temps = Temporaries::new(true);
        let target = match mode {
            TargetMode::RawFile => StorageTarget::RawFile {
                dest: temps.allocate(&work_dir, "image-", ".raw")?,
            },
            TargetMode::Qcow2File => StorageTarget::Qcow2File {
                dest: temps.allocate(&work_dir, "image-", ".qcow2")?,
            },
            TargetMode::Qcow2Copy => StorageTarget::Qcow2Copy {
                overlay: temps.allocate(&work_dir, "overlay-", ".qcow2")?,
            },
            TargetMode::QcowLegacy => StorageTarget::QcowLegacy {
                dest: temps.allocate(&work_dir, "image-", ".qcow")?,
            },
            TargetMode::Qcow2OnRawBacking => StorageTarget::Qcow2OnRawBacking {
                backing: temps.allocate(&work_dir, "backing-", ".raw")?,
                overlay: temps.allocate(&work_dir, "overlay-", ".qcow2")?,
            },
            TargetMode::Qcow2OnLvmBacking { device } => StorageTarget::Qcow2OnLvmBacking {
                device: device.clone(),
                overlay: temps.allocate(&work_dir, "overlay-", ".qcow2")?,
            },
            TargetMode::LvmRaw { device } => StorageTarget::LvmRaw {
                device: device.clone(),
            },
        };

        self.write_target(&source, &target, options)?;
        // `keep` applies to finished outputs only.
        temps.set_delete_on_drop(!options.keep);

        tracing::info!("Image ready at {}", target.destination().display());
        Ok(Conversion::new(target, temps))
    }

    fn write_target(
        &self,
        source: &Path,
        target: &StorageTarget,
        options: &ConversionOptions,
    ) -> Result<()> {
        match target {
            StorageTarget::Qcow2File { dest } => {
                if options.compress || options.preallocate {
                    self.convert_image(source, dest, "qcow2", options)
                } else {
                    copy_sparse(source, dest)
                }
            }
            StorageTarget::QcowLegacy { dest } => self.convert_image(source, dest, "qcow", options),
            StorageTarget::RawFile { dest } => {
                self.convert_image(source, dest, raw_output_format(dest), options)
            }
            StorageTarget::LvmRaw { device } => {
                self.convert_image(source, device, raw_output_format(device), options)
            }
            StorageTarget::Qcow2Copy { overlay } => self.create_overlay(source, "qcow2", overlay),
            StorageTarget::Qcow2OnRawBacking { backing, overlay }
            | StorageTarget::Qcow2OnLvmBacking {
                device: backing,
                overlay,
            } => {
                self.convert_image(source, backing, raw_output_format(backing), options)?;
                self.create_overlay(backing, "raw", overlay)
            }
        }
    }

    /// `qemu-img convert -f qcow2 -O <format> [-o preallocation=metadata] [-c] src dst`
    fn convert_image(
        &self,
        source: &Path,
        dest: &Path,
        format: &str,
        options: &ConversionOptions,
    ) -> Result<()> {
        let mut cmd = Cmd::new(&self.qemu_img).args(["convert", "-f", "qcow2", "-O", format]);
        if options.preallocate {
            cmd = cmd.args(["-o", "preallocation=metadata"]);
        }
        if options.compress {
            cmd = cmd.arg("-c");
        }
        cmd.arg_path(source)
            .arg_path(dest)
            .error_msg(format!("converting {} to {}", source.display(), format))
            .run()?;
        Ok(())
    }

    /// `qemu-img create -f qcow2 -o backing_file=<backing>,backing_fmt=<fmt> <overlay>`
    fn create_overlay(&self, backing: &Path, backing_format: &str, overlay: &Path) -> Result<()> {
        Cmd::new(&self.qemu_img)
            .args(["create", "-f", "qcow2", "-o"])
            .arg(format!(
                "backing_file={},backing_fmt={}",
                backing.display(),
                backing_format
            ))
            .arg_path(overlay)
            .error_msg(format!("creating overlay over {}", backing.display()))
            .run()?;
        Ok(())
    }

    /// Ask `qemu-img info` what an image is.
    pub fn probe(&self, path: &Path) -> Result<ImageInfo> {
        let result = Cmd::new(&self.qemu_img)
            .args(["info", "--output=json"])
            .arg_path(path)
            .run()?;

        serde_json::from_str(&result.stdout).map_err(|e| Error::ExternalToolFailure {
            program: self.qemu_img.clone(),
            code: None,
            message: format!("unreadable info output for {}: {}", path.display(), e),
        })
    }

    /// Check a finished conversion with an independent format probe.
    pub fn verify(&self, conversion: &Conversion) -> Result<ImageInfo> {
        let target = conversion.target();
        let info = self.probe(target.destination())?;

        let mismatch = |what: String| Error::ExternalToolFailure {
            program: self.qemu_img.clone(),
            code: None,
            message: format!("{} check failed: {}", target.destination().display(), what),
        };

        if info.format != target.expected_format() {
            return Err(mismatch(format!(
                "format is {}, expected {}",
                info.format,
                target.expected_format()
            )));
        }

        let expected_backing: Option<PathBuf> = match target {
            StorageTarget::Qcow2OnRawBacking { backing, .. }
            | StorageTarget::Qcow2OnLvmBacking {
                device: backing, ..
            } => Some(backing.clone()),
            _ => None,
        };
        if let Some(backing) = expected_backing {
            if info.backing_filename.as_deref().map(Path::new) != Some(backing.as_path()) {
                return Err(mismatch(format!(
                    "backing file is {:?}, expected {}",
                    info.backing_filename,
                    backing.display()
                )));
            }
            if info.backing_format.as_deref() != Some("raw") {
                return Err(mismatch(format!(
                    "backing format is {:?}, expected raw",
                    info.backing_format
                )));
            }
        }

        Ok(info)
    }
}

/// `host_device` for block devices, `raw` for everything else.
fn raw_output_format(dest: &Path) -> &'static str {
    match fs::metadata(dest) {
        Ok(meta) if meta.file_type().is_block_device() => "host_device",
        _ => "raw",
    }
}

fn copy_sparse(source: &Path, dest: &Path) -> Result<()> {
    Cmd::new("cp")
        .arg("--sparse=always")
        .arg_path(source)
        .arg_path(dest)
        .error_msg(format!("copying {}", source.display()))
        .run()?;
    Ok(())
}
