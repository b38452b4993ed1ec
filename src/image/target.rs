//! Storage target selection.
//!
//! [`TargetMode`] is what the caller asks for; [`StorageTarget`] is the same
//! choice resolved to concrete paths once the converter has allocated its
//! temporaries.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Every accepted target tag, in the order shown by `--help`.
pub const TARGET_TAGS: &[&str] = &[
    "raw-file",
    "qcow2-file",
    "qcow2-copy",
    "qcow-legacy",
    "qcow2-on-raw-backing",
    "qcow2-on-lvm-backing",
    "lvm-raw",
];

/// Requested storage representation for a converted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetMode {
    /// Raw image file.
    RawFile,
    /// Standalone qcow2 file (byte copy of a qcow2 source).
    Qcow2File,
    /// qcow2 overlay whose backing file is the source image itself.
    Qcow2Copy,
    /// Legacy qcow (version 1) file.
    QcowLegacy,
    /// Raw backing file plus qcow2 overlay, both allocated in the work dir.
    Qcow2OnRawBacking,
    /// Caller's LVM volume as raw backing store plus qcow2 overlay.
    Qcow2OnLvmBacking { device: PathBuf },
    /// Raw image written straight onto the caller's LVM volume.
    LvmRaw { device: PathBuf },
}

impl TargetMode {
    /// Parse a target tag. LVM targets need the volume path in `device`.
    pub fn parse(tag: &str, device: Option<&Path>) -> Result<Self> {
        let need_device = |tag: &str| {
            device
                .map(Path::to_path_buf)
                .ok_or_else(|| Error::UnsupportedStorageTarget {
                    target: tag.to_string(),
                    reason: "an LVM device path is required".to_string(),
                })
        };

        match tag {
            "raw-file" | "raw" => Ok(TargetMode::RawFile),
            "qcow2-file" => Ok(TargetMode::Qcow2File),
            "qcow2-copy" | "qcow2-on-qcow2" => Ok(TargetMode::Qcow2Copy),
            "qcow-legacy" | "qcow" => Ok(TargetMode::QcowLegacy),
            "qcow2-on-raw-backing" => Ok(TargetMode::Qcow2OnRawBacking),
            "qcow2-on-lvm-backing" => Ok(TargetMode::Qcow2OnLvmBacking {
                device: need_device(tag)?,
            }),
            "lvm-raw" => Ok(TargetMode::LvmRaw {
                device: need_device(tag)?,
            }),
            other => Err(Error::UnsupportedStorageTarget {
                target: other.to_string(),
                reason: format!("expected one of: {}", TARGET_TAGS.join(", ")),
            }),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            TargetMode::RawFile => "raw-file",
            TargetMode::Qcow2File => "qcow2-file",
            TargetMode::Qcow2Copy => "qcow2-copy",
            TargetMode::QcowLegacy => "qcow-legacy",
            TargetMode::Qcow2OnRawBacking => "qcow2-on-raw-backing",
            TargetMode::Qcow2OnLvmBacking { .. } => "qcow2-on-lvm-backing",
            TargetMode::LvmRaw { .. } => "lvm-raw",
        }
    }

    /// Targets produced by a qcow-family `convert` call can be compressed.
    fn allows_compress(&self) -> bool {
        matches!(self, TargetMode::Qcow2File | TargetMode::QcowLegacy)
    }

    /// Metadata preallocation only exists for qcow2 output.
    fn allows_preallocate(&self) -> bool {
        matches!(self, TargetMode::Qcow2File)
    }

    /// Reject option combinations the target cannot honor.
    pub fn validate(&self, options: &ConversionOptions) -> Result<()> {
        if options.compress && !self.allows_compress() {
            return Err(Error::IncompatibleConversionOption {
                option: "compress",
                target: self.tag(),
            });
        }
        if options.preallocate && !self.allows_preallocate() {
            return Err(Error::IncompatibleConversionOption {
                option: "preallocate",
                target: self.tag(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetMode::Qcow2OnLvmBacking { device } | TargetMode::LvmRaw { device } => {
                write!(f, "{} ({})", self.tag(), device.display())
            }
            _ => f.write_str(self.tag()),
        }
    }
}

/// Flags that shape a conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// Compress the output (`qemu-img convert -c`).
    pub compress: bool,
    /// Preallocate qcow2 metadata (`-o preallocation=metadata`).
    pub preallocate: bool,
    /// Leave temporaries in place when the conversion handle is dropped.
    pub keep: bool,
}

/// A target with every path resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    RawFile { dest: PathBuf },
    Qcow2File { dest: PathBuf },
    Qcow2Copy { overlay: PathBuf },
    QcowLegacy { dest: PathBuf },
    Qcow2OnRawBacking { backing: PathBuf, overlay: PathBuf },
    Qcow2OnLvmBacking { device: PathBuf, overlay: PathBuf },
    LvmRaw { device: PathBuf },
}

impl StorageTarget {
    /// The path the VM should boot from.
    pub fn destination(&self) -> &Path {
        match self {
            StorageTarget::RawFile { dest }
            | StorageTarget::Qcow2File { dest }
            | StorageTarget::QcowLegacy { dest } => dest,
            StorageTarget::Qcow2Copy { overlay }
            | StorageTarget::Qcow2OnRawBacking { overlay, .. }
            | StorageTarget::Qcow2OnLvmBacking { overlay, .. } => overlay,
            StorageTarget::LvmRaw { device } => device,
        }
    }

    /// Backing store written by this conversion, for the chained targets.
    pub fn backing(&self) -> Option<&Path> {
        match self {
            StorageTarget::Qcow2OnRawBacking { backing, .. } => Some(backing),
            StorageTarget::Qcow2OnLvmBacking { device, .. } => Some(device),
            _ => None,
        }
    }

    /// Format `qemu-img info` should report for the destination.
    pub fn expected_format(&self) -> &'static str {
        match self {
            StorageTarget::RawFile { .. } | StorageTarget::LvmRaw { .. } => "raw",
            StorageTarget::QcowLegacy { .. } => "qcow",
            StorageTarget::Qcow2File { .. }
            | StorageTarget::Qcow2Copy { .. }
            | StorageTarget::Qcow2OnRawBacking { .. }
            | StorageTarget::Qcow2OnLvmBacking { .. } => "qcow2",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_tags() {
        let dev = Path::new("/dev/vg0/guest");
        for tag in TARGET_TAGS {
            let mode = TargetMode::parse(tag, Some(dev)).unwrap();
            assert_eq!(mode.tag(), *tag);
        }
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(
            TargetMode::parse("qcow2-on-qcow2", None).unwrap(),
            TargetMode::Qcow2Copy
        );
        assert_eq!(TargetMode::parse("raw", None).unwrap(), TargetMode::RawFile);
        assert_eq!(TargetMode::parse("qcow", None).unwrap(), TargetMode::QcowLegacy);
    }

    #[test]
    fn test_unknown_tag() {
        let err = TargetMode::parse("vmdk", None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedStorageTarget { ref target, .. } if target == "vmdk"));
    }

    #[test]
    fn test_lvm_targets_need_device() {
        for tag in ["lvm-raw", "qcow2-on-lvm-backing"] {
            let err = TargetMode::parse(tag, None).unwrap_err();
            assert!(matches!(err, Error::UnsupportedStorageTarget { .. }), "{tag}");
        }
    }

    #[test]
    fn test_compress_only_for_qcow_family() {
        let compress = ConversionOptions {
            compress: true,
            ..Default::default()
        };
        assert!(TargetMode::Qcow2File.validate(&compress).is_ok());
        assert!(TargetMode::QcowLegacy.validate(&compress).is_ok());

        for mode in [
            TargetMode::RawFile,
            TargetMode::Qcow2Copy,
            TargetMode::Qcow2OnRawBacking,
            TargetMode::LvmRaw {
                device: "/dev/vg0/a".into(),
            },
        ] {
            let err = mode.validate(&compress).unwrap_err();
            assert!(matches!(
                err,
                Error::IncompatibleConversionOption {
                    option: "compress",
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_preallocate_only_for_qcow2_file() {
        let prealloc = ConversionOptions {
            preallocate: true,
            ..Default::default()
        };
        assert!(TargetMode::Qcow2File.validate(&prealloc).is_ok());
        assert!(TargetMode::QcowLegacy.validate(&prealloc).is_err());
        assert!(TargetMode::RawFile.validate(&prealloc).is_err());
    }

    #[test]
    fn test_chained_targets_have_backing() {
        let raw = StorageTarget::Qcow2OnRawBacking {
            backing: "/w/b.raw".into(),
            overlay: "/w/o.qcow2".into(),
        };
        assert_eq!(raw.backing(), Some(Path::new("/w/b.raw")));
        assert_eq!(raw.destination(), Path::new("/w/o.qcow2"));

        let plain = StorageTarget::RawFile {
            dest: "/w/d.raw".into(),
        };
        assert_eq!(plain.backing(), None);
        assert_eq!(plain.expected_format(), "raw");
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let opts: ConversionOptions = serde_json::from_str(r#"{"compress": true}"#).unwrap();
        assert!(opts.compress);
        assert!(!opts.preallocate);
        assert!(!opts.keep);
    }
}
