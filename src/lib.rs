//! Guest disk-image preparation and conversion.
//!
//! Two pipelines, both driven by a VM manager before it boots a guest:
//! - [`make_image`] converts a qcow2 image into the storage layout the VM
//!   will run from (see [`image::TargetMode`])
//! - [`prepare_guest`] writes hostname, network, accounts, hosts, ssh policy
//!   and apt proxy into the guest root without booting it
//!
//! Heavy lifting is delegated to `qemu-img`, `qemu-nbd` and `mount`; see
//! `guestprep preflight` for the host requirements.

pub mod config;
pub mod customize;
pub mod discovery;
pub mod error;
pub mod guestfs;
pub mod image;
pub mod process;

use std::path::{Path, PathBuf};

pub use config::Config;
pub use customize::{GuestConfig, GuestCustomizer};
pub use error::{Error, Result};
pub use image::{Conversion, ConversionOptions, ImageConverter, TargetMode};

use guestfs::{DeviceAllocator, HostRoot, NbdHost};

/// Where the guest root lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestImage {
    /// Already a host directory (container rootfs).
    Directory(PathBuf),
    /// A disk image that has to be attached and mounted.
    Disk(PathBuf),
}

impl GuestImage {
    pub fn path(&self) -> &Path {
        match self {
            GuestImage::Directory(p) | GuestImage::Disk(p) => p,
        }
    }
}

/// Write `guest` into `image`, releasing any mount before returning.
pub fn prepare_guest(image: &GuestImage, guest: &GuestConfig, config: &Config) -> Result<()> {
    let customizer = GuestCustomizer::new();
    match image {
        GuestImage::Directory(root) => customizer.prepare(&HostRoot::new(root), guest),
        GuestImage::Disk(path) => {
            guest.validate()?;
            let allocator = DeviceAllocator::new(NbdHost::from_config(config), &config.work_dir);
            let mounted = allocator.mount_image(path)?;
            customizer.prepare(&mounted, guest)
        }
    }
}

/// Convert `source` into `mode` under the configured work dir.
pub fn make_image(
    source: &Path,
    mode: &TargetMode,
    options: &ConversionOptions,
    config: &Config,
) -> Result<Conversion> {
    ImageConverter::from_config(config).convert(source, &config.work_dir, mode, options)
}
