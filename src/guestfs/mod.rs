//! Access to a guest root filesystem.
//!
//! The customizer only ever talks to a [`FilesystemAccessor`]. Two backends
//! exist:
//! - [`HostRoot`] - the guest root is already a host directory (container rootfs)
//! - [`MountedImage`] - a disk image attached over NBD with its root partition
//!   mounted; dropping it unmounts and detaches
//!
//! Paths passed to the accessor are guest paths (`/etc/shadow`). They are
//! resolved under the root and may not climb out of it with `..`.

mod device;
mod host;
mod mount;

pub use device::{DeviceHost, NbdHost};
pub use host::HostRoot;
pub use mount::{DeviceAllocator, MountedImage};

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Uniform read/write interface over a guest root.
pub trait FilesystemAccessor {
    /// Host directory that represents the guest's `/`.
    fn root(&self) -> &Path;

    /// Replace a file's content, creating parent directories as needed.
    fn write(&self, path: &str, content: &str) -> Result<()>;

    fn read_file(&self, path: &str) -> Result<String>;

    fn exists(&self, path: &str) -> bool;

    fn remove_if_exists(&self, path: &str) -> Result<()>;

    /// `mkdir -p` inside the guest.
    fn make_dirs(&self, path: &str) -> Result<()>;

    fn set_mode(&self, path: &str, mode: u32) -> Result<()>;

    fn set_owner(&self, path: &str, uid: u32, gid: u32) -> Result<()>;
}

/// Map a guest path onto `root`, rejecting anything that escapes it.
pub(crate) fn resolve_guest_path(root: &Path, guest: &str) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;

    for component in Path::new(guest).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::InvalidGuestConfig(format!(
                    "guest path {guest} escapes the guest root"
                )));
            }
        }
    }

    if depth == 0 && !guest.trim_matches('/').is_empty() {
        return Err(Error::InvalidGuestConfig(format!(
            "guest path {guest} does not name a file"
        )));
    }
    Ok(resolved)
}
