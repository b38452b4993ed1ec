//! Attach a disk image, find its root partition and keep it mounted.
//!
//! Resources are held by guards and released in reverse acquisition order
//! when the [`MountedImage`] is dropped: unmount (and remove the mount
//! point), then detach the device. Release failures are logged.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::error::{Error, IoContext, Result};

use super::device::DeviceHost;
use super::host::HostRoot;
use super::FilesystemAccessor;

const MOUNT_POINT_ATTEMPTS: usize = 16;

/// Hands out free device slots and mounts images on them.
#[derive(Debug)]
pub struct DeviceAllocator<H: DeviceHost> {
    host: H,
    work_dir: PathBuf,
}

impl<H: DeviceHost> DeviceAllocator<H> {
    /// Mount points are created under `work_dir`.
    pub fn new(host: H, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            host,
            work_dir: work_dir.into(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Attach `image` and mount the single partition that holds `/etc`.
    pub fn mount_image(&self, image: &Path) -> Result<MountedImage<'_, H>> {
        fs::create_dir_all(&self.work_dir).at(&self.work_dir)?;

        let device = self.attach(image)?;
        let partitions = self.host.partitions(&device.device)?;
        tracing::debug!(
            "{} partition(s) on {}",
            partitions.len(),
            device.device.display()
        );

        let mut root: Option<MountedPartition<'_, H>> = None;
        for partition in &partitions {
            let Some(mounted) = self.try_root(partition)? else {
                continue;
            };
            if let Some(first) = &root {
                return Err(Error::AmbiguousRootFilesystem {
                    image: image.to_path_buf(),
                    first: first.partition.clone(),
                    second: mounted.partition.clone(),
                });
            }
            root = Some(mounted);
        }

        let Some(root) = root else {
            return Err(Error::RootFilesystemNotFound {
                image: image.to_path_buf(),
            });
        };

        tracing::info!(
            "Mounted {} ({}) at {}",
            image.display(),
            root.partition.display(),
            root.target.display()
        );
        Ok(MountedImage {
            accessor: HostRoot::new(&root.target),
            root,
            device,
        })
    }

    /// Claim the first free slot and attach `image` to it.
    fn attach(&self, image: &Path) -> Result<AttachedDevice<'_, H>> {
        let slots = self.host.slots();
        let free: Vec<&PathBuf> = slots.iter().filter(|s| !self.host.is_busy(s)).collect();
        tracing::debug!("{} of {} device slots free", free.len(), slots.len());

        for slot in free {
            // Another process may have taken it since the scan.
            if self.host.is_busy(slot) {
                continue;
            }
            self.host.attach(slot, image)?;
            tracing::debug!("Attached {} to {}", image.display(), slot.display());
            return Ok(AttachedDevice {
                host: &self.host,
                device: slot.clone(),
            });
        }
        Err(Error::DeviceAllocationExhausted {
            checked: slots.len(),
        })
    }

    /// Mount `partition` and keep it only if it looks like a guest root.
    fn try_root(&self, partition: &Path) -> Result<Option<MountedPartition<'_, H>>> {
        let target = self.mount_point()?;
        if let Err(e) = self.host.mount(partition, &target) {
            tracing::debug!("Skipping {}: {}", partition.display(), e);
            remove_mount_point(&target);
            return Ok(None);
        }

        let mounted = MountedPartition {
            host: &self.host,
            partition: partition.to_path_buf(),
            target,
        };
        // Not followed: an absolute `etc` link would resolve on the host.
        let has_etc = fs::symlink_metadata(mounted.target.join("etc"))
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if has_etc {
            Ok(Some(mounted))
        } else {
            tracing::debug!("{} has no /etc", partition.display());
            Ok(None)
        }
    }

    /// Fresh empty directory under the work dir.
    ///
    /// Not a `TempDir`: its drop would recurse into a still-mounted guest.
    fn mount_point(&self) -> Result<PathBuf> {
        for _ in 0..MOUNT_POINT_ATTEMPTS {
            let suffix: String = rand::rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect();
            let path = self.work_dir.join(format!("mnt-{suffix}"));
            match fs::create_dir(&path) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::io(path, e)),
            }
        }
        Err(Error::io(
            &self.work_dir,
            io::Error::new(io::ErrorKind::AlreadyExists, "no unused mount point name"),
        ))
    }
}

fn remove_mount_point(target: &Path) {
    if let Err(e) = fs::remove_dir(target) {
        tracing::warn!("Failed to remove mount point {}: {}", target.display(), e);
    }
}

/// Detaches the device on drop.
struct AttachedDevice<'a, H: DeviceHost> {
    host: &'a H,
    device: PathBuf,
}

impl<H: DeviceHost> Drop for AttachedDevice<'_, H> {
    fn drop(&mut self) {
        match self.host.detach(&self.device) {
            Ok(()) => tracing::debug!("Detached {}", self.device.display()),
            Err(e) => tracing::warn!("Failed to detach {}: {}", self.device.display(), e),
        }
    }
}

/// Unmounts and removes the mount point on drop.
struct MountedPartition<'a, H: DeviceHost> {
    host: &'a H,
    partition: PathBuf,
    target: PathBuf,
}

impl<H: DeviceHost> Drop for MountedPartition<'_, H> {
    fn drop(&mut self) {
        match self.host.unmount(&self.target) {
            Ok(()) => remove_mount_point(&self.target),
            // Leave the directory alone, it still has a filesystem on it.
            Err(e) => tracing::warn!("Failed to unmount {}: {}", self.target.display(), e),
        }
    }
}

/// A guest root mounted from a disk image.
///
/// Field order is drop order: the partition is unmounted before the device
/// is detached.
pub struct MountedImage<'a, H: DeviceHost> {
    accessor: HostRoot,
    root: MountedPartition<'a, H>,
    device: AttachedDevice<'a, H>,
}

impl<H: DeviceHost> MountedImage<'_, H> {
    pub fn device(&self) -> &Path {
        &self.device.device
    }

    pub fn partition(&self) -> &Path {
        &self.root.partition
    }
}

impl<H: DeviceHost> FilesystemAccessor for MountedImage<'_, H> {
    fn root(&self) -> &Path {
        self.accessor.root()
    }

    fn write(&self, path: &str, content: &str) -> Result<()> {
        self.accessor.write(path, content)
    }

    fn read_file(&self, path: &str) -> Result<String> {
        self.accessor.read_file(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.accessor.exists(path)
    }

    fn remove_if_exists(&self, path: &str) -> Result<()> {
        self.accessor.remove_if_exists(path)
    }

    fn make_dirs(&self, path: &str) -> Result<()> {
        self.accessor.make_dirs(path)
    }

    fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        self.accessor.set_mode(path, mode)
    }

    fn set_owner(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.accessor.set_owner(path, uid, gid)
    }
}
