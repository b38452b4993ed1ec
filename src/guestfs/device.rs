//! Host-side block device operations.
//!
//! [`DeviceHost`] is the seam between the mount lifecycle and the machine:
//! [`NbdHost`] drives `qemu-nbd`, `mount` and `umount` for real, tests plug
//! in a simulated host.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::process::Cmd;

/// Polls for the kernel to publish a freshly attached device.
const SETTLE_ATTEMPTS: u32 = 50;
const SETTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Operations the mount lifecycle needs from the host.
pub trait DeviceHost {
    /// Candidate device nodes, in scan order.
    fn slots(&self) -> Vec<PathBuf>;

    /// True when the slot is already serving another image.
    fn is_busy(&self, device: &Path) -> bool;

    fn attach(&self, device: &Path, image: &Path) -> Result<()>;

    fn detach(&self, device: &Path) -> Result<()>;

    /// Partition nodes of an attached device, or the device itself when the
    /// image has no partition table.
    fn partitions(&self, device: &Path) -> Result<Vec<PathBuf>>;

    fn mount(&self, partition: &Path, target: &Path) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Network block devices via `qemu-nbd` (needs the `nbd` kernel module and root).
#[derive(Debug, Clone)]
pub struct NbdHost {
    qemu_nbd: String,
    slot_count: usize,
    dev_dir: PathBuf,
    sys_block: PathBuf,
}

impl NbdHost {
    pub fn new(qemu_nbd: impl Into<String>, slot_count: usize) -> Self {
        Self {
            qemu_nbd: qemu_nbd.into(),
            slot_count,
            dev_dir: PathBuf::from("/dev"),
            sys_block: PathBuf::from("/sys/block"),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.qemu_nbd.clone(), config.nbd_slots)
    }

    /// Use alternate `/dev` and `/sys/block` trees.
    pub fn with_roots(mut self, dev_dir: impl Into<PathBuf>, sys_block: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self.sys_block = sys_block.into();
        self
    }

    fn sys_dir(&self, device: &Path) -> PathBuf {
        let name = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.sys_block.join(name)
    }

    /// Wait until the device reports a non-zero size after attach.
    fn wait_for_size(&self, device: &Path) {
        let size_path = self.sys_dir(device).join("size");
        for _ in 0..SETTLE_ATTEMPTS {
            if let Ok(size) = fs::read_to_string(&size_path) {
                if size.trim().parse::<u64>().unwrap_or(0) > 0 {
                    return;
                }
            }
            thread::sleep(SETTLE_INTERVAL);
        }
        tracing::debug!("{} still reports zero size", device.display());
    }

    /// Ask the kernel to re-read the partition table. `partprobe` is optional.
    fn rescan_partitions(&self, device: &Path) {
        let cmd = Cmd::new("partprobe").arg_path(device);
        let shown = cmd.display();
        match cmd.allow_fail().run() {
            Ok(result) if !result.success() => tracing::debug!(
                "{} exited {}: {}",
                shown,
                result.code(),
                result.stderr_trimmed()
            ),
            Ok(_) => {}
            Err(e) => tracing::debug!("{} not run: {}", shown, e),
        }
    }

    /// `nbdNpM` entries under sysfs, sorted by partition number.
    fn sysfs_partitions(&self, device: &Path) -> Vec<String> {
        let sys_dir = self.sys_dir(device);
        let dev_name = sys_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = format!("{dev_name}p");

        let mut numbered: Vec<(u32, String)> = Vec::new();
        if let Ok(entries) = fs::read_dir(&sys_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(number) = name.strip_prefix(&prefix).and_then(|n| n.parse().ok()) else {
                    continue;
                };
                numbered.push((number, name));
            }
        }
        numbered.sort_by_key(|(n, _)| *n);
        numbered.into_iter().map(|(_, name)| name).collect()
    }

    /// Partitions the kernel knows about whose device node is not there yet.
    fn pending_partition_nodes(&self, device: &Path) -> Vec<PathBuf> {
        self.sysfs_partitions(device)
            .into_iter()
            .map(|name| self.dev_dir.join(name))
            .filter(|node| !node.exists())
            .collect()
    }

    fn wait_for_partition_nodes(&self, device: &Path) {
        for _ in 0..SETTLE_ATTEMPTS {
            if self.pending_partition_nodes(device).is_empty() {
                return;
            }
            thread::sleep(SETTLE_INTERVAL);
        }
        tracing::debug!(
            "{} partition nodes still missing: {:?}",
            device.display(),
            self.pending_partition_nodes(device)
        );
    }
}

impl DeviceHost for NbdHost {
    fn slots(&self) -> Vec<PathBuf> {
        (0..self.slot_count)
            .map(|i| self.dev_dir.join(format!("nbd{i}")))
            .filter(|dev| dev.exists())
            .collect()
    }

    fn is_busy(&self, device: &Path) -> bool {
        // qemu-nbd publishes its pid while it serves the device
        self.sys_dir(device).join("pid").exists()
    }

    fn attach(&self, device: &Path, image: &Path) -> Result<()> {
        Cmd::new(&self.qemu_nbd)
            .arg("-c")
            .arg_path(device)
            .arg_path(image)
            .error_msg(format!("attaching {}", image.display()))
            .run()?;
        self.wait_for_size(device);
        self.rescan_partitions(device);
        self.wait_for_partition_nodes(device);
        Ok(())
    }

    fn detach(&self, device: &Path) -> Result<()> {
        Cmd::new(&self.qemu_nbd)
            .arg("-d")
            .arg_path(device)
            .error_msg(format!("detaching {}", device.display()))
            .run()?;
        Ok(())
    }

    fn partitions(&self, device: &Path) -> Result<Vec<PathBuf>> {
        let names = self.sysfs_partitions(device);
        if names.is_empty() {
            tracing::debug!("{} has no partition table, using whole device", device.display());
            return Ok(vec![device.to_path_buf()]);
        }
        Ok(names.into_iter().map(|name| self.dev_dir.join(name)).collect())
    }

    fn mount(&self, partition: &Path, target: &Path) -> Result<()> {
        Cmd::new("mount")
            .arg_path(partition)
            .arg_path(target)
            .error_msg(format!("mounting {}", partition.display()))
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg_path(target)
            .error_msg(format!("unmounting {}", target.display()))
            .run()?;
        Ok(())
    }
}
