//! Shared test utilities for guestprep tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use guestprep::error::{Error, Result};
use guestprep::guestfs::DeviceHost;
use tempfile::TempDir;

pub const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
debian:x:1000:1000:Debian:/home/debian:/bin/bash\n\
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin\n";

pub const SHADOW: &str = "root:$6$oldhash:19000:0:99999:7:::\n\
daemon:*:19000:0:99999:7:::\n\
existing:$6$x:19000:0:99999:7:::\n";

pub const HOSTS: &str = "127.0.0.1\tlocalhost\n\
127.0.1.1\tdebian\n\
127.0.0.1 old-name\n\
::1     localhost ip6-localhost ip6-loopback\n";

pub const SSHD_CONFIG: &str = "Include /etc/ssh/sshd_config.d/*.conf\n\
#PermitRootLogin prohibit-password\n\
#PasswordAuthentication yes\n\
UsePAM yes\n";

/// Test environment with a scratch guest root and work dir.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Guest root filesystem
    pub root: PathBuf,
    /// Work dir for conversions and mount points
    pub work_dir: PathBuf,
    /// Fake helper scripts
    pub bin_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let root = base.join("rootfs");
        let work_dir = base.join("work");
        let bin_dir = base.join("bin");
        for dir in [&root, &work_dir, &bin_dir] {
            fs::create_dir_all(dir).expect("Failed to create test dir");
        }

        Self {
            _temp_dir: temp_dir,
            root,
            work_dir,
            bin_dir,
        }
    }

    /// Path inside the guest root.
    pub fn guest(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    pub fn read_guest(&self, path: &str) -> String {
        let host = self.guest(path);
        fs::read_to_string(&host)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", host.display(), e))
    }

    /// Files currently in the work dir.
    pub fn work_entries(&self) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.work_dir)
            .expect("Failed to read work dir")
            .map(|e| e.unwrap().path())
            .collect();
        entries.sort();
        entries
    }
}

/// Create a minimal Debian-like guest root.
pub fn create_guest_rootfs(root: &Path) {
    for dir in ["etc/ssh", "etc/network", "home/debian", "root"] {
        fs::create_dir_all(root.join(dir)).expect("Failed to create guest dir");
    }
    let files = [
        ("etc/passwd", PASSWD),
        ("etc/shadow", SHADOW),
        ("etc/hosts", HOSTS),
        ("etc/hostname", "debian\n"),
        ("etc/ssh/sshd_config", SSHD_CONFIG),
    ];
    for (path, content) in files {
        fs::write(root.join(path), content).expect("Failed to create guest file");
    }
}

/// Every file under `root` with its content, for before/after comparisons.
pub fn snapshot(root: &Path) -> HashMap<PathBuf, Vec<u8>> {
    let mut out = HashMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).expect("Failed to read dir") {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    out
}

/// Write an executable shell script.
pub fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("Failed to write script");
    let mut perms = fs::metadata(path).expect("Failed to get metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("Failed to set permissions");
}

const FAKE_QEMU_IMG: &str = r#"#!/bin/sh
echo "$*" >> "@LOG@"
cmd="$1"
shift
if [ "$cmd" = "@FAIL@" ]; then
    echo "simulated $cmd failure" >&2
    exit 1
fi
case "$cmd" in
convert)
    fmt=""
    while [ $# -gt 2 ]; do
        case "$1" in
        -O) fmt="$2"; shift 2 ;;
        -f|-o) shift 2 ;;
        *) shift ;;
        esac
    done
    if [ ! -f "$1" ]; then
        echo "Could not open '$1'" >&2
        exit 1
    fi
    [ "$fmt" = host_device ] && fmt=raw
    printf 'format=%s\n' "$fmt" > "$2"
    ;;
create)
    opts=""
    while [ $# -gt 1 ]; do
        case "$1" in
        -o) opts="$2"; shift 2 ;;
        *) shift ;;
        esac
    done
    backing=$(echo "$opts" | sed -n 's/.*backing_file=\([^,]*\).*/\1/p')
    bfmt=$(echo "$opts" | sed -n 's/.*backing_fmt=\([^,]*\).*/\1/p')
    printf 'format=qcow2\nbacking=%s\nbacking_fmt=%s\n' "$backing" "$bfmt" > "$1"
    ;;
info)
    path="$2"
    fmt=$(sed -n 's/^format=//p' "$path")
    backing=$(sed -n 's/^backing=//p' "$path")
    bfmt=$(sed -n 's/^backing_fmt=//p' "$path")
    if [ -n "$backing" ]; then
        printf '{"filename": "%s", "format": "%s", "virtual-size": 1048576, "backing-filename": "%s", "backing-filename-format": "%s"}\n' "$path" "$fmt" "$backing" "$bfmt"
    else
        printf '{"filename": "%s", "format": "%s", "virtual-size": 1048576}\n' "$path" "$fmt"
    fi
    ;;
*)
    echo "unknown command $cmd" >&2
    exit 1
    ;;
esac
"#;

/// A `qemu-img` stand-in that logs its arguments (one call per line) and
/// writes `format=<fmt>` marker files its own `info` can read back.
///
/// `fail_on` names a subcommand that exits 1.
pub struct FakeQemuImg {
    pub program: PathBuf,
    pub log: PathBuf,
}

impl FakeQemuImg {
    pub fn install(bin_dir: &Path, fail_on: Option<&str>) -> Self {
        let program = bin_dir.join("qemu-img");
        let log = bin_dir.join("qemu-img.log");
        let script = FAKE_QEMU_IMG
            .replace("@LOG@", &log.to_string_lossy())
            .replace("@FAIL@", fail_on.unwrap_or("none"));
        write_script(&program, &script);
        Self { program, log }
    }

    pub fn program_str(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Logged invocations, oldest first.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Source image the fake `qemu-img` recognizes as qcow2.
pub fn create_source_image(dir: &Path) -> PathBuf {
    let path = dir.join("base.qcow2");
    fs::write(&path, "format=qcow2\n").expect("Failed to create source image");
    path
}

/// A device host backed by plain directories.
///
/// Each partition is a directory under `disk`; "mounting" renames it onto
/// the mount point and "unmounting" renames it back, so writes through the
/// mount land in the partition directory.
pub struct SimHost {
    pub slots: Vec<PathBuf>,
    pub busy: HashSet<PathBuf>,
    pub partitions: Vec<(PathBuf, PathBuf)>,
    pub fail_attach: bool,
    pub events: RefCell<Vec<String>>,
    mounted: RefCell<HashMap<PathBuf, (PathBuf, PathBuf)>>,
}

impl SimHost {
    /// Partitions `/dev/nbd0p1..` backed by `disk/p1..`.
    pub fn new(disk: &Path, partition_count: usize) -> Self {
        let partitions = (1..=partition_count)
            .map(|i| {
                let dir = disk.join(format!("p{i}"));
                (PathBuf::from(format!("/dev/nbd0p{i}")), dir)
            })
            .collect();
        Self {
            slots: vec![PathBuf::from("/dev/nbd0"), PathBuf::from("/dev/nbd1")],
            busy: HashSet::new(),
            partitions,
            fail_attach: false,
            events: RefCell::new(Vec::new()),
            mounted: RefCell::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    fn record(&self, event: String) {
        self.events.borrow_mut().push(event);
    }

    fn backing_dir(&self, partition: &Path) -> Option<PathBuf> {
        self.partitions
            .iter()
            .find(|(dev, _)| dev == partition)
            .map(|(_, dir)| dir.clone())
    }
}

fn sim_failure(program: &str, message: &str) -> Error {
    Error::ExternalToolFailure {
        program: program.to_string(),
        code: Some(1),
        message: message.to_string(),
    }
}

impl DeviceHost for SimHost {
    fn slots(&self) -> Vec<PathBuf> {
        self.slots.clone()
    }

    fn is_busy(&self, device: &Path) -> bool {
        self.busy.contains(device)
    }

    fn attach(&self, device: &Path, image: &Path) -> Result<()> {
        if self.fail_attach {
            return Err(sim_failure("qemu-nbd", "Failed to open image"));
        }
        self.record(format!("attach {} {}", device.display(), image.display()));
        Ok(())
    }

    fn detach(&self, device: &Path) -> Result<()> {
        self.record(format!("detach {}", device.display()));
        Ok(())
    }

    fn partitions(&self, _device: &Path) -> Result<Vec<PathBuf>> {
        Ok(self.partitions.iter().map(|(dev, _)| dev.clone()).collect())
    }

    fn mount(&self, partition: &Path, target: &Path) -> Result<()> {
        let dir = self
            .backing_dir(partition)
            .filter(|d| d.is_dir())
            .ok_or_else(|| sim_failure("mount", "wrong fs type, bad superblock"))?;
        fs::rename(&dir, target).map_err(|e| Error::io(target, e))?;
        self.mounted
            .borrow_mut()
            .insert(target.to_path_buf(), (partition.to_path_buf(), dir));
        self.record(format!("mount {}", partition.display()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let (partition, dir) = self
            .mounted
            .borrow_mut()
            .remove(target)
            .ok_or_else(|| sim_failure("umount", "not mounted"))?;
        fs::rename(target, &dir).map_err(|e| Error::io(target, e))?;
        fs::create_dir(target).map_err(|e| Error::io(target, e))?;
        self.record(format!("umount {}", partition.display()));
        Ok(())
    }
}
