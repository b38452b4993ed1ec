//! Direct access to a guest root that is already a host directory.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, IoContext, Result};

use super::{resolve_guest_path, FilesystemAccessor};

/// Symlink hops followed when reading through guest links.
const MAX_LINK_HOPS: usize = 8;

/// A guest root living at a host path (container rootfs, or a mount point).
#[derive(Debug, Clone)]
pub struct HostRoot {
    root: PathBuf,
}

impl HostRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn host_path(&self, guest: &str) -> Result<PathBuf> {
        resolve_guest_path(&self.root, guest)
    }

    /// Resolve a guest path for reading, following final-component symlinks
    /// inside the guest. Absolute link targets are re-rooted, never followed
    /// onto the host.
    fn follow(&self, guest: &str) -> Result<PathBuf> {
        let mut guest_path = PathBuf::from(guest);
        for _ in 0..MAX_LINK_HOPS {
            let host = self.host_path(&guest_path.to_string_lossy())?;
            match fs::symlink_metadata(&host) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let target = fs::read_link(&host).at(&host)?;
                    let joined = if target.is_absolute() {
                        target
                    } else {
                        guest_path
                            .parent()
                            .unwrap_or_else(|| Path::new("/"))
                            .join(target)
                    };
                    guest_path = clamp_to_root(&joined);
                }
                _ => return Ok(host),
            }
        }
        Err(Error::io(
            self.host_path(guest)?,
            io::Error::new(io::ErrorKind::Other, "too many levels of symbolic links"),
        ))
    }
}

/// Lexically normalize a link target, treating `..` at `/` as `/`.
fn clamp_to_root(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

impl FilesystemAccessor for HostRoot {
    fn root(&self) -> &Path {
        &self.root
    }

    fn write(&self, path: &str, content: &str) -> Result<()> {
        let host = self.host_path(path)?;
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        // Replace links instead of writing through them. The new file takes
        // the mode of the guest file the link pointed at.
        let mut link_mode = None;
        if let Ok(meta) = fs::symlink_metadata(&host) {
            if meta.file_type().is_symlink() {
                link_mode = self
                    .follow(path)
                    .ok()
                    .and_then(|target| fs::metadata(target).ok())
                    .map(|target| target.permissions().mode() & 0o7777);
                fs::remove_file(&host).at(&host)?;
            }
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        if let Some(mode) = link_mode {
            options.mode(mode);
        }
        let mut file = options.open(&host).at(&host)?;
        file.write_all(content.as_bytes()).at(&host)?;
        if let Some(mode) = link_mode {
            // umask may have narrowed it
            fs::set_permissions(&host, fs::Permissions::from_mode(mode)).at(&host)?;
        }
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<String> {
        let host = self.follow(path)?;
        fs::read_to_string(&host).at(&host)
    }

    fn exists(&self, path: &str) -> bool {
        match self.follow(path) {
            Ok(host) => host.exists(),
            Err(_) => false,
        }
    }

    fn remove_if_exists(&self, path: &str) -> Result<()> {
        let host = self.host_path(path)?;
        match fs::remove_file(&host) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(host, e)),
        }
    }

    fn make_dirs(&self, path: &str) -> Result<()> {
        let host = self.host_path(path)?;
        fs::create_dir_all(&host).at(&host)
    }

    fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        let host = self.host_path(path)?;
        fs::set_permissions(&host, fs::Permissions::from_mode(mode)).at(&host)
    }

    fn set_owner(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let host = self.host_path(path)?;
        std::os::unix::fs::chown(&host, Some(uid), Some(gid)).at(&host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn guest() -> (TempDir, HostRoot) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        let root = HostRoot::new(dir.path());
        (dir, root)
    }

    #[test]
    fn test_write_creates_parents_and_reads_back() {
        let (dir, root) = guest();
        root.write("/etc/apt/apt.conf.d/02proxy", "proxy\n").unwrap();

        assert_eq!(root.read_file("/etc/apt/apt.conf.d/02proxy").unwrap(), "proxy\n");
        assert!(dir.path().join("etc/apt/apt.conf.d/02proxy").is_file());
    }

    #[test]
    fn test_exists_and_remove() {
        let (_dir, root) = guest();
        assert!(root.exists("/etc"));
        assert!(!root.exists("/etc/hostname"));

        root.write("/etc/hostname", "vm1\n").unwrap();
        assert!(root.exists("/etc/hostname"));

        root.remove_if_exists("/etc/hostname").unwrap();
        root.remove_if_exists("/etc/hostname").unwrap();
        assert!(!root.exists("/etc/hostname"));
    }

    #[test]
    fn test_absolute_symlink_is_rerooted_for_reads() {
        let (dir, root) = guest();
        fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        fs::write(dir.path().join("usr/lib/os-release"), "ID=debian\n").unwrap();
        std::os::unix::fs::symlink("/usr/lib/os-release", dir.path().join("etc/os-release"))
            .unwrap();

        assert_eq!(root.read_file("/etc/os-release").unwrap(), "ID=debian\n");
    }

    #[test]
    fn test_relative_symlink_cannot_climb_out() {
        let (dir, root) = guest();
        fs::write(dir.path().join("etc/real-hosts"), "127.0.0.1 localhost\n").unwrap();
        std::os::unix::fs::symlink(
            "../../../../etc/real-hosts",
            dir.path().join("etc/hosts"),
        )
        .unwrap();

        assert_eq!(root.read_file("/etc/hosts").unwrap(), "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_write_replaces_symlink() {
        let (dir, root) = guest();
        let outside = TempDir::new().unwrap();
        let host_file = outside.path().join("hostname");
        fs::write(&host_file, "host\n").unwrap();
        std::os::unix::fs::symlink(&host_file, dir.path().join("etc/hostname")).unwrap();

        root.write("/etc/hostname", "guest\n").unwrap();

        assert_eq!(fs::read_to_string(&host_file).unwrap(), "host\n");
        let meta = fs::symlink_metadata(dir.path().join("etc/hostname")).unwrap();
        assert!(meta.file_type().is_file());
    }

    #[test]
    fn test_write_through_link_keeps_target_mode() {
        let (dir, root) = guest();
        let real = dir.path().join("etc/shadow.real");
        fs::write(&real, "root:*:19000:0:99999:7:::\n").unwrap();
        fs::set_permissions(&real, fs::Permissions::from_mode(0o640)).unwrap();
        std::os::unix::fs::symlink("/etc/shadow.real", dir.path().join("etc/shadow")).unwrap();

        root.write("/etc/shadow", "root:$6$x$y:19000:0:99999:7:::\n").unwrap();

        let meta = fs::symlink_metadata(dir.path().join("etc/shadow")).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        assert_eq!(
            fs::read_to_string(&real).unwrap(),
            "root:*:19000:0:99999:7:::\n"
        );
    }

    #[test]
    fn test_make_dirs_and_mode() {
        let (dir, root) = guest();
        root.make_dirs("/home/alice").unwrap();
        root.set_mode("/home/alice", 0o750).unwrap();

        let mode = fs::metadata(dir.path().join("home/alice"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn test_read_missing_is_io_error() {
        let (_dir, root) = guest();
        let err = root.read_file("/etc/shadow").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
