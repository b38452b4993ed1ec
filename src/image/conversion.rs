//! Conversion handle and temporary-artifact ownership.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::target::StorageTarget;

/// Files allocated by one conversion. Deleted on drop unless released.
#[derive(Debug)]
pub(crate) struct Temporaries {
    paths: Vec<PathBuf>,
    delete_on_drop: bool,
}

impl Temporaries {
    pub(crate) fn new(delete_on_drop: bool) -> Self {
        Self {
            paths: Vec::new(),
            delete_on_drop,
        }
    }

    /// Create a fresh, uniquely named empty file under `dir` and take ownership of it.
    pub(crate) fn allocate(&mut self, dir: &Path, prefix: &str, suffix: &str) -> Result<PathBuf> {
        let path = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(dir)
            .map_err(|e| Error::io(dir, e))?
            .into_temp_path()
            .keep()
            .map_err(|e| Error::io(dir, e.error))?;
        tracing::debug!("allocated temporary {}", path.display());
        self.paths.push(path.clone());
        Ok(path)
    }

    /// Decide whether the files outlive this value. Set once the files are
    /// complete; until then a failure must remove them.
    pub(crate) fn set_delete_on_drop(&mut self, delete: bool) {
        self.delete_on_drop = delete;
    }

    pub(crate) fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for Temporaries {
    fn drop(&mut self) {
        if !self.delete_on_drop {
            return;
        }
        for path in &self.paths {
            match fs::remove_file(path) {
                Ok(()) => tracing::debug!("removed temporary {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

/// Result of [`ImageConverter::convert`](super::ImageConverter::convert).
///
/// Dropping the handle deletes every file the conversion allocated, unless
/// it was created with `keep` or [`persist`](Conversion::persist) was called.
/// Caller-supplied LVM devices are never deleted.
#[derive(Debug)]
pub struct Conversion {
    target: StorageTarget,
    temporaries: Temporaries,
}

impl Conversion {
    pub(crate) fn new(target: StorageTarget, temporaries: Temporaries) -> Self {
        Self {
            target,
            temporaries,
        }
    }

    pub fn target(&self) -> &StorageTarget {
        &self.target
    }

    pub fn destination(&self) -> &Path {
        self.target.destination()
    }

    pub fn backing(&self) -> Option<&Path> {
        self.target.backing()
    }

    /// Paths that will be deleted when this handle is dropped.
    pub fn temporaries(&self) -> &[PathBuf] {
        self.temporaries.paths()
    }

    /// Hand ownership of every artifact to the caller.
    pub fn persist(mut self) -> StorageTarget {
        self.temporaries.set_delete_on_drop(false);
        self.target.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_creates_unique_files() {
        let dir = TempDir::new().unwrap();
        let mut temps = Temporaries::new(true);
        let a = temps.allocate(dir.path(), "backing-", ".raw").unwrap();
        let b = temps.allocate(dir.path(), "backing-", ".raw").unwrap();

        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
        assert!(a.file_name().unwrap().to_string_lossy().ends_with(".raw"));
    }

    #[test]
    fn test_drop_removes_files() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut temps = Temporaries::new(true);
            temps.allocate(dir.path(), "x-", ".img").unwrap()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_tolerates_already_removed() {
        let dir = TempDir::new().unwrap();
        let mut temps = Temporaries::new(true);
        let path = temps.allocate(dir.path(), "x-", ".img").unwrap();
        fs::remove_file(&path).unwrap();
        drop(temps);
    }

    #[test]
    fn test_persist_keeps_files() {
        let dir = TempDir::new().unwrap();
        let mut temps = Temporaries::new(true);
        let dest = temps.allocate(dir.path(), "d-", ".qcow2").unwrap();
        let conv = Conversion::new(StorageTarget::Qcow2File { dest: dest.clone() }, temps);

        let target = conv.persist();
        assert_eq!(target.destination(), dest.as_path());
        assert!(dest.exists());
    }
}
