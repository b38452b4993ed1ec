//! Error types for image conversion and guest customization.
//!
//! Every failure this crate can report is one variant of [`Error`], so the
//! VM manager can match on the kind and decide whether to skip a VM or abort
//! the whole start/stop run:
//! ```ignore
//! match guestprep::prepare_guest(image, &guest, &config) {
//!     Err(Error::AmbiguousRootFilesystem { .. }) => { /* refuse this image */ }
//!     Err(Error::ExternalToolFailure { .. }) => { /* host problem, abort */ }
//!     _ => {}
//! }
//! ```

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested storage target is unknown or missing a required device.
    #[error("unsupported storage target '{target}': {reason}")]
    UnsupportedStorageTarget { target: String, reason: String },

    /// `compress` / `preallocate` requested for a target that cannot honor it.
    #[error("option '{option}' is not valid for storage target '{target}'")]
    IncompatibleConversionOption {
        option: &'static str,
        target: &'static str,
    },

    /// Every NBD slot is bound to another image.
    #[error("no free block device slot (checked {checked} slots)")]
    DeviceAllocationExhausted { checked: usize },

    /// No partition (or directory) holds a guest root filesystem.
    #[error("root filesystem not found in {image}")]
    RootFilesystemNotFound { image: PathBuf },

    /// More than one partition looks like a guest root; multi-boot images are refused.
    #[error("ambiguous root filesystem in {image}: both {first} and {second} contain /etc")]
    AmbiguousRootFilesystem {
        image: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },

    /// A guest file the customization must rewrite does not exist.
    #[error("required guest file {path} is missing")]
    RequiredGuestFileMissing { path: String },

    /// Neither sshd_config nor ssh_config exists. Callers log this and continue.
    #[error("no ssh configuration found in guest (looked for {})", candidates.join(", "))]
    SshConfigAbsent { candidates: Vec<String> },

    /// An external helper exited non-zero or could not be started.
    #[error("{program} failed{}: {message}", code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    ExternalToolFailure {
        program: String,
        code: Option<i32>,
        message: String,
    },

    /// Hostname, credentials or interface data failed validation.
    #[error("invalid guest configuration: {0}")]
    InvalidGuestConfig(String),

    /// Filesystem error on a host path.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap an `io::Error` with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that callers are expected to log and move past.
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::SshConfigAbsent { .. })
    }
}

/// Attach a path to `io::Result` values.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_failure_message_includes_exit_code() {
        let err = Error::ExternalToolFailure {
            program: "qemu-img".into(),
            code: Some(1),
            message: "Could not open 'x'".into(),
        };
        assert_eq!(
            err.to_string(),
            "qemu-img failed (exit code 1): Could not open 'x'"
        );
    }

    #[test]
    fn test_tool_failure_without_code() {
        let err = Error::ExternalToolFailure {
            program: "qemu-nbd".into(),
            code: None,
            message: "No such file or directory".into(),
        };
        assert_eq!(err.to_string(), "qemu-nbd failed: No such file or directory");
    }

    #[test]
    fn test_only_ssh_absence_is_a_warning() {
        let warn = Error::SshConfigAbsent {
            candidates: vec!["/etc/ssh/sshd_config".into()],
        };
        assert!(warn.is_warning());
        assert!(!Error::DeviceAllocationExhausted { checked: 16 }.is_warning());
    }

    #[test]
    fn test_io_context_keeps_path() {
        let res: io::Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let err = res.at("/tmp/x").unwrap_err();
        assert!(err.to_string().starts_with("/tmp/x: "));
    }
}
