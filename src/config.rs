//! Configuration management for guestprep.
//!
//! Reads configuration from the process environment. `main` loads a `.env`
//! file first (via dotenvy), so real environment variables take precedence
//! over `.env` entries.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

/// Default number of `/dev/nbdN` slots scanned (the kernel's default `nbds_max`).
pub const DEFAULT_NBD_SLOTS: usize = 16;

/// Guestprep configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// qemu-img binary used for conversion, overlay creation and probing
    pub qemu_img: String,
    /// qemu-nbd binary used to attach images as block devices
    pub qemu_nbd: String,
    /// Directory where conversion temporaries and mount points are created
    pub work_dir: PathBuf,
    /// Number of NBD slots to scan
    pub nbd_slots: usize,
    /// apt-cacher address written into guests when set
    pub apt_proxy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_vars(&HashMap::new())
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    fn from_vars(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let qemu_img = get("GUESTPREP_QEMU_IMG").unwrap_or_else(|| "qemu-img".to_string());
        let qemu_nbd = get("GUESTPREP_QEMU_NBD").unwrap_or_else(|| "qemu-nbd".to_string());

        let work_dir = get("GUESTPREP_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_work_dir);

        let nbd_slots = match get("GUESTPREP_NBD_SLOTS") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    "GUESTPREP_NBD_SLOTS={} is not a number, using {}",
                    raw,
                    DEFAULT_NBD_SLOTS
                );
                DEFAULT_NBD_SLOTS
            }),
            None => DEFAULT_NBD_SLOTS,
        };

        let apt_proxy = get("GUESTPREP_APT_PROXY");

        Self {
            qemu_img,
            qemu_nbd,
            work_dir,
            nbd_slots,
            apt_proxy,
        }
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  GUESTPREP_QEMU_IMG:   {}", self.qemu_img);
        println!("  GUESTPREP_QEMU_NBD:   {}", self.qemu_nbd);
        println!("  GUESTPREP_WORK_DIR:   {}", self.work_dir.display());
        println!("  GUESTPREP_NBD_SLOTS:  {}", self.nbd_slots);
        println!(
            "  GUESTPREP_APT_PROXY:  {}",
            self.apt_proxy.as_deref().unwrap_or("(none)")
        );
    }
}

fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("guestprep"))
        .unwrap_or_else(|| PathBuf::from("/tmp/guestprep"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(&HashMap::new());
        assert_eq!(config.qemu_img, "qemu-img");
        assert_eq!(config.qemu_nbd, "qemu-nbd");
        assert_eq!(config.nbd_slots, DEFAULT_NBD_SLOTS);
        assert!(config.apt_proxy.is_none());
        assert!(config.work_dir.ends_with("guestprep"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_vars(&vars(&[
            ("GUESTPREP_QEMU_IMG", "/opt/qemu/bin/qemu-img"),
            ("GUESTPREP_WORK_DIR", "/var/tmp/prep"),
            ("GUESTPREP_NBD_SLOTS", "4"),
            ("GUESTPREP_APT_PROXY", "10.0.0.1"),
        ]));
        assert_eq!(config.qemu_img, "/opt/qemu/bin/qemu-img");
        assert_eq!(config.work_dir, PathBuf::from("/var/tmp/prep"));
        assert_eq!(config.nbd_slots, 4);
        assert_eq!(config.apt_proxy.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_bad_slot_count_falls_back() {
        let config = Config::from_vars(&vars(&[("GUESTPREP_NBD_SLOTS", "many")]));
        assert_eq!(config.nbd_slots, DEFAULT_NBD_SLOTS);
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = Config::from_vars(&vars(&[("GUESTPREP_APT_PROXY", "  ")]));
        assert!(config.apt_proxy.is_none());
    }

    #[test]
    #[serial]
    fn test_load_reads_process_env() {
        std::env::set_var("GUESTPREP_QEMU_NBD", "/usr/local/bin/qemu-nbd");
        let config = Config::load();
        std::env::remove_var("GUESTPREP_QEMU_NBD");
        assert_eq!(config.qemu_nbd, "/usr/local/bin/qemu-nbd");
    }
}
