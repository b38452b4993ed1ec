//! Guest identity injection.
//!
//! [`GuestCustomizer::prepare`] rewrites a fixed set of files under a guest
//! root so the VM boots with the host-assigned identity:
//!
//! | Step | Files |
//! |------|-------|
//! | hostname | `/etc/hostname` |
//! | network | udev rules, `/etc/network/interfaces[.d]` or `/etc/rc.local` |
//! | accounts | `/etc/shadow`, `/etc/passwd`, `/home/<login>` |
//! | apt proxy | `/etc/apt/apt.conf.d/02proxy` |
//! | hosts | `/etc/hosts` |
//! | ssh | `/etc/ssh/sshd_config` or `/etc/ssh/ssh_config` |
//!
//! Every step re-derives its output from the current file, so running the
//! whole procedure twice gives the same files (password hashes aside, which
//! get a fresh salt). Nothing is rolled back when a step fails.

mod accounts;
mod crypt;
mod hosts;
mod network;
mod ssh;

pub use accounts::{days_since_epoch, merge_passwd, merge_shadow, NewAccount, PasswdMerge};
pub use crypt::CredentialHasher;
pub use hosts::rewrite_hosts;
pub use network::{
    netmask_to_prefix, network_address, prefix_to_netmask, AddressMode, GuestFile,
    NetConfigBuilder, NetworkInterfaceSpec, NetworkLayout,
};
pub use ssh::enable_password_auth;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Error, Result};
use crate::guestfs::FilesystemAccessor;

use accounts::{PASSWD_PATH, SHADOW_PATH};
use hosts::HOSTS_PATH;
use ssh::SSH_CONFIG_CANDIDATES;

pub const HOSTNAME_PATH: &str = "/etc/hostname";
pub const APT_PROXY_PATH: &str = "/etc/apt/apt.conf.d/02proxy";

const APT_PROXY_PORT: u16 = 3142;
const HOME_MODE: u32 = 0o755;
const MAX_LOGIN_LEN: usize = 32;

/// A plaintext password. Never printed, never written to the guest.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(plain: impl Into<String>) -> Self {
        Self(plain.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl From<&str> for Password {
    fn from(plain: &str) -> Self {
        Self::new(plain)
    }
}

/// Everything the customizer writes into one guest.
#[derive(Debug, Clone, Default)]
pub struct GuestConfig {
    pub hostname: String,
    /// login -> plaintext password.
    pub credentials: BTreeMap<String, Password>,
    pub interfaces: Vec<NetworkInterfaceSpec>,
    pub layout: NetworkLayout,
    /// Address of an apt-cacher on port 3142.
    pub apt_proxy: Option<String>,
}

impl GuestConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    pub fn with_credential(mut self, login: impl Into<String>, password: impl Into<Password>) -> Self {
        self.credentials.insert(login.into(), password.into());
        self
    }

    pub fn with_interface(mut self, interface: NetworkInterfaceSpec) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_layout(mut self, layout: NetworkLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_apt_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.apt_proxy = Some(proxy.into());
        self
    }

    /// Reject anything that would corrupt a guest file.
    pub fn validate(&self) -> Result<()> {
        validate_hostname(&self.hostname)?;
        for login in self.credentials.keys() {
            validate_login(login)?;
        }

        let mut names = BTreeSet::new();
        for iface in &self.interfaces {
            iface.clone().validated()?;
            if !names.insert(iface.name.as_str()) {
                return Err(Error::InvalidGuestConfig(format!(
                    "interface {} listed twice",
                    iface.name
                )));
            }
        }

        if let Some(proxy) = &self.apt_proxy {
            if proxy.is_empty() || proxy.contains(|c: char| c.is_whitespace() || c == '"' || c == ';') {
                return Err(Error::InvalidGuestConfig(format!(
                    "'{proxy}' is not a proxy address"
                )));
            }
        }
        Ok(())
    }

    /// Interfaces with their MACs normalized.
    fn normalized_interfaces(&self) -> Result<Vec<NetworkInterfaceSpec>> {
        self.interfaces
            .iter()
            .map(|i| i.clone().validated())
            .collect()
    }
}

/// RFC 1123 host name.
fn validate_hostname(hostname: &str) -> Result<()> {
    let bad = |why: &str| Err(Error::InvalidGuestConfig(format!("hostname '{hostname}' {why}")));
    if hostname.is_empty() || hostname.len() > 253 {
        return bad("must be 1-253 characters");
    }
    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return bad("has an empty or overlong label");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return bad("has a label starting or ending with '-'");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return bad("contains characters other than letters, digits and '-'");
        }
    }
    Ok(())
}

/// Logins as `useradd` accepts them: `[a-z_][a-z0-9_-]*[$]?`.
fn validate_login(login: &str) -> Result<()> {
    let body = login.strip_suffix('$').unwrap_or(login);
    let mut chars = body.chars();
    let ok = login.len() <= MAX_LOGIN_LEN
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidGuestConfig(format!("'{login}' is not a valid login")))
    }
}

/// Applies a [`GuestConfig`] to a guest root.
#[derive(Debug, Clone, Default)]
pub struct GuestCustomizer {
    hasher: CredentialHasher,
}

impl GuestCustomizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hasher(hasher: CredentialHasher) -> Self {
        Self { hasher }
    }

    /// Rewrite the guest files for `guest`.
    pub fn prepare<A: FilesystemAccessor + ?Sized>(&self, fs: &A, guest: &GuestConfig) -> Result<()> {
        guest.validate()?;
        let interfaces = guest.normalized_interfaces()?;

        if !fs.exists("/etc") {
            return Err(Error::RootFilesystemNotFound {
                image: fs.root().to_path_buf(),
            });
        }
        for required in [SHADOW_PATH, PASSWD_PATH] {
            if !fs.exists(required) {
                return Err(Error::RequiredGuestFileMissing {
                    path: required.to_string(),
                });
            }
        }

        tracing::info!("Preparing guest {} at {}", guest.hostname, fs.root().display());

        self.write_hostname(fs, &guest.hostname)?;
        self.write_network(fs, &interfaces, guest.layout)?;
        self.update_shadow(fs, &guest.credentials)?;
        self.update_passwd(fs, &guest.credentials)?;
        if let Some(proxy) = &guest.apt_proxy {
            self.write_apt_proxy(fs, proxy)?;
        }
        self.update_hosts(fs, &guest.hostname)?;

        match self.update_ssh(fs) {
            Err(e) if e.is_warning() => tracing::warn!("{}", e),
            other => other?,
        }

        tracing::info!("Guest {} prepared", guest.hostname);
        Ok(())
    }

    fn write_hostname<A: FilesystemAccessor + ?Sized>(&self, fs: &A, hostname: &str) -> Result<()> {
        tracing::info!("  hostname -> {}", hostname);
        fs.write(HOSTNAME_PATH, &format!("{hostname}\n"))
    }

    fn write_network<A: FilesystemAccessor + ?Sized>(
        &self,
        fs: &A,
        interfaces: &[NetworkInterfaceSpec],
        layout: NetworkLayout,
    ) -> Result<()> {
        tracing::info!("  network: {} interface(s), {} layout", interfaces.len(), layout);
        for file in NetConfigBuilder::new(interfaces).render(layout) {
            fs.write(&file.path, &file.content)?;
            if let Some(mode) = file.mode {
                fs.set_mode(&file.path, mode)?;
            }
        }
        Ok(())
    }

    fn update_shadow<A: FilesystemAccessor + ?Sized>(
        &self,
        fs: &A,
        credentials: &BTreeMap<String, Password>,
    ) -> Result<()> {
        if credentials.is_empty() {
            return Ok(());
        }
        tracing::info!("  shadow: {} credential(s)", credentials.len());

        let hashes: BTreeMap<String, String> = credentials
            .iter()
            .map(|(login, pw)| (login.clone(), self.hasher.hash(pw.expose())))
            .collect();
        let original = fs.read_file(SHADOW_PATH)?;
        fs.write(SHADOW_PATH, &merge_shadow(&original, &hashes, days_since_epoch()))
    }

    fn update_passwd<A: FilesystemAccessor + ?Sized>(
        &self,
        fs: &A,
        credentials: &BTreeMap<String, Password>,
    ) -> Result<()> {
        let original = fs.read_file(PASSWD_PATH)?;
        let merge = merge_passwd(&original, credentials.keys().map(String::as_str));
        if merge.added.is_empty() {
            return Ok(());
        }

        fs.write(PASSWD_PATH, &merge.content)?;
        for account in &merge.added {
            tracing::info!("  passwd: added {} (uid {})", account.login, account.id);
            if fs.exists(&account.home) {
                continue;
            }
            fs.make_dirs(&account.home)?;
            fs.set_mode(&account.home, HOME_MODE)?;
            if let Err(e) = fs.set_owner(&account.home, account.id, account.id) {
                tracing::warn!("Could not chown {}: {}", account.home, e);
            }
        }
        Ok(())
    }

    fn write_apt_proxy<A: FilesystemAccessor + ?Sized>(&self, fs: &A, proxy: &str) -> Result<()> {
        tracing::info!("  apt proxy -> {}", proxy);
        fs.write(
            APT_PROXY_PATH,
            &format!("Acquire::http {{ Proxy \"http://{proxy}:{APT_PROXY_PORT}\"; }};\n"),
        )
    }

    fn update_hosts<A: FilesystemAccessor + ?Sized>(&self, fs: &A, hostname: &str) -> Result<()> {
        let original = if fs.exists(HOSTS_PATH) {
            fs.read_file(HOSTS_PATH)?
        } else {
            String::new()
        };
        fs.write(HOSTS_PATH, &rewrite_hosts(&original, hostname))
    }

    fn update_ssh<A: FilesystemAccessor + ?Sized>(&self, fs: &A) -> Result<()> {
        let Some(path) = SSH_CONFIG_CANDIDATES.into_iter().find(|p| fs.exists(p)) else {
            return Err(Error::SshConfigAbsent {
                candidates: SSH_CONFIG_CANDIDATES.iter().map(|p| p.to_string()).collect(),
            });
        };
        tracing::info!("  ssh: password authentication on in {}", path);
        let original = fs.read_file(path)?;
        fs.write(path, &enable_password_auth(&original))
    }
}
