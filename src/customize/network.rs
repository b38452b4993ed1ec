//! Interface definitions and udev naming rules for the guest.
//!
//! [`NetConfigBuilder`] renders a set of [`NetworkInterfaceSpec`]s into the
//! guest files for one [`NetworkLayout`]. Output is sorted by interface name
//! so repeated runs write identical bytes.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const UDEV_RULES_PATH: &str = "/etc/udev/rules.d/70-persistent-net.rules";
pub const INTERFACES_PATH: &str = "/etc/network/interfaces";
pub const INTERFACES_DIR: &str = "/etc/network/interfaces.d";
pub const RC_LOCAL_PATH: &str = "/etc/rc.local";

const LOOPBACK_STANZA: &str = "auto lo\niface lo inet loopback\n";
const MAX_IFNAME_LEN: usize = 15;

/// How an interface gets its IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AddressMode {
    Dhcp,
    Static { address: Ipv4Addr, prefix_len: u8 },
}

/// One guest NIC: kernel name, MAC to bind it to, addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub name: String,
    pub mac: String,
    pub mode: AddressMode,
    pub gateway: Option<Ipv4Addr>,
}

impl NetworkInterfaceSpec {
    /// Build from the loose tuple form `(mac, "dhcp" | ip, prefix, gateway)`.
    pub fn from_parts(
        name: &str,
        mac: &str,
        address: &str,
        prefix_len: Option<u8>,
        gateway: Option<&str>,
    ) -> Result<Self> {
        let mode = if address.eq_ignore_ascii_case("dhcp") {
            AddressMode::Dhcp
        } else {
            let address = parse_ipv4(address)?;
            let prefix_len = prefix_len.ok_or_else(|| {
                Error::InvalidGuestConfig(format!("static interface {name} needs a prefix length"))
            })?;
            AddressMode::Static {
                address,
                prefix_len,
            }
        };
        let gateway = gateway.map(parse_ipv4).transpose()?;

        let spec = Self {
            name: name.to_string(),
            mac: mac.to_string(),
            mode,
            gateway,
        };
        spec.validated()
    }

    /// Check the name and addressing, and normalize the MAC to lowercase.
    pub fn validated(mut self) -> Result<Self> {
        validate_ifname(&self.name)?;
        self.mac = normalize_mac(&self.mac)?;
        if let AddressMode::Static { prefix_len, .. } = self.mode {
            if prefix_len > 32 {
                return Err(Error::InvalidGuestConfig(format!(
                    "prefix length {prefix_len} for {} is out of range",
                    self.name
                )));
            }
        }
        Ok(self)
    }

    /// `interfaces(5)` stanza, without a trailing blank line.
    fn stanza(&self) -> String {
        let mut out = format!("auto {}\n", self.name);
        match self.mode {
            AddressMode::Dhcp => {
                out.push_str(&format!("iface {} inet dhcp\n", self.name));
            }
            AddressMode::Static {
                address,
                prefix_len,
            } => {
                out.push_str(&format!("iface {} inet static\n", self.name));
                out.push_str(&format!("    address {address}\n"));
                out.push_str(&format!(
                    "    network {}\n",
                    network_address(address, prefix_len)
                ));
                out.push_str(&format!("    netmask {}\n", prefix_to_netmask(prefix_len)));
                if let Some(gw) = self.gateway {
                    out.push_str(&format!("    gateway {gw}\n"));
                }
            }
        }
        out
    }

    fn udev_rule(&self) -> String {
        format!(
            "SUBSYSTEM==\"net\", DRIVERS==\"?*\", ATTR{{address}}==\"{}\", NAME=\"{}\"",
            self.mac, self.name
        )
    }
}

/// `name=mac,ip/prefix[,gateway]` or `name=mac,dhcp`.
impl FromStr for NetworkInterfaceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || {
            Error::InvalidGuestConfig(format!(
                "interface '{s}' is not name=mac,ip/prefix[,gateway] or name=mac,dhcp"
            ))
        };
        let (name, rest) = s.split_once('=').ok_or_else(bad)?;
        let mut fields = rest.split(',');
        let mac = fields.next().ok_or_else(bad)?;
        let address = fields.next().ok_or_else(bad)?;
        let gateway = fields.next();
        if fields.next().is_some() {
            return Err(bad());
        }

        if address.eq_ignore_ascii_case("dhcp") {
            if gateway.is_some() {
                return Err(bad());
            }
            return Self::from_parts(name, mac, address, None, None);
        }

        let (ip, prefix) = address.split_once('/').ok_or_else(bad)?;
        let prefix: u8 = prefix.parse().map_err(|_| bad())?;
        Self::from_parts(name, mac, ip, Some(prefix), gateway)
    }
}

/// Which files carry the interface definitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkLayout {
    /// Everything in `/etc/network/interfaces`.
    #[default]
    Monolithic,
    /// One file per interface under `/etc/network/interfaces.d`.
    PerInterface,
    /// `ifconfig`/`dhclient` lines in `/etc/rc.local` for lightweight containers.
    ContainerInit,
}

impl fmt::Display for NetworkLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkLayout::Monolithic => "monolithic",
            NetworkLayout::PerInterface => "per-interface",
            NetworkLayout::ContainerInit => "container-init",
        };
        f.write_str(name)
    }
}

impl FromStr for NetworkLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "monolithic" => Ok(NetworkLayout::Monolithic),
            "per-interface" => Ok(NetworkLayout::PerInterface),
            "container-init" => Ok(NetworkLayout::ContainerInit),
            other => Err(Error::InvalidGuestConfig(format!(
                "unknown network layout '{other}'"
            ))),
        }
    }
}

/// A rendered guest file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFile {
    pub path: String,
    pub content: String,
    pub mode: Option<u32>,
}

impl GuestFile {
    fn new(path: impl Into<String>, content: String) -> Self {
        Self {
            path: path.into(),
            content,
            mode: None,
        }
    }
}

/// Renders interface definitions and udev rules.
#[derive(Debug, Clone)]
pub struct NetConfigBuilder {
    interfaces: Vec<NetworkInterfaceSpec>,
}

impl NetConfigBuilder {
    pub fn new(interfaces: &[NetworkInterfaceSpec]) -> Self {
        let mut interfaces = interfaces.to_vec();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Self { interfaces }
    }

    /// One rule per interface binding its MAC to its name.
    pub fn udev_rules(&self) -> String {
        self.interfaces
            .iter()
            .map(|i| i.udev_rule() + "\n")
            .collect()
    }

    /// Full `/etc/network/interfaces` with loopback first.
    pub fn interfaces_file(&self) -> String {
        let mut stanzas = vec![LOOPBACK_STANZA.to_string()];
        stanzas.extend(self.interfaces.iter().map(NetworkInterfaceSpec::stanza));
        stanzas.join("\n")
    }

    /// `/etc/rc.local` bringing interfaces up without ifupdown.
    pub fn rc_local(&self) -> String {
        let mut out = String::from("#!/bin/sh -e\n");
        for iface in &self.interfaces {
            match iface.mode {
                AddressMode::Dhcp => out.push_str(&format!("dhclient {}\n", iface.name)),
                AddressMode::Static {
                    address,
                    prefix_len,
                } => {
                    out.push_str(&format!(
                        "ifconfig {} {} netmask {} up\n",
                        iface.name,
                        address,
                        prefix_to_netmask(prefix_len)
                    ));
                    if let Some(gw) = iface.gateway {
                        out.push_str(&format!("route add default gw {gw} {}\n", iface.name));
                    }
                }
            }
        }
        out.push_str("exit 0\n");
        out
    }

    /// Every file `layout` needs, udev rules included.
    pub fn render(&self, layout: NetworkLayout) -> Vec<GuestFile> {
        let mut files = vec![GuestFile::new(UDEV_RULES_PATH, self.udev_rules())];
        match layout {
            NetworkLayout::Monolithic => {
                files.push(GuestFile::new(INTERFACES_PATH, self.interfaces_file()));
            }
            NetworkLayout::PerInterface => {
                files.push(GuestFile::new(
                    INTERFACES_PATH,
                    format!("{LOOPBACK_STANZA}\nsource {INTERFACES_DIR}/*\n"),
                ));
                for iface in &self.interfaces {
                    files.push(GuestFile::new(
                        format!("{INTERFACES_DIR}/{}", iface.name),
                        iface.stanza(),
                    ));
                }
            }
            NetworkLayout::ContainerInit => {
                files.push(GuestFile {
                    path: RC_LOCAL_PATH.to_string(),
                    content: self.rc_local(),
                    mode: Some(0o755),
                });
            }
        }
        files
    }
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.parse()
        .map_err(|_| Error::InvalidGuestConfig(format!("'{s}' is not an IPv4 address")))
}

/// Kernel-acceptable names that are also safe as a file name and inside a
/// quoted udev value.
fn validate_ifname(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidGuestConfig(format!(
            "'{name}' is not a valid interface name"
        )))
    }
}

/// Lowercase `aa:bb:cc:dd:ee:ff`, rejecting anything else.
fn normalize_mac(mac: &str) -> Result<String> {
    let parts: Vec<&str> = mac.split(':').collect();
    let ok = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    if ok {
        Ok(mac.to_ascii_lowercase())
    } else {
        Err(Error::InvalidGuestConfig(format!("'{mac}' is not a MAC address")))
    }
}

/// `24` -> `255.255.255.0`. Prefixes above 32 saturate.
pub fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(prefix_len.min(32));
    let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
    Ipv4Addr::from(mask)
}

/// Inverse of [`prefix_to_netmask`]; `None` for non-contiguous masks.
pub fn netmask_to_prefix(netmask: Ipv4Addr) -> Option<u8> {
    let mask = u32::from(netmask);
    let prefix = mask.leading_ones() as u8;
    (prefix_to_netmask(prefix) == netmask).then_some(prefix)
}

pub fn network_address(address: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address) & u32::from(prefix_to_netmask(prefix_len)))
}
