//! Helpers for the VM manager's address discovery.
//!
//! None of this touches a guest image. It covers the pieces the manager
//! needs around prepared guests: generating MACs for new NICs, mapping MACs
//! back to addresses from a lease file or `arp-scan` output, caching which
//! bridge backs a hypervisor network, and parsing `login:pass@host+port`
//! targets.
//!
//! The `lookup` and `mac` commands use the lease parsers and the generator.
//! [`BridgeCache`] and [`SshTarget`] are library API for the manager.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use rand::Rng;

use crate::customize::Password;
use crate::error::{Error, Result};

pub const DNSMASQ_LEASES_PATH: &str = "/var/lib/misc/dnsmasq.leases";

/// `(connection uri, network name)` -> bridge interface.
///
/// Owned by the caller; nothing is shared between instances.
#[derive(Debug, Default)]
pub struct BridgeCache {
    entries: HashMap<(String, String), String>,
}

impl BridgeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached bridge, or the result of `lookup` which is then cached.
    /// A failed lookup caches nothing.
    pub fn get_or_insert_with<F>(&mut self, uri: &str, network: &str, lookup: F) -> Result<String>
    where
        F: FnOnce() -> Result<String>,
    {
        let key = (uri.to_string(), network.to_string());
        if let Some(bridge) = self.entries.get(&key) {
            return Ok(bridge.clone());
        }
        let bridge = lookup()?;
        tracing::debug!("bridge for {}/{} is {}", uri, network, bridge);
        self.entries.insert(key, bridge.clone());
        Ok(bridge)
    }

    pub fn get(&self, uri: &str, network: &str) -> Option<&str> {
        self.entries
            .get(&(uri.to_string(), network.to_string()))
            .map(String::as_str)
    }

    /// Forget one network, e.g. after it was redefined.
    pub fn invalidate(&mut self, uri: &str, network: &str) -> Option<String> {
        self.entries.remove(&(uri.to_string(), network.to_string()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `(MAC, address)` pairs from a dnsmasq lease file.
///
/// Lines are `<expiry> <mac> <ip> <hostname> <client-id>`. MACs come back
/// uppercase. IPv6 and malformed lines are skipped.
pub fn parse_dnsmasq_leases(text: &str) -> Vec<(String, Ipv4Addr)> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _expiry = fields.next()?;
            let mac = fields.next()?;
            let ip = fields.next()?.parse().ok()?;
            Some((mac.to_ascii_uppercase(), ip))
        })
        .collect()
}

/// `(MAC, address)` pairs from `arp-scan -l` output.
pub fn parse_arp_scan(text: &str) -> Vec<(String, Ipv4Addr)> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let ip = fields.next()?.parse().ok()?;
            let mac = fields.next()?;
            is_mac(mac).then(|| (mac.to_ascii_uppercase(), ip))
        })
        .collect()
}

/// Address leased to `mac`, if any.
pub fn lookup_mac(pairs: &[(String, Ipv4Addr)], mac: &str) -> Option<Ipv4Addr> {
    pairs
        .iter()
        .find(|(m, _)| m.eq_ignore_ascii_case(mac))
        .map(|(_, ip)| *ip)
}

fn is_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Sequential MACs under a fixed 3-byte prefix.
///
/// Starts at a random point of the 24-bit space and wraps around.
#[derive(Debug, Clone)]
pub struct MacGenerator {
    prefix: [u8; 3],
    counter: u32,
}

const MAC_SPACE: u32 = 1 << 24;

impl MacGenerator {
    pub const DEFAULT_PREFIX: [u8; 3] = [0x00, 0x44, 0x01];

    pub fn new() -> Self {
        Self::with_start(Self::DEFAULT_PREFIX, rand::rng().random_range(0..MAC_SPACE))
    }

    /// The first MAC returned is `start + 1`.
    pub fn with_start(prefix: [u8; 3], start: u32) -> Self {
        Self {
            prefix,
            counter: start % MAC_SPACE,
        }
    }
}

impl Default for MacGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for MacGenerator {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.counter = (self.counter + 1) % MAC_SPACE;
        let [_, a, b, c] = self.counter.to_be_bytes();
        let [p0, p1, p2] = self.prefix;
        Some(format!(
            "{p0:02X}:{p1:02X}:{p2:02X}:{a:02X}:{b:02X}:{c:02X}"
        ))
    }
}

/// `login:password@host[+port]`.
#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub login: String,
    pub password: Password,
    pub host: String,
    pub port: Option<u16>,
}

impl SshTarget {
    pub const DEFAULT_PORT: u16 = 22;

    /// The login ends at the first `:`, the host starts after the last `@`,
    /// so passwords may contain both.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = |why: &str| Error::InvalidGuestConfig(format!("ssh target '{s}': {why}"));

        let (login, rest) = s.split_once(':').ok_or_else(|| bad("missing ':'"))?;
        let (password, address) = rest.rsplit_once('@').ok_or_else(|| bad("missing '@'"))?;
        let (host, port) = match address.split_once('+') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| bad("bad port"))?;
                (host, Some(port))
            }
            None => (address, None),
        };
        if host.is_empty() {
            return Err(bad("empty host"));
        }

        Ok(Self {
            login: login.to_string(),
            password: Password::new(password),
            host: host.to_string(),
            port,
        })
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(Self::DEFAULT_PORT)
    }
}

impl FromStr for SshTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("login", &self.login)
            .field("password", &self.password)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_bridge_cache_looks_up_once() {
        let mut cache = BridgeCache::new();
        let calls = Cell::new(0);
        let lookup = || {
            calls.set(calls.get() + 1);
            Ok("virbr0".to_string())
        };

        assert_eq!(cache.get_or_insert_with("qemu:///system", "default", lookup).unwrap(), "virbr0");
        assert_eq!(cache.get_or_insert_with("qemu:///system", "default", lookup).unwrap(), "virbr0");
        assert_eq!(calls.get(), 1);

        cache.invalidate("qemu:///system", "default");
        cache.get_or_insert_with("qemu:///system", "default", lookup).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_bridge_cache_keys_by_uri() {
        let mut cache = BridgeCache::new();
        cache
            .get_or_insert_with("qemu:///system", "default", || Ok("virbr0".into()))
            .unwrap();
        cache
            .get_or_insert_with("qemu+ssh://h/system", "default", || Ok("br1".into()))
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("qemu+ssh://h/system", "default"), Some("br1"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bridge_cache_failed_lookup_not_cached() {
        let mut cache = BridgeCache::new();
        let err = cache.get_or_insert_with("u", "n", || {
            Err(Error::InvalidGuestConfig("no such network".into()))
        });
        assert!(err.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dnsmasq_leases() {
        let text = "1700000000 52:54:00:ab:cd:ef 192.168.122.10 vm1 01:52:54:00:ab:cd:ef\n\
                    duid 00:01:00:01:2a:2b:2c:2d:52:54:00:00:00:01\n\
                    1700000001 52:54:00:00:00:02 192.168.122.11 * *\n";
        let leases = parse_dnsmasq_leases(text);
        assert_eq!(
            leases,
            [
                ("52:54:00:AB:CD:EF".to_string(), Ipv4Addr::new(192, 168, 122, 10)),
                ("52:54:00:00:00:02".to_string(), Ipv4Addr::new(192, 168, 122, 11)),
            ]
        );
        assert_eq!(
            lookup_mac(&leases, "52:54:00:ab:cd:ef"),
            Some(Ipv4Addr::new(192, 168, 122, 10))
        );
    }

    #[test]
    fn test_arp_scan_output() {
        let text = "Interface: virbr0, type: EN10MB\n\
                    Starting arp-scan 1.10.0\n\
                    192.168.122.10\t52:54:00:ab:cd:ef\tQEMU\n\
                    \n\
                    2 packets received by filter\n";
        assert_eq!(
            parse_arp_scan(text),
            [("52:54:00:AB:CD:EF".to_string(), Ipv4Addr::new(192, 168, 122, 10))]
        );
    }

    #[test]
    fn test_mac_generator_sequence_and_wrap() {
        let mut macs = MacGenerator::with_start(MacGenerator::DEFAULT_PREFIX, 0xFF_FFFE);
        assert_eq!(macs.next().unwrap(), "00:44:01:FF:FF:FF");
        assert_eq!(macs.next().unwrap(), "00:44:01:00:00:00");
        assert_eq!(macs.next().unwrap(), "00:44:01:00:00:01");
    }

    #[test]
    fn test_mac_generator_random_start_keeps_prefix() {
        let mac = MacGenerator::new().next().unwrap();
        assert!(mac.starts_with("00:44:01:"));
        assert!(is_mac(&mac));
    }

    #[test]
    fn test_ssh_target_greedy_password() {
        let target = SshTarget::parse("root:p@ss:word@10.0.0.5+2222").unwrap();
        assert_eq!(target.login, "root");
        assert_eq!(target.password.expose(), "p@ss:word");
        assert_eq!(target.host, "10.0.0.5");
        assert_eq!(target.port, Some(2222));
    }

    #[test]
    fn test_ssh_target_default_port() {
        let target: SshTarget = "ubuntu:s3cret@vm1".parse().unwrap();
        assert_eq!(target.port, None);
        assert_eq!(target.port_or_default(), 22);
        assert!(!format!("{target:?}").contains("s3cret"));
    }

    #[test]
    fn test_ssh_target_rejects_garbage() {
        assert!(SshTarget::parse("root@host").is_err());
        assert!(SshTarget::parse("root:pw").is_err());
        assert!(SshTarget::parse("root:pw@").is_err());
        assert!(SshTarget::parse("root:pw@host+ssh").is_err());
    }
}
