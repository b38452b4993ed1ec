//! Lookup and mac commands - address discovery for prepared guests.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use guestprep::discovery::{
    lookup_mac, parse_arp_scan, parse_dnsmasq_leases, MacGenerator, DNSMASQ_LEASES_PATH,
};

/// Execute the lookup command.
pub fn cmd_lookup(mac: &str, leases: Option<PathBuf>, arp_scan: Option<PathBuf>) -> Result<()> {
    let leases = leases.unwrap_or_else(|| PathBuf::from(DNSMASQ_LEASES_PATH));
    let leases_text = read_source(&leases)?;
    let arp_text = arp_scan.as_deref().map(read_source).transpose()?;

    match find_address(mac, &leases_text, arp_text.as_deref()) {
        Some(ip) => {
            println!("{ip}");
            Ok(())
        }
        None => bail!("No address known for {mac}"),
    }
}

/// Execute the mac command.
pub fn cmd_mac(count: usize) -> Result<()> {
    for mac in MacGenerator::new().take(count) {
        println!("{mac}");
    }
    Ok(())
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Leases win over arp-scan output.
fn find_address(mac: &str, leases: &str, arp_scan: Option<&str>) -> Option<Ipv4Addr> {
    lookup_mac(&parse_dnsmasq_leases(leases), mac)
        .or_else(|| arp_scan.and_then(|text| lookup_mac(&parse_arp_scan(text), mac)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASES: &str = "1700000000 52:54:00:aa:bb:01 192.168.122.10 vm1 *\n";
    const ARP: &str = "192.168.122.20\t52:54:00:aa:bb:02\tQEMU\n\
                       192.168.122.30\t52:54:00:aa:bb:01\tQEMU\n";

    #[test]
    fn test_lease_found_case_insensitive() {
        assert_eq!(
            find_address("52:54:00:AA:BB:01", LEASES, Some(ARP)),
            Some(Ipv4Addr::new(192, 168, 122, 10))
        );
    }

    #[test]
    fn test_arp_scan_fills_gaps() {
        assert_eq!(
            find_address("52:54:00:aa:bb:02", LEASES, Some(ARP)),
            Some(Ipv4Addr::new(192, 168, 122, 20))
        );
        assert_eq!(find_address("52:54:00:aa:bb:02", LEASES, None), None);
    }

    #[test]
    fn test_lookup_reads_lease_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let leases = dir.path().join("dnsmasq.leases");
        fs::write(&leases, LEASES).unwrap();

        assert!(cmd_lookup("52:54:00:aa:bb:01", Some(leases.clone()), None).is_ok());
        assert!(cmd_lookup("52:54:00:aa:bb:09", Some(leases), None).is_err());
        assert!(cmd_lookup("52:54:00:aa:bb:01", Some(dir.path().join("missing")), None).is_err());
    }
}
