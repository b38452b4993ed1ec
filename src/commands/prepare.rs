//! Prepare command - write host identity into a guest.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use guestprep::config::Config;
use guestprep::customize::{GuestConfig, NetworkInterfaceSpec, NetworkLayout};
use guestprep::GuestImage;

/// Inputs for the prepare command.
pub struct PrepareArgs {
    pub rootfs: Option<PathBuf>,
    pub image: Option<PathBuf>,
    pub hostname: String,
    /// `login:password` pairs.
    pub users: Vec<String>,
    pub interfaces: Vec<NetworkInterfaceSpec>,
    pub layout: NetworkLayout,
    pub apt_proxy: Option<String>,
}

/// Execute the prepare command.
pub fn cmd_prepare(args: PrepareArgs, config: &Config) -> Result<()> {
    let image = match (args.rootfs, args.image) {
        (Some(root), None) => GuestImage::Directory(root),
        (None, Some(image)) => GuestImage::Disk(image),
        _ => bail!("Exactly one of --rootfs or --image is required"),
    };

    let mut guest = GuestConfig::new(args.hostname).with_layout(args.layout);
    for user in &args.users {
        let (login, password) = parse_user(user)?;
        guest = guest.with_credential(login, password);
    }
    for iface in args.interfaces {
        guest = guest.with_interface(iface);
    }
    if let Some(proxy) = args.apt_proxy.or_else(|| config.apt_proxy.clone()) {
        guest = guest.with_apt_proxy(proxy);
    }

    guestprep::prepare_guest(&image, &guest, config)
        .with_context(|| format!("Failed to prepare {}", image.path().display()))?;

    println!("Prepared {} as {}", image.path().display(), guest.hostname);
    Ok(())
}

/// `login:password`, split at the first colon.
fn parse_user(user: &str) -> Result<(&str, &str)> {
    match user.split_once(':') {
        Some((login, password)) if !login.is_empty() => Ok((login, password)),
        _ => bail!("--user expects login:password, got '{}'", user),
    }
}
