//! guestprep - prepare VM disk images without booting them.
//!
//! - Convert a qcow2 image into raw, qcow2, qcow, overlay or LVM layouts
//! - Write hostname, network, accounts, hosts, ssh and apt proxy into a guest
//! - Check the host has qemu-img, qemu-nbd and the nbd driver

mod commands;
mod logging;
mod preflight;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};

use guestprep::config::Config;
use guestprep::customize::{NetworkInterfaceSpec, NetworkLayout};

#[derive(Parser)]
#[command(name = "guestprep")]
#[command(about = "Guest disk image conversion and preparation")]
#[command(
    after_help = "QUICK START:\n  guestprep preflight                          Check host tools\n  guestprep convert --source base.qcow2 --target qcow2-copy\n  guestprep prepare --image vm.qcow2 --hostname vm1 --user root:secret"
)]
struct Cli {
    /// Debug logging (GUESTPREP_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a qcow2 image into a storage target
    Convert {
        /// Source qcow2 image
        #[arg(long)]
        source: PathBuf,

        /// raw-file, qcow2-file, qcow2-copy, qcow-legacy,
        /// qcow2-on-raw-backing, qcow2-on-lvm-backing, lvm-raw
        #[arg(long)]
        target: String,

        /// LVM volume for the lvm targets
        #[arg(long)]
        device: Option<PathBuf>,

        /// Where outputs are created (default: GUESTPREP_WORK_DIR)
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Compress the output (qcow2-file, qcow-legacy)
        #[arg(long)]
        compress: bool,

        /// Preallocate qcow2 metadata (qcow2-file)
        #[arg(long)]
        preallocate: bool,

        /// Keep outputs even if verification fails
        #[arg(long)]
        keep: bool,
    },

    /// Write hostname, network, users, hosts and ssh policy into a guest
    #[command(group(ArgGroup::new("guest").required(true).args(["rootfs", "image"])))]
    Prepare {
        /// Guest root that is already a directory (container rootfs)
        #[arg(long)]
        rootfs: Option<PathBuf>,

        /// Disk image to attach over NBD (needs root)
        #[arg(long)]
        image: Option<PathBuf>,

        #[arg(long)]
        hostname: String,

        /// login:password, repeatable
        #[arg(long = "user")]
        users: Vec<String>,

        /// name=mac,ip/prefix[,gateway] or name=mac,dhcp, repeatable
        #[arg(long = "iface")]
        interfaces: Vec<NetworkInterfaceSpec>,

        /// monolithic, per-interface or container-init
        #[arg(long, default_value = "monolithic")]
        layout: NetworkLayout,

        /// apt-cacher address (default: GUESTPREP_APT_PROXY)
        #[arg(long)]
        apt_proxy: Option<String>,
    },

    /// Show format, size and backing file of an image
    Probe {
        image: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Find the address leased to a guest MAC
    Lookup {
        mac: String,

        /// dnsmasq lease file (default: /var/lib/misc/dnsmasq.leases)
        #[arg(long)]
        leases: Option<PathBuf>,

        /// Saved `arp-scan -l` output, consulted when no lease matches
        #[arg(long)]
        arp_scan: Option<PathBuf>,
    },

    /// Generate MACs for new guest NICs
    Mac {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Run preflight checks (host tools, nbd driver, work dir)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config {
        #[arg(long)]
        json: bool,
    },
    /// List storage targets
    Targets,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();
    logging::init(cli.verbose);
    let config = Config::load();

    match cli.command {
        Commands::Convert {
            source,
            target,
            device,
            work_dir,
            compress,
            preallocate,
            keep,
        } => {
            commands::cmd_convert(
                commands::ConvertArgs {
                    source,
                    target,
                    device,
                    work_dir,
                    compress,
                    preallocate,
                    keep,
                },
                &config,
            )?;
        }

        Commands::Prepare {
            rootfs,
            image,
            hostname,
            users,
            interfaces,
            layout,
            apt_proxy,
        } => {
            commands::cmd_prepare(
                commands::PrepareArgs {
                    rootfs,
                    image,
                    hostname,
                    users,
                    interfaces,
                    layout,
                    apt_proxy,
                },
                &config,
            )?;
        }

        Commands::Probe { image, json } => {
            commands::cmd_probe(&image, json, &config)?;
        }

        Commands::Lookup {
            mac,
            leases,
            arp_scan,
        } => {
            commands::cmd_lookup(&mac, leases, arp_scan)?;
        }

        Commands::Mac { count } => {
            commands::cmd_mac(count)?;
        }

        Commands::Preflight { strict, json } => {
            commands::cmd_preflight(&config, strict, json)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config { json } => commands::show::ShowTarget::Config { json },
                ShowTarget::Targets => commands::show::ShowTarget::Targets,
            };
            commands::cmd_show(show_target, &config)?;
        }
    }

    Ok(())
}
