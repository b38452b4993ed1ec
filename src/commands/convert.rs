//! Convert command - produce a storage target from a qcow2 image.

use std::path::PathBuf;

use anyhow::{Context, Result};

use guestprep::config::Config;
use guestprep::image::{ConversionOptions, ImageConverter, StorageTarget, TargetMode};

/// Inputs for the convert command.
pub struct ConvertArgs {
    pub source: PathBuf,
    pub target: String,
    pub device: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub compress: bool,
    pub preallocate: bool,
    pub keep: bool,
}

/// Execute the convert command.
///
/// A verified result is always handed to the user. `keep` additionally
/// leaves the artifacts behind when verification fails.
pub fn cmd_convert(args: ConvertArgs, config: &Config) -> Result<()> {
    let mode = TargetMode::parse(&args.target, args.device.as_deref())?;
    let options = ConversionOptions {
        compress: args.compress,
        preallocate: args.preallocate,
        keep: args.keep,
    };
    let work_dir = args.work_dir.unwrap_or_else(|| config.work_dir.clone());

    let converter = ImageConverter::from_config(config);
    let conversion = converter
        .convert(&args.source, &work_dir, &mode, &options)
        .with_context(|| format!("Failed to convert {}", args.source.display()))?;

    let info = converter
        .verify(&conversion)
        .with_context(|| format!("Converted image failed verification ({})", mode))?;

    let target = conversion.persist();
    println!("Converted {} ({})", args.source.display(), mode);
    print_target(&target);
    println!("  format:      {}", info.format);
    println!("  size:        {} bytes", info.virtual_size);
    Ok(())
}

fn print_target(target: &StorageTarget) {
    println!("  destination: {}", target.destination().display());
    if let Some(backing) = target.backing() {
        println!("  backing:     {}", backing.display());
    }
}
