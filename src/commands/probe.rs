//! Probe command - what does qemu-img say about an image.

use std::path::Path;

use anyhow::{Context, Result};

use guestprep::config::Config;
use guestprep::image::ImageConverter;

/// Execute the probe command.
pub fn cmd_probe(path: &Path, json: bool, config: &Config) -> Result<()> {
    let info = ImageConverter::from_config(config)
        .probe(path)
        .with_context(|| format!("Failed to probe {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}", info.filename);
    println!("  format:  {}", info.format);
    println!("  size:    {} bytes", info.virtual_size);
    if let Some(backing) = &info.backing_filename {
        println!(
            "  backing: {} ({})",
            backing,
            info.backing_format.as_deref().unwrap_or("format unknown")
        );
    }
    Ok(())
}
