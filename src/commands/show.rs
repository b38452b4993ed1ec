//! Show command - displays information.

use anyhow::Result;

use guestprep::config::Config;
use guestprep::image::TARGET_TAGS;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config { json: bool },
    /// List storage targets
    Targets,
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config { json: true } => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ShowTarget::Config { json: false } => {
            config.print();
        }
        ShowTarget::Targets => {
            println!("Storage targets:");
            for tag in TARGET_TAGS {
                println!("  {}", tag);
            }
        }
    }
    Ok(())
}
