//! Preflight command - runs preflight checks.

use anyhow::Result;

use guestprep::config::Config;

use crate::preflight;

/// Execute the preflight command.
pub fn cmd_preflight(config: &Config, strict: bool, json: bool) -> Result<()> {
    let report = if strict {
        preflight::run_preflight_or_fail(config)?
    } else {
        preflight::run_preflight(config)
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    report.print();
    if !report.all_passed() {
        println!("Some checks failed. Use --strict to exit non-zero.");
    }
    Ok(())
}
