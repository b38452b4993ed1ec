//! Preflight checks for guestprep.
//!
//! Validates host tools and the environment before converting or mounting.
//! Run with `guestprep preflight` to check everything is ready.

mod environment;
mod host_tools;
mod types;

use anyhow::{bail, Result};

use guestprep::config::Config;

pub use types::PreflightReport;

/// Run all preflight checks.
pub fn run_preflight(config: &Config) -> PreflightReport {
    let mut checks = Vec::new();

    tracing::info!("Checking host tools...");
    checks.extend(host_tools::check_host_tools(config));

    tracing::info!("Checking host environment...");
    checks.extend(environment::check_environment(config));

    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(config: &Config) -> Result<PreflightReport> {
    let report = run_preflight(config);

    if !report.all_passed() {
        report.print();
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above first.",
            report.fail_count()
        );
    }
    Ok(report)
}
