//! Host tool availability checks.

use guestprep::config::Config;
use guestprep::process;

use super::types::CheckResult;

/// Check the helpers conversion and mounting shell out to.
pub fn check_host_tools(config: &Config) -> Vec<CheckResult> {
    let required_tools = [
        (config.qemu_img.as_str(), "qemu-utils", "Required for image conversion"),
        (config.qemu_nbd.as_str(), "qemu-utils", "Required to attach disk images"),
        ("mount", "util-linux", "Required to mount guest partitions"),
        ("umount", "util-linux", "Required to release guest partitions"),
        ("cp", "coreutils", "Required for qcow2-file copies"),
    ];

    required_tools
        .into_iter()
        .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose))
        .collect()
}

/// Check if a tool exists in PATH (or at the configured path).
fn check_tool_exists(tool: &str, package: &str, purpose: &str) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path),
        None => CheckResult::fail(
            tool,
            &format!("Not found. Install '{}' package. {}", package, purpose),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::CheckStatus;

    #[test]
    fn test_missing_configured_tool_fails() {
        let config = Config {
            qemu_img: "nonexistent-qemu-img-12345".to_string(),
            ..Config::default()
        };
        let results = check_host_tools(&config);
        let qemu_img = results
            .iter()
            .find(|r| r.name == "nonexistent-qemu-img-12345")
            .unwrap();
        assert_eq!(qemu_img.status, CheckStatus::Fail);
        assert!(qemu_img.details.as_deref().unwrap().contains("qemu-utils"));
    }

    #[test]
    fn test_coreutils_found() {
        let results = check_host_tools(&Config::default());
        let cp = results.iter().find(|r| r.name == "cp").unwrap();
        assert_eq!(cp.status, CheckStatus::Pass);
    }
}
