//! Host environment checks (work dir, nbd driver, privileges, disk space).

use std::path::Path;

use guestprep::config::Config;
use guestprep::process::Cmd;

use super::types::CheckResult;

/// Warn below this much free space in the work dir.
const MIN_FREE_GB: u64 = 10;

pub fn check_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(check_work_dir(&config.work_dir));

    // nbd driver: only needed for disk images, container roots work without it
    if Path::new("/sys/module/nbd").exists() {
        results.push(CheckResult::pass("nbd module"));
    } else {
        results.push(CheckResult::warn(
            "nbd module",
            "Not loaded - disk images cannot be mounted. Run: modprobe nbd max_part=16",
        ));
    }

    let slots = (0..config.nbd_slots)
        .filter(|i| Path::new(&format!("/dev/nbd{i}")).exists())
        .count();
    if slots > 0 {
        results.push(CheckResult::pass_with(
            "nbd devices",
            &format!("{}/{} present", slots, config.nbd_slots),
        ));
    } else {
        results.push(CheckResult::warn("nbd devices", "No /dev/nbdN nodes found"));
    }

    // id instead of a libc dependency
    if let Ok(result) = Cmd::new("id").arg("-u").allow_fail().run() {
        if result.stdout_trimmed() == "0" {
            results.push(CheckResult::pass("root privileges"));
        } else {
            results.push(CheckResult::warn(
                "root privileges",
                "Not root - attaching and mounting images needs root",
            ));
        }
    }

    if let Some(check) = check_disk_space(&config.work_dir) {
        results.push(check);
    }

    results
}

fn check_work_dir(work_dir: &Path) -> CheckResult {
    let name = "work dir writable";
    if let Err(e) = std::fs::create_dir_all(work_dir) {
        return CheckResult::fail(name, &format!("Cannot create {}: {}", work_dir.display(), e));
    }

    let test_file = work_dir.join(".preflight-test");
    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            CheckResult::pass_with(name, &work_dir.display().to_string())
        }
        Err(e) => CheckResult::fail(
            name,
            &format!("Cannot write to {}: {}", work_dir.display(), e),
        ),
    }
}

fn check_disk_space(work_dir: &Path) -> Option<CheckResult> {
    let result = Cmd::new("df")
        .args(["--output=avail", "-B1"])
        .arg_path(work_dir)
        .allow_fail()
        .run()
        .ok()?;
    if !result.success() {
        return None;
    }

    // Skip header line, get available bytes
    let avail_bytes: u64 = result.stdout.lines().nth(1)?.trim().parse().ok()?;
    let free_gb = avail_bytes / (1024 * 1024 * 1024);
    Some(if free_gb < MIN_FREE_GB {
        CheckResult::warn(
            "disk space",
            &format!("{}GB free - raw conversions need the full virtual size", free_gb),
        )
    } else {
        CheckResult::pass_with("disk space", &format!("{}GB free", free_gb))
    })
}
