//! `/etc/hosts` rewrite.

pub const HOSTS_PATH: &str = "/etc/hosts";

const LOOPBACK: &str = "127.0.0.1";

/// Put `localhost` and `hostname` on 127.0.0.1 first, then every original
/// line that is not a 127.0.0.1 entry.
pub fn rewrite_hosts(original: &str, hostname: &str) -> String {
    let mut out = format!("{LOOPBACK} localhost\n{LOOPBACK} {hostname}\n");
    for line in original.lines() {
        if !is_loopback_entry(line) {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn is_loopback_entry(line: &str) -> bool {
    line.split_whitespace().next() == Some(LOOPBACK)
}
