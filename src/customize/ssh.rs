//! Force password authentication on in the guest's ssh configuration.

pub const SSHD_CONFIG_PATH: &str = "/etc/ssh/sshd_config";
pub const SSH_CONFIG_PATH: &str = "/etc/ssh/ssh_config";

/// Server config first; the client config is the fallback.
pub const SSH_CONFIG_CANDIDATES: [&str; 2] = [SSHD_CONFIG_PATH, SSH_CONFIG_PATH];

const DIRECTIVE: &str = "PasswordAuthentication";
const ENABLED: &str = "PasswordAuthentication yes";

/// True for `PasswordAuthentication ...`, commented out or not.
fn is_directive(line: &str) -> bool {
    let body = line.trim_start().trim_start_matches('#').trim_start();
    match body.get(..DIRECTIVE.len()) {
        Some(keyword) if keyword.eq_ignore_ascii_case(DIRECTIVE) => body[DIRECTIVE.len()..]
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '='),
        _ => false,
    }
}

/// Rewrite every directive line to `PasswordAuthentication yes`, or append
/// one when there is none.
pub fn enable_password_auth(original: &str) -> String {
    let mut found = false;
    let mut out = String::with_capacity(original.len() + ENABLED.len() + 1);

    for line in original.lines() {
        if is_directive(line) {
            found = true;
            out.push_str(ENABLED);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    if !found {
        out.push_str(ENABLED);
        out.push('\n');
    }
    out
}
