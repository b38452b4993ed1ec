//! `/etc/shadow` and `/etc/passwd` merging.
//!
//! Both merges are line based and leave every line they do not own
//! byte-identical, comments and blank lines included.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SHADOW_PATH: &str = "/etc/shadow";
pub const PASSWD_PATH: &str = "/etc/passwd";

/// Ids at or above this are reserved (`nobody` and friends).
const SYSTEM_ID_CEILING: u32 = 65000;
/// Distance between the highest existing id and the first new one.
const ID_OFFSET: u32 = 1024;

const DEFAULT_SHELL: &str = "/bin/bash";

/// An account appended to passwd by [`merge_passwd`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub login: String,
    pub id: u32,
    pub home: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdMerge {
    pub content: String,
    pub added: Vec<NewAccount>,
}

/// Whole days since the epoch, for the shadow "last change" field.
pub fn days_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / 86_400)
        .unwrap_or(0)
}

fn is_record(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

fn login_of(line: &str) -> Option<&str> {
    is_record(line).then(|| line.split(':').next().unwrap_or(line))
}

/// Replace the hash field of requested logins and append the missing ones.
///
/// `hashes` maps login to a ready `$6$` hash. New entries get
/// `login:hash:<days>:0:99999:7:::`.
pub fn merge_shadow(original: &str, hashes: &BTreeMap<String, String>, days: u64) -> String {
    let mut seen = BTreeSet::new();
    let mut out = String::with_capacity(original.len() + hashes.len() * 128);

    for line in original.lines() {
        match login_of(line).and_then(|login| hashes.get_key_value(login)) {
            Some((login, hash)) => {
                seen.insert(login.as_str());
                let mut fields: Vec<&str> = line.split(':').collect();
                if fields.len() < 2 {
                    fields.push(hash.as_str());
                } else {
                    fields[1] = hash.as_str();
                }
                out.push_str(&fields.join(":"));
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }

    for (login, hash) in hashes {
        if !seen.contains(login.as_str()) {
            out.push_str(&format!("{login}:{hash}:{days}:0:99999:7:::\n"));
        }
    }
    out
}

/// Highest uid/gid below the reserved range, or 0.
fn max_regular_id(ids: &BTreeSet<u32>) -> u32 {
    ids.range(..SYSTEM_ID_CEILING).next_back().copied().unwrap_or(0)
}

/// Append passwd entries for `logins` that are not there yet.
///
/// Returns the original text untouched when nothing is added.
pub fn merge_passwd<'a>(original: &str, logins: impl IntoIterator<Item = &'a str>) -> PasswdMerge {
    let mut existing = BTreeSet::new();
    let mut ids = BTreeSet::new();

    for line in original.lines().filter(|l| is_record(l)) {
        let fields: Vec<&str> = line.split(':').collect();
        existing.insert(fields[0].to_string());
        for field in fields.iter().skip(2).take(2) {
            if let Ok(id) = field.parse::<u32>() {
                ids.insert(id);
            }
        }
    }

    let wanted: BTreeSet<&str> = logins
        .into_iter()
        .filter(|l| !existing.contains(*l))
        .collect();
    if wanted.is_empty() {
        return PasswdMerge {
            content: original.to_string(),
            added: Vec::new(),
        };
    }

    let mut next = max_regular_id(&ids) + ID_OFFSET;
    let mut added = Vec::with_capacity(wanted.len());
    for login in wanted {
        while ids.contains(&next) {
            next += 1;
        }
        ids.insert(next);
        added.push(NewAccount {
            login: login.to_string(),
            id: next,
            home: format!("/home/{login}"),
        });
        next += 1;
    }

    let mut content = original.trim_end_matches('\n').to_string();
    if !content.is_empty() {
        content.push('\n');
    }
    for account in &added {
        content.push_str(&format!(
            "{login}:x:{id}:{id}::{home}:{DEFAULT_SHELL}\n",
            login = account.login,
            id = account.id,
            home = account.home,
        ));
    }

    PasswdMerge { content, added }
}
