//! SHA-512 crypt (`$6$`) password hashes for `/etc/shadow`.
//!
//! Implements the glibc `sha512-crypt` scheme on top of the `sha2` crate so
//! hashes written here verify with the guest's own PAM stack.

use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha512};

const PREFIX: &str = "$6$";
const ROUNDS_PREFIX: &str = "rounds=";
const DEFAULT_ROUNDS: u32 = 5000;
const MIN_ROUNDS: u32 = 1000;
const MAX_ROUNDS: u32 = 999_999_999;
const MAX_SALT_LEN: usize = 16;

const CRYPT_ALPHABET: &[u8; 64] =
    b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Byte triples of the final digest, in output order.
const OUTPUT_ORDER: [(usize, usize, usize); 21] = [
    (0, 21, 42),
    (22, 43, 1),
    (44, 2, 23),
    (3, 24, 45),
    (25, 46, 4),
    (47, 5, 26),
    (6, 27, 48),
    (28, 49, 7),
    (50, 8, 29),
    (9, 30, 51),
    (31, 52, 10),
    (53, 11, 32),
    (12, 33, 54),
    (34, 55, 13),
    (56, 14, 35),
    (15, 36, 57),
    (37, 58, 16),
    (59, 17, 38),
    (18, 39, 60),
    (40, 61, 19),
    (62, 20, 41),
];

/// Salted SHA-512 crypt hashing with a fresh random salt per call.
#[derive(Debug, Clone, Copy)]
pub struct CredentialHasher {
    rounds: Option<u32>,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialHasher {
    /// glibc default cost; the hash carries no `rounds=` field.
    pub fn new() -> Self {
        Self { rounds: None }
    }

    /// Explicit cost, clamped to the range glibc accepts.
    pub fn with_rounds(rounds: u32) -> Self {
        Self {
            rounds: Some(rounds.clamp(MIN_ROUNDS, MAX_ROUNDS)),
        }
    }

    /// Hash `password` with a new 16 character salt.
    pub fn hash(&self, password: &str) -> String {
        let salt: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(MAX_SALT_LEN)
            .map(char::from)
            .collect();
        self.hash_with_salt(password, &salt)
    }

    /// Hash with a caller-chosen salt (truncated to 16 characters).
    pub fn hash_with_salt(&self, password: &str, salt: &str) -> String {
        sha512_crypt(password.as_bytes(), salt, self.rounds)
    }

    /// Check `password` against an existing `$6$` hash.
    pub fn verify(password: &str, hash: &str) -> bool {
        let Some(rest) = hash.strip_prefix(PREFIX) else {
            return false;
        };

        let (rounds, rest) = match rest.strip_prefix(ROUNDS_PREFIX) {
            Some(r) => {
                let Some((n, rest)) = r.split_once('$') else {
                    return false;
                };
                match n.parse::<u32>() {
                    Ok(n) => (Some(n.clamp(MIN_ROUNDS, MAX_ROUNDS)), rest),
                    Err(_) => return false,
                }
            }
            None => (None, rest),
        };

        let Some((salt, _)) = rest.split_once('$') else {
            return false;
        };
        sha512_crypt(password.as_bytes(), salt, rounds) == hash
    }
}

fn digest(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Repeat `seed` cyclically to `len` bytes.
fn stretch(seed: &[u8; 64], len: usize) -> Vec<u8> {
    seed.iter().copied().cycle().take(len).collect()
}

fn sha512_crypt(key: &[u8], salt: &str, rounds: Option<u32>) -> String {
    let salt = &salt.as_bytes()[..salt.len().min(MAX_SALT_LEN)];
    let count = rounds.unwrap_or(DEFAULT_ROUNDS);

    let alternate = digest(&[key, salt, key]);

    let mut hasher = Sha512::new();
    hasher.update(key);
    hasher.update(salt);
    let mut remaining = key.len();
    while remaining > 64 {
        hasher.update(alternate);
        remaining -= 64;
    }
    hasher.update(&alternate[..remaining]);
    let mut bits = key.len();
    while bits > 0 {
        if bits & 1 != 0 {
            hasher.update(alternate);
        } else {
            hasher.update(key);
        }
        bits >>= 1;
    }
    let mut result = [0u8; 64];
    result.copy_from_slice(&hasher.finalize());

    let key_seed = {
        let mut h = Sha512::new();
        for _ in 0..key.len() {
            h.update(key);
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&h.finalize());
        out
    };
    let p_bytes = stretch(&key_seed, key.len());

    let salt_seed = {
        let mut h = Sha512::new();
        for _ in 0..16 + usize::from(result[0]) {
            h.update(salt);
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&h.finalize());
        out
    };
    let s_bytes = stretch(&salt_seed, salt.len());

    for round in 0..count {
        let mut h = Sha512::new();
        if round & 1 != 0 {
            h.update(&p_bytes);
        } else {
            h.update(result);
        }
        if round % 3 != 0 {
            h.update(&s_bytes);
        }
        if round % 7 != 0 {
            h.update(&p_bytes);
        }
        if round & 1 != 0 {
            h.update(result);
        } else {
            h.update(&p_bytes);
        }
        result.copy_from_slice(&h.finalize());
    }

    let mut out = String::with_capacity(PREFIX.len() + 24 + salt.len() + 87);
    out.push_str(PREFIX);
    if let Some(n) = rounds {
        out.push_str(&format!("{ROUNDS_PREFIX}{n}$"));
    }
    out.push_str(&String::from_utf8_lossy(salt));
    out.push('$');
    for (a, b, c) in OUTPUT_ORDER {
        encode_24(&mut out, result[a], result[b], result[c], 4);
    }
    encode_24(&mut out, 0, 0, result[63], 2);
    out
}

fn encode_24(out: &mut String, b2: u8, b1: u8, b0: u8, chars: usize) {
    let mut w = (u32::from(b2) << 16) | (u32::from(b1) << 8) | u32::from(b0);
    for _ in 0..chars {
        out.push(char::from(CRYPT_ALPHABET[(w & 0x3f) as usize]));
        w >>= 6;
    }
}
