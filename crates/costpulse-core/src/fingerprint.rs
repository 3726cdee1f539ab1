//! Content fingerprints used as deduplication keys.
//!
//! A fingerprint is the lowercase hex SHA-256 of the UTF-8 bytes of the text.
//! It depends on nothing but those bytes, so hashes written by one run match
//! the hashes computed by the next.

use std::fmt::Write;

use sha2::{Digest, Sha256};

/// Width of every fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 64;

/// Fingerprint `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_digest(&hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}
