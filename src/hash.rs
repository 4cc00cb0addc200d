// src/hash.rs

//! Checksums for staleness detection
//!
//! Every executed file is identified by the SHA-256 of its *rendered* SQL
//! text, so editing a template or the data feeding it changes the checksum
//! even when the file on disk is untouched. A change's combined checksum
//! hashes the ordered list of its per-file checksums, which detects
//! in-place edits to already-applied changes.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of arbitrary bytes
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Checksum over an ordered list of checksums.
///
/// Entries are joined with a newline before hashing so list boundaries
/// stay unambiguous.
pub fn combined_checksum(checksums: &[String]) -> String {
    sha256_hex(checksums.join("\n").as_bytes())
}
