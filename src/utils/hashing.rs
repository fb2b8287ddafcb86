use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::prelude::*;

#[cfg(test)]
#[path = "hashing_tests.rs"]
mod tests;

pub const HASH_HEX_LEN: usize = 64;

/// SHA-256 of a byte slice, lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Streams a reader through SHA-256, returning `(hex, bytes_read)`.
pub fn hash_reader(r: &mut impl Read) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let copied = io::copy(r, &mut hasher).context("Read failed while hashing")?;
    Ok((hex::encode(hasher.finalize()), copied))
}

pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path).with_context(|| format!("Cannot open {path:?}"))?;
    hash_reader(&mut file).with_context(|| format!("Cannot hash {path:?}"))
}

pub fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Incremental interface used by the fingerprinter to feed canonical
/// field-by-field bytes without going through string formatting.
pub struct IncrementalHasher {
    hasher: Sha256,
}

impl IncrementalHasher {
    pub fn new() -> Self {
        IncrementalHasher { hasher: Sha256::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}
