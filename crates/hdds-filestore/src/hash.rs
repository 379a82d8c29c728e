// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Keyed HighwayHash-64, seeded per stream/segment as §3.2 describes:
//! `sha256("<stream-name>-<index>")` provides the 256-bit HighwayHash key.

use highway::{HighwayHash, HighwayHasher, Key};
use sha2::{Digest, Sha256};

/// A keyed hash state, cheap to clone (the key is small and `Copy`-able via
/// [`Key`]), one per segment or per stream meta file.
#[derive(Clone)]
pub struct KeyedHasher {
    key: Key,
}

impl KeyedHasher {
    /// Derive a hasher keyed by `sha256(seed)`, split into four `u64` lanes
    /// the way `highway::Key` expects.
    pub fn from_seed(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut lanes = [0u64; 4];
        for (i, lane) in lanes.iter_mut().enumerate() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[i * 8..i * 8 + 8]);
            *lane = u64::from_le_bytes(bytes);
        }
        Self {
            key: Key(lanes),
        }
    }

    /// Hash `parts` in order, returning the 64-bit digest used as the
    /// trailing record hash / meta.sum value.
    pub fn hash64(&self, parts: &[&[u8]]) -> u64 {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut buf = Vec::with_capacity(total);
        for part in parts {
            buf.extend_from_slice(part);
        }
        HighwayHasher::new(self.key).hash64(&buf)
    }
}

/// Segment key: `"<stream-name>-<index>"`.
pub fn segment_seed(stream_name: &str, index: u32) -> String {
    format!("{stream_name}-{index}")
}

/// Stream meta key: `"<stream-name>"`.
pub fn stream_seed(stream_name: &str) -> String {
    stream_name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_hash() {
        let a = KeyedHasher::from_seed("orders-1");
        let b = KeyedHasher::from_seed("orders-1");
        assert_eq!(a.hash64(&[b"hello"]), b.hash64(&[b"hello"]));
    }

    #[test]
    fn different_seed_different_hash() {
        let a = KeyedHasher::from_seed("orders-1");
        let b = KeyedHasher::from_seed("orders-2");
        assert_ne!(a.hash64(&[b"hello"]), b.hash64(&[b"hello"]));
    }

    #[test]
    fn different_content_different_hash() {
        let h = KeyedHasher::from_seed("orders-1");
        assert_ne!(h.hash64(&[b"hello"]), h.hash64(&[b"world"]));
    }

    #[test]
    fn multi_part_matches_concatenation() {
        let h = KeyedHasher::from_seed("orders-1");
        let combined = h.hash64(&[b"abc", b"def"]);
        let concatenated = h.hash64(&[b"abcdef"]);
        assert_eq!(combined, concatenated);
    }
}
