// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `meta.inf` / `meta.sum` pairs (§4.6): pretty JSON config plus a hex
//! HighwayHash-64 checksum of the JSON bytes, keyed by the owner's seed.

use crate::error::{Result, StoreError};
use crate::hash::KeyedHasher;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Writes `<dir>/meta.inf` (pretty JSON of `value`) and `<dir>/meta.sum`
/// (hex-encoded keyed hash of the JSON bytes).
pub fn write_meta<T: Serialize>(dir: &Path, hasher: &KeyedHasher, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::Configuration(format!("encoding meta.inf: {e}")))?;
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("meta.inf"), &json)?;
    let digest = hasher.hash64(&[&json]);
    std::fs::write(dir.join("meta.sum"), hex::encode(digest.to_le_bytes()))?;
    Ok(())
}

/// Reads and parses `<dir>/meta.inf`, if present. Does not itself verify
/// `meta.sum`; callers that care about tamper-detection call
/// [`verify_meta`] separately.
pub fn read_meta<T: DeserializeOwned>(dir: &Path) -> Option<T> {
    let bytes = std::fs::read(dir.join("meta.inf")).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Recomputes the hash over the on-disk `meta.inf` and compares it with the
/// stored `meta.sum`.
pub fn verify_meta(dir: &Path, hasher: &KeyedHasher) -> Result<bool> {
    let json = std::fs::read(dir.join("meta.inf"))?;
    let want = std::fs::read_to_string(dir.join("meta.sum"))?;
    let digest = hasher.hash64(&[&json]);
    Ok(want.trim() == hex::encode(digest.to_le_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        name: String,
        n: u64,
    }

    #[test]
    fn write_read_round_trip_and_verifies() {
        let dir = tempdir().unwrap();
        let hasher = KeyedHasher::from_seed("orders");
        let value = Sample {
            name: "orders".into(),
            n: 7,
        };
        write_meta(dir.path(), &hasher, &value).unwrap();

        let read_back: Sample = read_meta(dir.path()).unwrap();
        assert_eq!(read_back, value);
        assert!(verify_meta(dir.path(), &hasher).unwrap());
    }

    #[test]
    fn verify_fails_after_tamper() {
        let dir = tempdir().unwrap();
        let hasher = KeyedHasher::from_seed("orders");
        write_meta(dir.path(), &hasher, &Sample { name: "a".into(), n: 1 }).unwrap();
        std::fs::write(dir.path().join("meta.inf"), b"{\"name\":\"a\",\"n\":999}").unwrap();
        assert!(!verify_meta(dir.path(), &hasher).unwrap());
    }
}
