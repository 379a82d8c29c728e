// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Template storage: a JSON document plus checksum under
//! `templates/<name>/…`. Deliberately thin — lifecycle of templates lives
//! above the store (§1).

use crate::error::Result;
use crate::hash::KeyedHasher;
use crate::meta::{read_meta, write_meta};

use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Persists `value` as `templates/<name>/meta.inf` + `meta.sum`.
pub fn store_template<T: Serialize>(
    templates_dir: &Path,
    name: &str,
    hasher: &KeyedHasher,
    value: &T,
) -> Result<()> {
    write_meta(&templates_dir.join(name), hasher, value)
}

/// Reads back a template written by [`store_template`], if present.
pub fn load_template<T: DeserializeOwned>(templates_dir: &Path, name: &str) -> Option<T> {
    read_meta(&templates_dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct SampleTemplate {
        max_msgs: u64,
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let hasher = KeyedHasher::from_seed("tmpl");
        let value = SampleTemplate { max_msgs: 10 };
        store_template(dir.path(), "orders-tmpl", &hasher, &value).unwrap();

        let read_back: SampleTemplate = load_template(dir.path(), "orders-tmpl").unwrap();
        assert_eq!(read_back, value);
    }
}
