// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `.idx` file encode/decode (§4.2).
//!
//! ```text
//!  magic:u8=22   version:u8=1
//!  msgs:uvarint   bytes:uvarint
//!  first.seq:uvarint   first.ts:varint
//!  last.seq:uvarint    last.ts:varint
//!  dmap_len:uvarint
//!  lchk:bytes[8]
//!  dmap: uvarint[dmap_len]   // each value = (seq - first.seq)
//! ```

use crate::error::{Result, StoreError};
use integer_encoding::{VarIntReader, VarIntWriter};
use std::io::{Read, Write};

pub const MAGIC: u8 = 22;
pub const VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentIndex {
    pub msgs: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub first_ts: i64,
    pub last_seq: u64,
    pub last_ts: i64,
    pub lchk: [u8; 8],
    /// Interior deleted sequences, ascending.
    pub dmap: Vec<u64>,
}

impl SegmentIndex {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&[MAGIC, VERSION])?;
        w.write_varint(self.msgs)?;
        w.write_varint(self.bytes)?;
        w.write_varint(self.first_seq)?;
        w.write_varint(self.first_ts)?;
        w.write_varint(self.last_seq)?;
        w.write_varint(self.last_ts)?;

        // Purge dmap entries that no longer fall after first_seq.
        let live_dmap: Vec<u64> = self
            .dmap
            .iter()
            .copied()
            .filter(|&s| s > self.first_seq)
            .collect();

        w.write_varint(live_dmap.len() as u64)?;
        w.write_all(&self.lchk)?;
        for seq in &live_dmap {
            w.write_varint(seq - self.first_seq)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut header = [0u8; 2];
        r.read_exact(&mut header)?;
        if header[0] != MAGIC {
            return Err(StoreError::BadMsg(format!(
                "bad idx magic byte {}",
                header[0]
            )));
        }
        if header[1] != VERSION {
            return Err(StoreError::BadMsg(format!(
                "unsupported idx version {}",
                header[1]
            )));
        }

        let msgs: u64 = r.read_varint()?;
        let bytes: u64 = r.read_varint()?;
        let first_seq: u64 = r.read_varint()?;
        let first_ts: i64 = r.read_varint()?;
        let last_seq: u64 = r.read_varint()?;
        let last_ts: i64 = r.read_varint()?;
        let dmap_len: u64 = r.read_varint()?;

        let mut lchk = [0u8; 8];
        r.read_exact(&mut lchk)?;

        let mut dmap = Vec::with_capacity(dmap_len as usize);
        for _ in 0..dmap_len {
            let delta: u64 = r.read_varint()?;
            dmap.push(first_seq + delta);
        }

        Ok(Self {
            msgs,
            bytes,
            first_seq,
            first_ts,
            last_seq,
            last_ts,
            lchk,
            dmap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> SegmentIndex {
        SegmentIndex {
            msgs: 9,
            bytes: 512,
            first_seq: 2,
            first_ts: 1_000,
            last_seq: 10,
            last_ts: 9_000,
            lchk: [1, 2, 3, 4, 5, 6, 7, 8],
            dmap: vec![5, 6],
        }
    }

    #[test]
    fn round_trip() {
        let idx = sample();
        let mut buf = Vec::new();
        idx.write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let read_back = SegmentIndex::read(&mut cursor).unwrap();
        assert_eq!(idx, read_back);
    }

    #[test]
    fn stale_dmap_entries_purged_on_write() {
        let mut idx = sample();
        idx.dmap = vec![1, 2, 5, 6]; // 1 and 2 are <= first_seq(2)
        let mut buf = Vec::new();
        idx.write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let read_back = SegmentIndex::read(&mut cursor).unwrap();
        assert_eq!(read_back.dmap, vec![5, 6]);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = Vec::new();
        buf.push(0);
        buf.push(VERSION);
        let mut cursor = Cursor::new(buf);
        assert!(SegmentIndex::read(&mut cursor).is_err());
    }
}
