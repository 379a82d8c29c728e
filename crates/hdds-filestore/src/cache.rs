// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-segment write-through cache (§3.3).
//!
//! `buf` holds a contiguous *suffix* of the segment's `.blk` file, starting
//! at file offset `off`. `idx[k]` records the absolute file offset of the
//! `(fseq+k)`-th record; its high bit doubles as the "checksum already
//! verified" flag so a hot record is only hashed once.

use crate::record::HBIT;

/// Same bit position as [`crate::record::HBIT`], reused on idx slots to
/// mean "this record's hash has already been verified since load".
pub const HASH_CHECKED_BIT: u32 = HBIT;

/// Reuse allocations up to this size across a shrink-after-flush (§4.3.2).
pub const REUSE_CAP_LIMIT: usize = 2 * 1024 * 1024;

#[derive(Default)]
pub struct Cache {
    /// Suffix of the segment's `.blk` contents currently resident.
    pub buf: Vec<u8>,
    /// Absolute file offset of `buf[0]`.
    pub off: u64,
    /// Bytes `buf[wp..]` have not yet been flushed to disk.
    pub wp: usize,
    /// `idx[k]` = absolute file offset of record `fseq + k`, OR'd with
    /// [`HASH_CHECKED_BIT`] once that record's hash has been verified.
    pub idx: Vec<u32>,
    /// Record length of the last appended record (sizes the final slot,
    /// which has no following slot to diff against).
    pub lrl: u32,
    /// Sequence number represented by `idx[0]`. Zero means "unset".
    pub fseq: u64,
    /// A flush is currently copying out the pending tail; writers may still
    /// append beyond the range the flusher captured, but no second flush
    /// may start concurrently.
    pub flush: bool,
    /// Last local-write timestamp (monotonic-ish, seconds); used by
    /// expiration to decide whether pending bytes are too fresh to drop.
    pub last_write_secs: u64,
    /// Last local-read timestamp; cache expiration extends the buffer's
    /// life while reads keep occurring.
    pub last_read_secs: u64,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly appended record: grows `buf`, assigns its slot.
    pub fn record_append(&mut self, file_offset: u64, rl: u32, seq: u64) {
        self.idx.push((file_offset as u32) | HASH_CHECKED_BIT);
        self.lrl = rl;
        if self.fseq == 0 {
            self.fseq = seq;
        }
    }

    /// Number of bytes appended but not yet flushed.
    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.wp
    }

    /// Slice of bytes pending flush.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.wp..]
    }

    /// True once `idx` is non-empty (the cache has ever held a record).
    pub fn has_records(&self) -> bool {
        !self.idx.is_empty()
    }

    /// Resolves slot `k`'s raw file offset (mask off the checked bit).
    pub fn slot_offset(&self, k: usize) -> u64 {
        (self.idx[k] & !HASH_CHECKED_BIT) as u64
    }

    /// True if slot `k` has already had its checksum validated.
    pub fn slot_checked(&self, k: usize) -> bool {
        self.idx[k] & HASH_CHECKED_BIT != 0
    }

    /// Marks slot `k` as checksum-verified.
    pub fn mark_checked(&mut self, k: usize) {
        self.idx[k] |= HASH_CHECKED_BIT;
    }

    /// Record length of slot `k`, derived either from the next slot's
    /// offset or, for the last slot, from `lrl`.
    pub fn slot_len(&self, k: usize) -> u32 {
        if k + 1 < self.idx.len() {
            let next = self.idx[k + 1] & !HASH_CHECKED_BIT;
            next - (self.idx[k] & !HASH_CHECKED_BIT)
        } else {
            self.lrl
        }
    }

    /// Drops the resident buffer but keeps the slot index (idle expiration
    /// first stage, §4.2 cache expiration).
    pub fn drop_buf(&mut self) {
        self.buf = Vec::new();
        self.wp = 0;
    }

    /// Drops everything: buffer and slot index (full expiration).
    pub fn clear(&mut self) {
        *self = Cache::new();
    }

    /// After a successful flush of `written` bytes: either keep the data
    /// resident (a read happened recently) by sliding `wp` forward, or drop
    /// the flushed prefix and advance `off`, reusing the allocation if it
    /// is small enough to be worth keeping.
    pub fn advance_after_flush(&mut self, written: usize, keep_resident: bool) {
        if keep_resident {
            self.wp += written;
            return;
        }
        self.off += written as u64;
        if self.buf.capacity() <= REUSE_CAP_LIMIT {
            self.buf.drain(0..written);
        } else {
            self.buf = self.buf[written..].to_vec();
        }
        self.wp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_append_sets_fseq_once() {
        let mut c = Cache::new();
        c.record_append(0, 30, 5);
        c.record_append(30, 28, 6);
        assert_eq!(c.fseq, 5);
        assert_eq!(c.idx.len(), 2);
    }

    #[test]
    fn slot_len_uses_next_offset_or_lrl() {
        let mut c = Cache::new();
        c.record_append(0, 30, 1);
        c.record_append(30, 22, 2);
        assert_eq!(c.slot_len(0), 30);
        assert_eq!(c.slot_len(1), 22);
    }

    #[test]
    fn checked_bit_round_trips() {
        let mut c = Cache::new();
        c.record_append(100, 10, 1);
        assert!(c.slot_checked(0));
        c.idx[0] &= !HASH_CHECKED_BIT;
        assert!(!c.slot_checked(0));
        c.mark_checked(0);
        assert!(c.slot_checked(0));
        assert_eq!(c.slot_offset(0), 100);
    }

    #[test]
    fn advance_after_flush_keeps_resident_on_recent_read() {
        let mut c = Cache::new();
        c.buf = vec![1, 2, 3, 4, 5];
        c.wp = 0;
        c.advance_after_flush(5, true);
        assert_eq!(c.wp, 5);
        assert_eq!(c.buf.len(), 5);
        assert_eq!(c.off, 0);
    }

    #[test]
    fn advance_after_flush_drops_prefix_when_idle() {
        let mut c = Cache::new();
        c.buf = vec![1, 2, 3, 4, 5];
        c.advance_after_flush(3, false);
        assert_eq!(c.buf, vec![4, 5]);
        assert_eq!(c.off, 3);
        assert_eq!(c.wp, 0);
    }
}
