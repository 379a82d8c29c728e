// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message block / segment (C2, §4.2): one `.blk` data file, one `.idx`
//! index file, a write-through cache, a deletion map, and a cache
//! expiration timer.

use crate::cache::Cache;
use crate::error::{Result, StoreError};
use crate::hash::{segment_seed, KeyedHasher};
use crate::index::SegmentIndex;
use crate::record::{self, ERASED_BIT, FIXED_HEADER_LEN, HBIT};
use crate::timer::{Timer, TimerAction};
use crate::types::SeqTime;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How long a dropped cache keeps its slot index (`idx`) before the whole
/// cache is discarded (§4.2 cache expiration).
pub const CACHE_IDX_RETENTION: Duration = Duration::from_secs(5 * 60);

struct BlockState {
    first: SeqTime,
    last_ts: i64,
    msgs: u64,
    bytes: u64,
    dmap: BTreeSet<u64>,
    cache: Option<Cache>,
    lchk: [u8; 8],
    blk_file: Option<File>,
    idx_file: Option<File>,
    last_write: Instant,
    last_read: Instant,
    last_remove: Instant,
    last_idx_write_size: u64,
    closed: bool,
}

/// One segment: `msgs/<index>.blk` + `msgs/<index>.idx`.
pub struct MsgBlock {
    pub index: u32,
    blk_path: PathBuf,
    idx_path: PathBuf,
    hasher: KeyedHasher,
    cache_expire: Duration,
    last_seq: AtomicU64,
    weak_self: Weak<MsgBlock>,
    state: Mutex<BlockState>,
    cache_timer: Mutex<Option<Timer>>,
    idx_writer_tx: Mutex<Option<crossbeam_channel::Sender<()>>>,
}

enum Lookup {
    Found(record::DecodedRecord),
    Deleted,
    NotFound,
    Reload,
}

struct ScanResult {
    first: SeqTime,
    last: SeqTime,
    msgs: u64,
    bytes: u64,
    dmap: BTreeSet<u64>,
}

impl MsgBlock {
    /// Creates a brand-new, empty segment (roll-over path, §4.3.1).
    pub fn create(
        dir: &Path,
        stream_name: &str,
        index: u32,
        cache_expire: Duration,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let blk_path = dir.join(format!("{index}.blk"));
        let idx_path = dir.join(format!("{index}.idx"));
        let blk_file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&blk_path)?;
        let idx_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&idx_path)?;
        let hasher = KeyedHasher::from_seed(&segment_seed(stream_name, index));

        let block = Arc::new_cyclic(|weak| Self {
            index,
            blk_path,
            idx_path,
            hasher,
            cache_expire,
            last_seq: AtomicU64::new(0),
            weak_self: weak.clone(),
            state: Mutex::new(BlockState {
                first: SeqTime::default(),
                last_ts: 0,
                msgs: 0,
                bytes: 0,
                dmap: BTreeSet::new(),
                cache: None,
                lchk: [0u8; 8],
                blk_file: Some(blk_file),
                idx_file: Some(idx_file),
                last_write: Instant::now(),
                last_read: Instant::now(),
                last_remove: Instant::now(),
                last_idx_write_size: 0,
                closed: false,
            }),
            cache_timer: Mutex::new(None),
            idx_writer_tx: Mutex::new(None),
        });
        block.write_index_file()?;
        Ok(block)
    }

    /// Recovers a segment already on disk (C5, §4.2 Recovery). Trusts the
    /// `.idx` only if its `lchk` matches the actual trailing 8 bytes of
    /// the `.blk`; otherwise rescans the `.blk` from offset 0, keeping
    /// whatever `dmap` the stale idx carried (interior, non-secure
    /// deletions never rewrite the `.blk`, so the scan alone cannot see
    /// them — §9's documented asymmetry).
    pub fn recover(
        dir: &Path,
        stream_name: &str,
        index: u32,
        cache_expire: Duration,
    ) -> Result<Arc<Self>> {
        let blk_path = dir.join(format!("{index}.blk"));
        let idx_path = dir.join(format!("{index}.idx"));
        let hasher = KeyedHasher::from_seed(&segment_seed(stream_name, index));

        let blk_file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&blk_path)?;
        let blk_len = blk_file.metadata()?.len();
        let mut actual_lchk = [0u8; 8];
        if blk_len >= 8 {
            blk_file.read_exact_at(&mut actual_lchk, blk_len - 8)?;
        }

        let idx_on_disk = std::fs::read(&idx_path)
            .ok()
            .and_then(|bytes| SegmentIndex::read(&mut io::Cursor::new(bytes)).ok());

        let trusted = idx_on_disk
            .as_ref()
            .map(|idx| blk_len == 0 || idx.lchk == actual_lchk)
            .unwrap_or(false);

        let (first, last_ts, last_seq, msgs, bytes, lchk, dmap) = if trusted {
            let idx = idx_on_disk.as_ref().unwrap();
            (
                SeqTime {
                    seq: idx.first_seq,
                    ts: idx.first_ts,
                },
                idx.last_ts,
                idx.last_seq,
                idx.msgs,
                idx.bytes,
                idx.lchk,
                idx.dmap.iter().copied().collect::<BTreeSet<u64>>(),
            )
        } else {
            let preexisting: BTreeSet<u64> = idx_on_disk
                .as_ref()
                .map(|idx| idx.dmap.iter().copied().collect())
                .unwrap_or_default();
            let scan = scan_blk(&blk_path, &preexisting)?;
            (
                scan.first,
                scan.last.ts,
                scan.last.seq,
                scan.msgs,
                scan.bytes,
                actual_lchk,
                scan.dmap,
            )
        };

        let idx_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&idx_path)?;

        let block = Arc::new_cyclic(|weak| Self {
            index,
            blk_path,
            idx_path,
            hasher,
            cache_expire,
            last_seq: AtomicU64::new(last_seq),
            weak_self: weak.clone(),
            state: Mutex::new(BlockState {
                first,
                last_ts,
                msgs,
                bytes,
                dmap,
                cache: None,
                lchk,
                blk_file: Some(blk_file),
                idx_file: Some(idx_file),
                last_write: Instant::now(),
                last_read: Instant::now(),
                last_remove: Instant::now(),
                last_idx_write_size: 0,
                closed: false,
            }),
            cache_timer: Mutex::new(None),
            idx_writer_tx: Mutex::new(None),
        });
        block.write_index_file()?;
        Ok(block)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    pub fn first(&self) -> SeqTime {
        self.state.lock().first
    }

    pub fn last(&self) -> SeqTime {
        let state = self.state.lock();
        SeqTime {
            seq: self.last_seq(),
            ts: state.last_ts,
        }
    }

    pub fn msgs(&self) -> u64 {
        self.state.lock().msgs
    }

    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().msgs == 0
    }

    pub fn blk_path(&self) -> &Path {
        &self.blk_path
    }

    pub fn idx_path(&self) -> &Path {
        &self.idx_path
    }

    /// Appends one record, returning its on-disk length. Caller holds the
    /// stream lock; this additionally serializes on the segment lock.
    pub fn write_record(
        &self,
        seq: u64,
        ts: i64,
        subject: &[u8],
        headers: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<u32> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::StoreClosed);
        }
        if state.cache.is_none() {
            state.cache = Some(Cache::new());
        }
        self.ensure_cache_timer(&mut state);

        let file_offset = {
            let cache = state.cache.as_ref().unwrap();
            cache.off + cache.buf.len() as u64
        };
        let rl = {
            let cache = state.cache.as_mut().unwrap();
            record::encode(&mut cache.buf, &self.hasher, seq, ts, subject, headers, payload)?
                as u32
        };
        let digest = {
            let cache = state.cache.as_ref().unwrap();
            let end = cache.buf.len();
            let mut d = [0u8; 8];
            d.copy_from_slice(&cache.buf[end - 8..end]);
            d
        };
        state.lchk = digest;
        {
            let cache = state.cache.as_mut().unwrap();
            cache.record_append(file_offset, rl, seq);
        }

        if state.first.seq == 0 {
            state.first = SeqTime { seq, ts };
        }
        self.last_seq.store(seq, Ordering::Release);
        state.last_ts = ts;
        state.msgs += 1;
        state.bytes += rl as u64;
        state.last_write = Instant::now();

        Ok(rl)
    }

    /// Reserves `seq` without storing a payload (§4.2 `skip`).
    pub fn write_skip(&self, seq: u64, ts: i64) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::StoreClosed);
        }
        let segment_empty = state.msgs == 0;
        if !segment_empty {
            if state.cache.is_none() {
                state.cache = Some(Cache::new());
            }
            self.ensure_cache_timer(&mut state);
            let file_offset = {
                let cache = state.cache.as_ref().unwrap();
                cache.off + cache.buf.len() as u64
            };
            let rl = {
                let cache = state.cache.as_mut().unwrap();
                record::encode_tombstone(&mut cache.buf, &self.hasher, seq) as u32
            };
            let digest = {
                let cache = state.cache.as_ref().unwrap();
                let end = cache.buf.len();
                let mut d = [0u8; 8];
                d.copy_from_slice(&cache.buf[end - 8..end]);
                d
            };
            state.lchk = digest;
            {
                let cache = state.cache.as_mut().unwrap();
                cache.record_append(file_offset, rl, seq);
            }
            state.dmap.insert(seq);
            state.last_write = Instant::now();
        } else {
            state.first = SeqTime { seq: seq + 1, ts };
        }
        self.last_seq.store(seq, Ordering::Release);
        state.last_ts = ts;
        Ok(())
    }

    /// Reads record `seq`, loading the full `.blk` on a cache miss and
    /// retrying once (§4.2 `fetch`).
    pub fn fetch(&self, seq: u64) -> Result<record::DecodedRecord> {
        let mut reloaded = false;
        loop {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::StoreClosed);
            }
            match self.cache_lookup_locked(&mut state, seq)? {
                Lookup::Found(rec) => return Ok(rec),
                Lookup::Deleted => return Err(StoreError::DeletedMsg),
                Lookup::NotFound => return Err(StoreError::MsgNotFound),
                Lookup::Reload => {
                    drop(state);
                    if reloaded {
                        return Err(StoreError::MsgNotFound);
                    }
                    reloaded = true;
                    self.load_msgs()?;
                }
            }
        }
    }

    fn cache_lookup_locked(&self, state: &mut BlockState, seq: u64) -> Result<Lookup> {
        if state.cache.is_none() {
            return Ok(Lookup::Reload);
        }
        if seq < state.first.seq {
            return Ok(Lookup::NotFound);
        }
        if state.dmap.contains(&seq) {
            return Ok(Lookup::Deleted);
        }

        let (fseq, idx_len) = {
            let cache = state.cache.as_ref().unwrap();
            (cache.fseq, cache.idx.len())
        };
        if fseq == 0 || seq < fseq || seq >= fseq + idx_len as u64 {
            return Ok(Lookup::NotFound);
        }
        let slot = (seq - fseq) as usize;

        let (bi, rl, off, checked) = {
            let cache = state.cache.as_ref().unwrap();
            (
                cache.slot_offset(slot),
                cache.slot_len(slot) as usize,
                cache.off,
                cache.slot_checked(slot),
            )
        };
        if bi < off {
            return Ok(Lookup::Reload);
        }
        let start = (bi - off) as usize;
        let end = start + rl;
        let buf_len = state.cache.as_ref().unwrap().buf.len();
        if end > buf_len {
            return Ok(Lookup::Reload);
        }

        let decoded = {
            let cache = state.cache.as_ref().unwrap();
            let slice = &cache.buf[start..end];
            let hasher = if checked { None } else { Some(&self.hasher) };
            record::decode(slice, hasher)?
        };
        if !checked {
            state.cache.as_mut().unwrap().mark_checked(slot);
        }
        state.last_read = Instant::now();
        Ok(Lookup::Found(decoded.0))
    }

    /// Reads the whole `.blk` into the cache and rebuilds the slot index.
    /// Idempotent: concurrent callers converge on the same resident state.
    pub fn load_msgs(&self) -> Result<()> {
        self.flush_pending()?;

        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::StoreClosed);
        }
        let data = {
            let file = state.blk_file.as_ref().ok_or(StoreError::StoreClosed)?;
            let len = file.metadata()?.len();
            let mut buf = vec![0u8; len as usize];
            if len > 0 {
                file.read_exact_at(&mut buf, 0)?;
            }
            buf
        };

        {
            let cache = state.cache.get_or_insert_with(Cache::new);
            cache.buf = data;
            cache.off = 0;
            cache.wp = cache.buf.len();
            cache.idx.clear();
            cache.fseq = 0;
            cache.lrl = 0;
        }
        self.index_cache_buf(&mut state);
        Ok(())
    }

    fn index_cache_buf(&self, state: &mut BlockState) {
        let buf_len = state.cache.as_ref().unwrap().buf.len();
        let mut offset = 0usize;
        let mut last_rl = 0u32;
        loop {
            if offset + FIXED_HEADER_LEN > buf_len {
                break;
            }
            let (total_len, raw_seq) = {
                let cache = state.cache.as_ref().unwrap();
                let total_len = LittleEndian::read_u32(&cache.buf[offset..offset + 4]);
                let raw_seq = LittleEndian::read_u64(&cache.buf[offset + 4..offset + 12]);
                (total_len, raw_seq)
            };
            let rl = (total_len & !HBIT) as usize;
            if rl == 0 || offset + rl > buf_len {
                break;
            }
            let cache = state.cache.as_mut().unwrap();
            cache.idx.push(offset as u32);
            if cache.fseq == 0 {
                cache.fseq = raw_seq & !ERASED_BIT;
            }
            last_rl = rl as u32;
            offset += rl;
        }
        state.cache.as_mut().unwrap().lrl = last_rl;
    }

    /// Writes pending cache bytes to the `.blk` file, handling short
    /// writes; invalidates the idx on I/O failure (§4.3.2).
    pub fn flush_pending(&self) -> Result<()> {
        let mut state = self.state.lock();
        let (pending, offset) = match state.cache.as_mut() {
            None => return Ok(()),
            Some(c) => {
                if c.pending_len() == 0 {
                    return Ok(());
                }
                c.flush = true;
                (c.pending().to_vec(), c.off + c.wp as u64)
            }
        };

        let write_result = (|| -> Result<()> {
            let file = state.blk_file.as_ref().ok_or(StoreError::StoreClosed)?;
            let mut written = 0usize;
            while written < pending.len() {
                let n = file.write_at(&pending[written..], offset + written as u64)?;
                if n == 0 {
                    return Err(StoreError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "short write to segment file",
                    )));
                }
                written += n;
            }
            Ok(())
        })();

        match write_result {
            Ok(()) => {
                let recently_read =
                    Instant::now().duration_since(state.last_read) <= self.cache_expire;
                if let Some(c) = state.cache.as_mut() {
                    c.advance_after_flush(pending.len(), recently_read);
                    c.flush = false;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(c) = state.cache.as_mut() {
                    c.flush = false;
                }
                let _ = std::fs::remove_file(&self.idx_path);
                state.idx_file = None;
                Err(e)
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        let state = self.state.lock();
        state.cache.as_ref().map(|c| c.pending_len()).unwrap_or(0)
    }

    /// Removes `seq`; `secure` overwrites the record bytes in place with
    /// random data and a fresh tombstone hash (§4.2 `remove`).
    pub fn remove(&self, seq: u64, secure: bool) -> Result<bool> {
        loop {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::StoreClosed);
            }
            if state.cache.is_none() {
                drop(state);
                self.load_msgs()?;
                continue;
            }
            if seq < state.first.seq || seq > self.last_seq() {
                return Ok(false);
            }
            if state.dmap.contains(&seq) {
                return Ok(false);
            }

            let (fseq, idx_len) = {
                let c = state.cache.as_ref().unwrap();
                (c.fseq, c.idx.len())
            };
            if fseq == 0 || seq < fseq || seq >= fseq + idx_len as u64 {
                drop(state);
                self.load_msgs()?;
                continue;
            }
            let slot = (seq - fseq) as usize;
            let (bi, rl) = {
                let c = state.cache.as_ref().unwrap();
                (c.slot_offset(slot), c.slot_len(slot))
            };

            state.msgs = state.msgs.saturating_sub(1);
            state.bytes = state.bytes.saturating_sub(rl as u64);
            state.last_remove = Instant::now();

            if secure {
                self.secure_overwrite_locked(&mut state, bi, rl, seq)?;
            }

            if seq == state.first.seq {
                self.advance_first_locked(&mut state);
            } else {
                state.dmap.insert(seq);
            }
            drop(state);
            self.signal_idx_dirty();
            return Ok(true);
        }
    }

    fn secure_overwrite_locked(
        &self,
        state: &mut BlockState,
        bi: u64,
        rl: u32,
        seq: u64,
    ) -> Result<()> {
        let mut rng = rand::thread_rng();
        let bytes = record::encode_erased(rl as usize, &self.hasher, seq, &mut rng);

        let on_disk = match &state.cache {
            Some(cache) => bi < cache.off + cache.wp as u64,
            None => true,
        };
        if on_disk {
            if let Some(file) = state.blk_file.as_ref() {
                file.write_all_at(&bytes, bi)?;
            }
        }
        if let Some(cache) = state.cache.as_mut() {
            if bi >= cache.off {
                let start = (bi - cache.off) as usize;
                if start + bytes.len() <= cache.buf.len() {
                    cache.buf[start..start + bytes.len()].copy_from_slice(&bytes);
                }
            }
        }
        if self.last_seq() == seq {
            let mut lchk = [0u8; 8];
            lchk.copy_from_slice(&bytes[bytes.len() - 8..]);
            state.lchk = lchk;
        }
        Ok(())
    }

    /// FIFO removal: walk past contiguous `dmap` entries, dropping them
    /// from the map, to find the new first live sequence.
    fn advance_first_locked(&self, state: &mut BlockState) {
        let mut next_seq = state.first.seq + 1;
        while state.dmap.remove(&next_seq) {
            next_seq += 1;
        }
        let last_seq = self.last_seq();
        if next_seq > last_seq {
            state.first = SeqTime {
                seq: last_seq + 1,
                ts: state.last_ts,
            };
            return;
        }
        // Falls back to the stale ts if the next record isn't resident;
        // a subsequent load_msgs repopulates the slot table exactly.
        let ts = self
            .record_ts_locked(state, next_seq)
            .unwrap_or(state.first.ts);
        state.first = SeqTime { seq: next_seq, ts };
    }

    fn record_ts_locked(&self, state: &BlockState, seq: u64) -> Option<i64> {
        let cache = state.cache.as_ref()?;
        if cache.fseq == 0 || seq < cache.fseq || seq >= cache.fseq + cache.idx.len() as u64 {
            return None;
        }
        let slot = (seq - cache.fseq) as usize;
        let bi = cache.slot_offset(slot);
        if bi < cache.off {
            return None;
        }
        let start = (bi - cache.off) as usize;
        if start + 20 > cache.buf.len() {
            return None;
        }
        Some(LittleEndian::read_i64(&cache.buf[start + 12..start + 20]))
    }

    fn signal_idx_dirty(&self) {
        let mut guard = self.idx_writer_tx.lock();
        if guard.is_none() {
            let (tx, rx) = crossbeam_channel::bounded::<()>(1);
            let weak = self.weak_self.clone();
            let spawned = std::thread::Builder::new()
                .name("hdds-filestore-idxwriter".into())
                .spawn(move || {
                    while rx.recv().is_ok() {
                        if let Some(strong) = weak.upgrade() {
                            let _ = strong.write_index_file();
                        } else {
                            break;
                        }
                    }
                });
            if spawned.is_ok() {
                *guard = Some(tx);
            }
        }
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(());
        }
    }

    pub fn write_index_file(&self) -> Result<()> {
        let mut state = self.state.lock();
        let segidx = SegmentIndex {
            msgs: state.msgs,
            bytes: state.bytes,
            first_seq: state.first.seq,
            first_ts: state.first.ts,
            last_seq: self.last_seq(),
            last_ts: state.last_ts,
            lchk: state.lchk,
            dmap: state.dmap.iter().copied().collect(),
        };
        let mut buf = Vec::new();
        segidx.write(&mut buf)?;
        if let Some(file) = state.idx_file.as_ref() {
            file.write_all_at(&buf, 0)?;
        }
        state.last_idx_write_size = buf.len() as u64;
        Ok(())
    }

    /// `fsync`s the data fd and `fsync`s + truncates the idx fd to its
    /// last-written size (§4.3.3 sync timer).
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        if let Some(f) = state.blk_file.as_ref() {
            f.sync_all()?;
        }
        if let Some(f) = state.idx_file.as_ref() {
            f.sync_all()?;
            f.set_len(state.last_idx_write_size)?;
        }
        Ok(())
    }

    fn ensure_cache_timer(&self, _state: &mut BlockState) {
        let mut timer_guard = self.cache_timer.lock();
        if timer_guard.is_some() {
            return;
        }
        let weak = self.weak_self.clone();
        let expire = self.cache_expire;
        let timer = Timer::start(expire, move || match weak.upgrade() {
            Some(strong) => strong.on_cache_expire(),
            None => TimerAction::Stop,
        });
        *timer_guard = Some(timer);
    }

    fn on_cache_expire(&self) -> TimerAction {
        let mut state = self.state.lock();
        if state.closed {
            return TimerAction::Stop;
        }
        let now = Instant::now();
        let last_activity = state.last_read.max(state.last_write);
        let idle = now.duration_since(last_activity);
        if idle < self.cache_expire {
            return TimerAction::Reschedule(self.cache_expire - idle);
        }

        let flush_in_progress = state.cache.as_ref().map(|c| c.flush).unwrap_or(false);
        let pending = state.cache.as_ref().map(|c| c.pending_len()).unwrap_or(0);
        if flush_in_progress || pending > 0 {
            return TimerAction::Reschedule(self.cache_expire);
        }

        if let Some(cache) = state.cache.as_mut() {
            cache.drop_buf();
        }

        let since_remove = now.duration_since(state.last_remove);
        if since_remove <= CACHE_IDX_RETENTION {
            TimerAction::Reschedule(CACHE_IDX_RETENTION - since_remove)
        } else {
            state.cache = None;
            TimerAction::Stop
        }
    }

    /// Flushes, fsyncs, and marks the segment closed. Background timers
    /// and the idx-writer thread are torn down by dropping their handles.
    /// Rewrites the idx synchronously first, so a clean shutdown never
    /// depends on the idx-writer thread's last kick having landed.
    pub fn close(&self) -> Result<()> {
        let flush_result = self.flush_pending();
        self.write_index_file()?;
        let mut state = self.state.lock();
        if let Some(f) = state.blk_file.take() {
            let _ = f.sync_all();
        }
        if let Some(f) = state.idx_file.as_ref() {
            let _ = f.sync_all();
        }
        state.idx_file = None;
        state.closed = true;
        drop(state);
        *self.cache_timer.lock() = None;
        *self.idx_writer_tx.lock() = None;
        flush_result
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn delete_files(&self) {
        let _ = std::fs::remove_file(&self.blk_path);
        let _ = std::fs::remove_file(&self.idx_path);
    }

    /// Walks the whole `.blk`, recomputing each live record's hash; returns
    /// the sequence numbers that fail verification (§4.4 `check_msgs`).
    pub fn check_integrity(&self) -> Result<Vec<u64>> {
        self.flush_pending()?;
        let data = std::fs::read(&self.blk_path)?;
        let mut bad = Vec::new();
        let mut offset = 0usize;
        while offset + FIXED_HEADER_LEN <= data.len() {
            let total_len = LittleEndian::read_u32(&data[offset..offset + 4]);
            let rl = (total_len & !HBIT) as usize;
            if rl == 0 || offset + rl > data.len() {
                break;
            }
            let raw_seq = LittleEndian::read_u64(&data[offset + 4..offset + 12]);
            let seq = raw_seq & !ERASED_BIT;
            if raw_seq & ERASED_BIT == 0 && seq != 0 {
                if record::decode(&data[offset..offset + rl], Some(&self.hasher)).is_err() {
                    bad.push(seq);
                }
            }
            offset += rl;
        }
        Ok(bad)
    }
}

/// Best-effort flush/fsync if the owning stream never reached this segment
/// through `close` (e.g. an un-rolled-over tail dropped without `Stop`),
/// mirroring the teacher crates' pattern of not leaking background threads
/// or losing buffered writes on unwind (§15).
impl Drop for MsgBlock {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

/// Walks a `.blk` file from offset 0, recomputing aggregates. `rl == 0` or
/// a short trailing record stops the scan at that offset (§3.1, §4.2).
fn scan_blk(path: &Path, preexisting_dmap: &BTreeSet<u64>) -> Result<ScanResult> {
    let data = std::fs::read(path)?;
    let mut dmap = preexisting_dmap.clone();
    let mut msgs = 0u64;
    let mut bytes = 0u64;
    let mut first: Option<SeqTime> = None;
    let mut last = SeqTime::default();
    let mut offset = 0usize;

    while offset + FIXED_HEADER_LEN <= data.len() {
        let total_len = LittleEndian::read_u32(&data[offset..offset + 4]);
        let rl = (total_len & !HBIT) as usize;
        if rl == 0 || offset + rl > data.len() {
            break;
        }
        let raw_seq = LittleEndian::read_u64(&data[offset + 4..offset + 12]);
        let erased = raw_seq & ERASED_BIT != 0;
        let seq = raw_seq & !ERASED_BIT;
        let ts = LittleEndian::read_i64(&data[offset + 12..offset + 20]);

        if seq == 0 || erased {
            if seq != 0 {
                dmap.insert(seq);
            }
        } else if !dmap.contains(&seq) {
            msgs += 1;
            bytes += rl as u64;
            if first.is_none() {
                first = Some(SeqTime { seq, ts });
            }
            last = SeqTime { seq, ts };
        }
        offset += rl;
    }

    let first = first.unwrap_or(SeqTime {
        seq: last.seq + 1,
        ts: 0,
    });
    Ok(ScanResult {
        first,
        last,
        msgs,
        bytes,
        dmap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_block(dir: &Path) -> Arc<MsgBlock> {
        MsgBlock::create(dir, "orders", 1, Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn write_then_fetch_round_trip() {
        let dir = tempdir().unwrap();
        let block = new_block(dir.path());
        block.write_record(1, 100, b"foo", None, b"hello").unwrap();
        let rec = block.fetch(1).unwrap();
        assert_eq!(rec.subject, b"foo");
        assert_eq!(rec.payload, b"hello");
        assert_eq!(block.msgs(), 1);
    }

    #[test]
    fn fetch_after_reload_from_disk() {
        let dir = tempdir().unwrap();
        let block = new_block(dir.path());
        for i in 1..=5u64 {
            block
                .write_record(i, i as i64, b"s", None, format!("m{i}").as_bytes())
                .unwrap();
        }
        block.flush_pending().unwrap();
        // Force a fresh read from disk, bypassing the live cache.
        block.load_msgs().unwrap();
        let rec = block.fetch(3).unwrap();
        assert_eq!(rec.payload, b"m3");
    }

    #[test]
    fn interior_delete_then_reload_stays_deleted() {
        let dir = tempdir().unwrap();
        let block = new_block(dir.path());
        for i in 1..=5u64 {
            block
                .write_record(i, 0, b"s", None, format!("m{i}").as_bytes())
                .unwrap();
        }
        block.flush_pending().unwrap();
        assert!(block.remove(3, false).unwrap());
        assert!(matches!(block.fetch(3), Err(StoreError::DeletedMsg)));
        assert_eq!(block.msgs(), 4);

        // Recover from disk: a non-secure interior delete never rewrites
        // the .blk, so the idx's dmap is what keeps this hidden.
        block.write_index_file().unwrap();
        drop(block);
        let recovered = MsgBlock::recover(dir.path(), "orders", 1, Duration::from_millis(50)).unwrap();
        assert_eq!(recovered.msgs(), 4);
        assert!(matches!(recovered.fetch(3), Err(StoreError::DeletedMsg)));
    }

    #[test]
    fn fifo_delete_advances_first() {
        let dir = tempdir().unwrap();
        let block = new_block(dir.path());
        for i in 1..=3u64 {
            block.write_record(i, 0, b"s", None, b"x").unwrap();
        }
        assert!(block.remove(1, false).unwrap());
        assert_eq!(block.first().seq, 2);
        assert!(matches!(block.fetch(1), Err(StoreError::MsgNotFound)));
    }

    #[test]
    fn secure_erase_overwrites_bytes_and_keeps_framing() {
        let dir = tempdir().unwrap();
        let block = new_block(dir.path());
        block.write_record(1, 0, b"s", None, b"secret-payload").unwrap();
        block.flush_pending().unwrap();

        assert!(block.remove(1, true).unwrap());

        let raw = std::fs::read(block.blk_path()).unwrap();
        assert_ne!(&raw[22..22 + 14], b"secret-payload");

        let (rec, rl) = record::decode(&raw, None).unwrap();
        assert!(rec.erased);
        assert_eq!(rl, raw.len());
    }

    #[test]
    fn recovery_trusts_matching_idx() {
        let dir = tempdir().unwrap();
        let block = new_block(dir.path());
        block.write_record(1, 10, b"s", None, b"hi").unwrap();
        block.flush_pending().unwrap();
        block.write_index_file().unwrap();
        drop(block);

        let recovered = MsgBlock::recover(dir.path(), "orders", 1, Duration::from_millis(50)).unwrap();
        assert_eq!(recovered.msgs(), 1);
        assert_eq!(recovered.last_seq(), 1);
    }

    #[test]
    fn check_integrity_flags_corrupted_record() {
        let dir = tempdir().unwrap();
        let block = new_block(dir.path());
        block.write_record(1, 0, b"x", None, b"y").unwrap();
        block.flush_pending().unwrap();
        assert!(block.check_integrity().unwrap().is_empty());

        // Flip a byte inside the payload region of the .blk on disk.
        let path = block.blk_path().to_path_buf();
        let mut raw = std::fs::read(&path).unwrap();
        let payload_offset = FIXED_HEADER_LEN + 1; // header + "x"
        raw[payload_offset] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        // Force re-read from disk rather than the (unmodified) live cache.
        let recovered = MsgBlock::recover(dir.path(), "orders", 1, Duration::from_millis(50)).unwrap();
        assert_eq!(recovered.check_integrity().unwrap(), vec![1]);
    }

    #[test]
    fn recovery_rescans_when_idx_stale() {
        let dir = tempdir().unwrap();
        let block = new_block(dir.path());
        block.write_record(1, 10, b"s", None, b"hi").unwrap();
        block.write_record(2, 20, b"s", None, b"there").unwrap();
        block.flush_pending().unwrap();
        // idx never written: simulates a crash before the sync timer ran.
        drop(block);

        let recovered = MsgBlock::recover(dir.path(), "orders", 1, Duration::from_millis(50)).unwrap();
        assert_eq!(recovered.msgs(), 2);
        assert_eq!(recovered.last_seq(), 2);
        assert_eq!(recovered.fetch(2).unwrap().payload, b"there");
    }
}
