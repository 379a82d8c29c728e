// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream store (C3, §4.3): the ordered set of segments, aggregate
//! `StreamState`, size-based roll-over, retention enforcement, the age
//! timer, and the coalesced flusher and sync timer that drive them.

use crate::block::MsgBlock;
use crate::config::{DiscardPolicy, FileStoreConfig, StreamConfig};
use crate::consumer::ConsumerStore;
use crate::error::{Result, StoreError};
use crate::hash::{stream_seed, KeyedHasher};
use crate::meta::{read_meta, write_meta};
use crate::record::DecodedRecord;
use crate::timer::{Timer, TimerAction};
use crate::types::{SeqTime, StreamState};

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const COALESCE_MINIMUM: usize = 4 * 1024;
const MAX_FLUSH_WAIT: Duration = Duration::from_millis(8);
const INITIAL_COALESCE_SLEEP: Duration = Duration::from_millis(1);

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[derive(Serialize, Deserialize)]
struct StreamMetaFile {
    created: i64,
    config: StreamConfig,
}

type StorageCallback = dyn Fn(i64, i64, u64) + Send + Sync;

struct StoreState {
    blocks: Vec<Arc<MsgBlock>>,
    next_index: u32,
    first: SeqTime,
    last_ts: i64,
    msgs: u64,
    bytes: u64,
    closed: bool,
    expiring: bool,
    sips: u32,
    flusher_kick: Option<crossbeam_channel::Sender<()>>,
    flusher_quit: Option<crossbeam_channel::Sender<()>>,
    sync_timer: Option<Timer>,
    age_timer: Option<Timer>,
}

/// A segmented, write-through-cached append log for one stream.
pub struct FileStore {
    config: FileStoreConfig,
    msgs_dir: PathBuf,
    obs_dir: PathBuf,
    hasher: KeyedHasher,
    created: i64,
    last_seq: AtomicU64,
    tail: ArcSwap<MsgBlock>,
    state: RwLock<StoreState>,
    stream_config: RwLock<StreamConfig>,
    scb: StdMutex<Option<Box<StorageCallback>>>,
    /// Per-consumer durable cursors, owned by the stream store (§3.6).
    consumers: RwLock<HashMap<String, Arc<ConsumerStore>>>,
    weak_self: Weak<FileStore>,
}

fn aggregate(blocks: &[Arc<MsgBlock>]) -> (SeqTime, SeqTime, u64, u64) {
    let msgs = blocks.iter().map(|b| b.msgs()).sum();
    let bytes = blocks.iter().map(|b| b.bytes()).sum();
    let first = blocks
        .iter()
        .find(|b| !b.is_empty())
        .map(|b| b.first())
        .unwrap_or_else(|| SeqTime {
            seq: blocks.last().map(|b| b.last_seq()).unwrap_or(0) + 1,
            ts: 0,
        });
    let last = blocks.last().map(|b| b.last()).unwrap_or_default();
    (first, last, msgs, bytes)
}

impl FileStore {
    /// Opens (creating if necessary) a store rooted at `config.store_dir`,
    /// recovering any existing segments (C5) before returning.
    pub fn open(config: FileStoreConfig, stream_config: StreamConfig) -> Result<Arc<Self>> {
        config.validate()?;
        stream_config.effective_block_size()?;

        std::fs::create_dir_all(&config.store_dir)?;
        let msgs_dir = config.store_dir.join("msgs");
        std::fs::create_dir_all(&msgs_dir)?;
        let obs_dir = config.store_dir.join("obs");
        std::fs::create_dir_all(&obs_dir)?;

        let seed = stream_seed(&stream_config.name);
        let hasher = KeyedHasher::from_seed(&seed);

        let meta_path = config.store_dir.join("meta.inf");
        let meta_exists = meta_path.exists();
        let (created, effective_config) = if meta_exists {
            match read_meta::<StreamMetaFile>(&config.store_dir) {
                Some(meta) => (meta.created, meta.config),
                None => (now_nanos(), stream_config.clone()),
            }
        } else {
            (now_nanos(), stream_config.clone())
        };

        let mut indices: Vec<u32> = std::fs::read_dir(&msgs_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|e| e.to_str()) == Some("blk") {
                    path.file_stem()?.to_str()?.parse::<u32>().ok()
                } else {
                    None
                }
            })
            .collect();
        indices.sort_unstable();

        let mut blocks = Vec::with_capacity(indices.len().max(1));
        for idx in &indices {
            blocks.push(MsgBlock::recover(
                &msgs_dir,
                &effective_config.name,
                *idx,
                config.cache_expire,
            )?);
        }
        if blocks.is_empty() {
            blocks.push(MsgBlock::create(
                &msgs_dir,
                &effective_config.name,
                1,
                config.cache_expire,
            )?);
        }

        let (first, last, msgs, bytes) = aggregate(&blocks);
        let next_index = blocks.last().unwrap().index + 1;
        let tail = Arc::clone(blocks.last().unwrap());

        // Recover any consumer directories already on disk (§3.6: the
        // stream store owns consumer stores) so `state().consumers` and
        // `Snapshot(includeConsumers=true)` see them without the caller
        // having to re-open each one by name first.
        let mut consumers = HashMap::new();
        for entry in std::fs::read_dir(&obs_dir)?.filter_map(|e| e.ok()) {
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let cs = ConsumerStore::open(&obs_dir, &name, hasher.clone(), now_nanos())?;
            consumers.insert(name, Arc::new(cs));
        }

        let store = Arc::new_cyclic(|weak| Self {
            config,
            msgs_dir,
            obs_dir,
            hasher,
            created,
            last_seq: AtomicU64::new(last.seq),
            tail: ArcSwap::new(tail),
            state: RwLock::new(StoreState {
                blocks,
                next_index,
                first,
                last_ts: last.ts,
                msgs,
                bytes,
                closed: false,
                expiring: false,
                sips: 0,
                flusher_kick: None,
                flusher_quit: None,
                sync_timer: None,
                age_timer: None,
            }),
            stream_config: RwLock::new(effective_config),
            scb: StdMutex::new(None),
            consumers: RwLock::new(consumers),
            weak_self: weak.clone(),
        });

        if !meta_exists {
            store.write_meta()?;
        }
        store.start_flusher();
        store.start_sync_timer();
        if msgs > 0 {
            store.maybe_start_age_timer();
        }
        Ok(store)
    }

    fn write_meta(&self) -> Result<()> {
        let cfg = self.stream_config.read().clone();
        write_meta(
            &self.config.store_dir,
            &self.hasher,
            &StreamMetaFile {
                created: self.created,
                config: cfg,
            },
        )
    }

    // ---- public accessors -------------------------------------------------

    pub fn state(&self) -> StreamState {
        let state = self.state.read();
        StreamState {
            first_seq: state.first.seq,
            first_ts: state.first.ts,
            last_seq: self.last_seq.load(Ordering::Acquire),
            last_ts: state.last_ts,
            msgs: state.msgs,
            bytes: state.bytes,
            consumers: self.consumers.read().len(),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        self.stream_config.read().clone()
    }

    // ---- consumer cursors (C4, §3.6, §4.5) --------------------------------

    /// Opens (creating on first use) the durable cursor store for consumer
    /// `name`, registering it with this stream so `state().consumers`,
    /// `sync_all`, and a consumer-inclusive `Snapshot` see it without the
    /// caller re-opening it by name each time.
    pub fn open_consumer(&self, name: &str) -> Result<Arc<ConsumerStore>> {
        if let Some(existing) = self.consumers.read().get(name) {
            return Ok(Arc::clone(existing));
        }
        let cs = Arc::new(ConsumerStore::open(
            &self.obs_dir,
            name,
            self.hasher.clone(),
            now_nanos(),
        )?);
        let mut consumers = self.consumers.write();
        let entry = consumers.entry(name.to_string()).or_insert(cs);
        Ok(Arc::clone(entry))
    }

    /// Returns the named consumer's cursor store, if it has been opened.
    pub fn consumer(&self, name: &str) -> Option<Arc<ConsumerStore>> {
        self.consumers.read().get(name).cloned()
    }

    /// Names of every consumer currently registered with this stream.
    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers.read().keys().cloned().collect()
    }

    /// Deletes a consumer's durable state and drops it from the registry.
    pub fn remove_consumer(&self, name: &str) -> Result<()> {
        if let Some(cs) = self.consumers.write().remove(name) {
            cs.delete()?;
        }
        Ok(())
    }

    pub fn register_storage_updates(&self, cb: Box<StorageCallback>) {
        let bytes = self.state.read().bytes;
        *self.scb.lock().unwrap() = Some(cb);
        if bytes > 0 {
            self.invoke_callback(0, bytes as i64, 0);
        }
    }

    fn invoke_callback(&self, msg_delta: i64, byte_delta: i64, seq: u64) {
        if let Some(cb) = self.scb.lock().unwrap().as_ref() {
            cb(msg_delta, byte_delta, seq);
        }
    }

    // ---- writes -------------------------------------------------------

    /// `StoreMsg` (§4.3).
    pub fn store_msg(
        &self,
        subject: &[u8],
        headers: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<(u64, i64)> {
        let rl = crate::record::encoded_size(subject, headers, payload);
        let mut state = self.state.write();
        if state.closed {
            return Err(StoreError::StoreClosed);
        }

        let cfg = self.stream_config.read().clone();
        if cfg.discard == DiscardPolicy::New {
            if cfg.max_msgs > 0 && state.msgs >= cfg.max_msgs {
                return Err(StoreError::MaxMsgs);
            }
            let payload_bytes = headers.map_or(0, <[u8]>::len) + payload.len();
            if cfg.max_bytes > 0 && state.bytes + payload_bytes as u64 >= cfg.max_bytes {
                return Err(StoreError::MaxBytes);
            }
        }

        let seq = self.last_seq.load(Ordering::Acquire) + 1;
        let block_size = if self.config.block_size != 0 {
            self.config.block_size
        } else {
            cfg.effective_block_size()?
        };
        let tail_bytes = state.blocks.last().unwrap().bytes();
        if tail_bytes + rl as u64 > block_size {
            self.roll_over(&mut state, &cfg)?;
        }

        let ts = now_nanos();
        let tail = Arc::clone(state.blocks.last().unwrap());
        let written = tail.write_record(seq, ts, subject, headers, payload)?;

        self.last_seq.store(seq, Ordering::Release);
        let was_empty = state.msgs == 0;
        if was_empty {
            state.first = SeqTime { seq, ts };
        }
        state.last_ts = ts;
        state.msgs += 1;
        state.bytes += written as u64;

        self.kick_flusher(&state);
        drop(state);

        self.enforce_retention(&cfg)?;
        if cfg.max_age.is_some() {
            self.maybe_start_age_timer();
        }
        self.invoke_callback(1, written as i64, seq);

        Ok((seq, ts))
    }

    /// `SkipMsg` (§6).
    pub fn skip_msg(&self) -> Result<u64> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StoreError::StoreClosed);
        }
        let seq = self.last_seq.load(Ordering::Acquire) + 1;
        let ts = now_nanos();
        let tail = Arc::clone(state.blocks.last().unwrap());
        tail.write_skip(seq, ts)?;
        self.last_seq.store(seq, Ordering::Release);
        if state.msgs == 0 {
            state.first = SeqTime { seq: seq + 1, ts };
        }
        state.last_ts = ts;
        Ok(seq)
    }

    fn roll_over(&self, state: &mut StoreState, cfg: &StreamConfig) -> Result<()> {
        let outgoing = Arc::clone(state.blocks.last().unwrap());
        outgoing.flush_pending()?;
        outgoing.write_index_file()?;

        let index = state.next_index;
        state.next_index += 1;
        let fresh = MsgBlock::create(&self.msgs_dir, &cfg.name, index, self.config.cache_expire)?;
        self.tail.store(Arc::clone(&fresh));
        state.blocks.push(fresh);
        Ok(())
    }

    // ---- retention ------------------------------------------------------

    fn enforce_retention(&self, cfg: &StreamConfig) -> Result<()> {
        if cfg.discard != DiscardPolicy::Old {
            return Ok(());
        }
        loop {
            let (msgs, bytes, first_seq) = {
                let state = self.state.read();
                (state.msgs, state.bytes, state.first.seq)
            };
            let over_msgs = cfg.max_msgs > 0 && msgs > cfg.max_msgs;
            let over_bytes = cfg.max_bytes > 0 && bytes > cfg.max_bytes;
            if !over_msgs && !over_bytes {
                return Ok(());
            }
            if !self.remove_msg(first_seq, false)? {
                return Ok(());
            }
        }
    }

    fn maybe_start_age_timer(&self) {
        let mut state = self.state.write();
        if state.age_timer.is_some() || state.closed {
            return;
        }
        let cfg = self.stream_config.read().clone();
        let Some(max_age) = cfg.max_age else { return };
        let weak = self.weak_self.clone();
        let timer = Timer::start(max_age, move || match weak.upgrade() {
            Some(strong) => strong.expire_msgs(),
            None => TimerAction::Stop,
        });
        state.age_timer = Some(timer);
    }

    /// Age enforcer (§4.3 `expire_msgs`), single-flight via `expiring`.
    fn expire_msgs(&self) -> TimerAction {
        {
            let mut state = self.state.write();
            if state.closed {
                return TimerAction::Stop;
            }
            if state.expiring {
                return TimerAction::Reschedule(Duration::from_millis(50));
            }
            state.expiring = true;
        }

        let cfg = self.stream_config.read().clone();
        let Some(max_age) = cfg.max_age else {
            self.state.write().expiring = false;
            return TimerAction::Stop;
        };

        let result = loop {
            let first_seq = self.state.read().first.seq;
            match self.load_msg(first_seq) {
                Ok(rec) => {
                    let now = now_nanos();
                    let age = Duration::from_nanos((now - rec.ts).max(0) as u64);
                    if age >= max_age {
                        if let Err(e) = self.remove_msg(rec.seq, false) {
                            tracing::warn!(error = %e, seq = rec.seq, "age enforcer: remove_msg failed");
                            break TimerAction::Stop;
                        }
                        continue;
                    }
                    let remaining = max_age - age;
                    break TimerAction::Reschedule(remaining);
                }
                Err(StoreError::Eof) => break TimerAction::Stop,
                Err(_) => break TimerAction::Reschedule(max_age),
            }
        };

        self.state.write().expiring = false;
        result
    }

    // ---- flusher --------------------------------------------------------

    fn start_flusher(&self) {
        let (kick_tx, kick_rx) = crossbeam_channel::bounded::<()>(1);
        let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
        let weak = self.weak_self.clone();
        std::thread::Builder::new()
            .name("hdds-filestore-flusher".into())
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(quit_rx) -> _ => break,
                    recv(kick_rx) -> msg => {
                        if msg.is_err() { break; }
                        let Some(strong) = weak.upgrade() else { break };
                        strong.coalesce_and_flush();
                    }
                }
            })
            .expect("spawn flusher thread");
        let mut state = self.state.write();
        state.flusher_kick = Some(kick_tx);
        state.flusher_quit = Some(quit_tx);
    }

    fn kick_flusher(&self, state: &StoreState) {
        if let Some(tx) = state.flusher_kick.as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Coalesced flush (§4.3.2): wait for pending bytes to stop growing,
    /// reach `COALESCE_MINIMUM`, or `MAX_FLUSH_WAIT` to elapse.
    fn coalesce_and_flush(&self) {
        let tail = self.tail.load_full();
        let mut waited = Duration::ZERO;
        let mut sleep = INITIAL_COALESCE_SLEEP;
        let mut last_pending = tail.pending_len();
        if last_pending == 0 {
            return;
        }
        loop {
            if last_pending >= COALESCE_MINIMUM || waited >= MAX_FLUSH_WAIT {
                break;
            }
            std::thread::sleep(sleep);
            waited += sleep;
            sleep = (sleep * 2).min(MAX_FLUSH_WAIT);
            let now_pending = tail.pending_len();
            if now_pending <= last_pending {
                break;
            }
            last_pending = now_pending;
        }
        let _ = tail.flush_pending();
    }

    fn start_sync_timer(&self) {
        let weak = self.weak_self.clone();
        let interval = self.config.sync_interval;
        let timer = Timer::start(interval, move || match weak.upgrade() {
            Some(strong) => {
                strong.sync_all();
                TimerAction::Reschedule(interval)
            }
            None => TimerAction::Stop,
        });
        self.state.write().sync_timer = Some(timer);
    }

    /// Every segment's `fsync` + idx truncate, plus `syncStateFile` on each
    /// consumer (§4.3.3).
    fn sync_all(&self) {
        let blocks = self.state.read().blocks.clone();
        for block in blocks {
            let _ = block.sync();
        }
        let consumers: Vec<_> = self.consumers.read().values().cloned().collect();
        for consumer in consumers {
            let _ = consumer.sync();
        }
    }

    // ---- reads ----------------------------------------------------------

    /// `LoadMsg`: `seq == 0` means "first live message".
    pub fn load_msg(&self, seq: u64) -> Result<DecodedRecord> {
        let (seq, block) = {
            let state = self.state.read();
            if state.closed {
                return Err(StoreError::StoreClosed);
            }
            let seq = if seq == 0 { state.first.seq } else { seq };
            if seq > self.last_seq.load(Ordering::Acquire) {
                return Err(StoreError::Eof);
            }
            if seq < state.first.seq {
                return Err(StoreError::MsgNotFound);
            }
            let block = self
                .select_block_by_seq(&state, seq)
                .ok_or(StoreError::NoMsgBlock)?;
            (seq, block)
        };
        block.fetch(seq)
    }

    fn select_block_by_seq(&self, state: &StoreState, seq: u64) -> Option<Arc<MsgBlock>> {
        state
            .blocks
            .iter()
            .find(|b| b.last_seq() >= seq)
            .cloned()
    }

    /// `GetSeqFromTime`: first `seq` whose `ts >= t`, else `LastSeq + 1`.
    pub fn get_seq_from_time(&self, t: i64) -> u64 {
        let state = self.state.read();
        let blocks = state.blocks.clone();
        drop(state);
        for (i, block) in blocks.iter().enumerate() {
            let is_tail = i + 1 == blocks.len();
            if is_tail {
                let _ = block.flush_pending();
            }
            if block.last().ts >= t {
                // Walk forward from the block's first live seq; segments are
                // small enough in practice that a linear scan is cheap, and
                // the invariant only needs the first matching seq, not all.
                let mut seq = block.first().seq.max(1);
                let last = block.last_seq();
                while seq <= last {
                    match block.fetch(seq) {
                        Ok(rec) if rec.ts >= t => return seq,
                        _ => seq += 1,
                    }
                }
            }
        }
        self.last_seq.load(Ordering::Acquire) + 1
    }

    // ---- removal ----------------------------------------------------------

    /// `RemoveMsg` (non-secure) / `EraseMsg` (secure) (§6).
    pub fn remove_msg(&self, seq: u64, secure: bool) -> Result<bool> {
        let (block, is_first_in_store) = {
            let state = self.state.read();
            if state.closed {
                return Err(StoreError::StoreClosed);
            }
            if state.sips > 0 {
                return Err(StoreError::SnapshotInProgress);
            }
            if seq < state.first.seq || seq > self.last_seq.load(Ordering::Acquire) {
                return Ok(false);
            }
            let block = self
                .select_block_by_seq(&state, seq)
                .ok_or(StoreError::NoMsgBlock)?;
            (block, seq == state.first.seq)
        };

        let rl_before = block.bytes();
        let removed = block.remove(seq, secure)?;
        if !removed {
            return Ok(false);
        }
        let freed = rl_before.saturating_sub(block.bytes());

        let mut state = self.state.write();
        state.msgs = state.msgs.saturating_sub(1);
        state.bytes = state.bytes.saturating_sub(freed);
        if is_first_in_store {
            self.recompute_first(&mut state);
        }
        let empty_non_tail = block.is_empty() && !Arc::ptr_eq(&block, state.blocks.last().unwrap());
        if empty_non_tail {
            block.delete_files();
            state.blocks.retain(|b| !Arc::ptr_eq(b, &block));
        }
        drop(state);

        self.invoke_callback(-1, -(freed as i64), 0);
        Ok(true)
    }

    fn recompute_first(&self, state: &mut StoreState) {
        let next = state
            .blocks
            .iter()
            .find(|b| !b.is_empty())
            .map(|b| b.first());
        state.first = next.unwrap_or(SeqTime {
            seq: self.last_seq.load(Ordering::Acquire) + 1,
            ts: state.last_ts,
        });
    }

    /// `Purge`: drops all messages, preserving `LastSeq`.
    pub fn purge(&self) -> Result<u64> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StoreError::StoreClosed);
        }
        let purged = state.msgs;
        let purged_bytes = state.bytes;

        let transient = self.config.store_dir.join("__msgs__");
        let _ = std::fs::remove_dir_all(&transient);
        if self.msgs_dir.exists() {
            let _ = std::fs::rename(&self.msgs_dir, &transient);
        }
        let _ = std::fs::remove_dir_all(&transient);
        std::fs::create_dir_all(&self.msgs_dir)?;

        let cfg = self.stream_config.read().clone();
        let last_seq = self.last_seq.load(Ordering::Acquire);
        let index = state.next_index;
        state.next_index += 1;
        let fresh = MsgBlock::create(&self.msgs_dir, &cfg.name, index, self.config.cache_expire)?;
        self.tail.store(Arc::clone(&fresh));
        state.blocks = vec![fresh];
        state.first = SeqTime {
            seq: last_seq + 1,
            ts: state.last_ts,
        };
        state.msgs = 0;
        state.bytes = 0;
        drop(state);

        self.invoke_callback(-(purged as i64), -(purged_bytes as i64), 0);
        Ok(purged)
    }

    /// `UpdateConfig`: transactional — restores the old config in memory on
    /// write failure (§4.6).
    pub fn update_config(&self, new_config: StreamConfig) -> Result<()> {
        new_config.effective_block_size()?;
        let old = {
            let mut cfg = self.stream_config.write();
            let old = cfg.clone();
            *cfg = new_config;
            old
        };
        if let Err(e) = self.write_meta() {
            *self.stream_config.write() = old;
            return Err(e);
        }
        let cfg = self.stream_config.read().clone();
        self.enforce_retention(&cfg)?;
        if cfg.max_age.is_some() {
            self.maybe_start_age_timer();
        }
        Ok(())
    }

    // ---- snapshot (C6, §4.4) ----------------------------------------------

    fn begin_snapshot(&self) -> Result<(Vec<Arc<MsgBlock>>, PathBuf)> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StoreError::StoreClosed);
        }
        state.sips += 1;
        Ok((state.blocks.clone(), self.config.store_dir.clone()))
    }

    fn end_snapshot(&self) {
        let mut state = self.state.write();
        state.sips = state.sips.saturating_sub(1);
    }

    pub(crate) fn stream_hasher(&self) -> &KeyedHasher {
        &self.hasher
    }

    /// Walks every current segment's `.blk`, returning sequence numbers
    /// whose stored hash fails to verify (the standalone `checkMsgs`
    /// operation, also runnable as part of [`FileStore::snapshot`]).
    pub fn check_msgs(&self) -> Vec<u64> {
        let blocks = self.state.read().blocks.clone();
        blocks
            .iter()
            .filter_map(|b| b.check_integrity().ok())
            .flatten()
            .collect()
    }

    /// `Snapshot(deadline, checkMsgs, includeConsumers)`: captures the
    /// current block list (and, if requested, every consumer registered via
    /// [`FileStore::open_consumer`]) under the stream lock, increments
    /// `sips` (which refuses concurrent removals, §4.2 `remove`), and
    /// streams a tar+gzip archive back through the returned reader. `sips`
    /// is released once the writer thread finishes, successfully or not.
    pub fn snapshot(
        self: &Arc<Self>,
        check_msgs: bool,
        include_consumers: bool,
        write_deadline: Option<Duration>,
    ) -> Result<crate::snapshot::SnapshotResult> {
        let (blocks, store_dir) = self.begin_snapshot()?;
        let consumers = if include_consumers {
            self.consumers.read().values().cloned().collect()
        } else {
            Vec::new()
        };
        if check_msgs {
            for block in &blocks {
                match block.check_integrity() {
                    Ok(bad) if !bad.is_empty() => {
                        tracing::warn!(?bad, segment = block.index, "snapshot: corrupt records detected");
                    }
                    Err(e) => tracing::warn!(error = %e, segment = block.index, "snapshot: integrity scan failed"),
                    _ => {}
                }
            }
        }

        let block_size = self
            .stream_config
            .read()
            .effective_block_size()
            .unwrap_or(0);
        let weak = Arc::downgrade(self);
        let result = crate::snapshot::spawn_archive_writer(
            crate::snapshot::SnapshotInput {
                store_dir,
                blocks,
                block_size,
                consumers,
                include_consumers,
                write_deadline,
            },
            move || {
                if let Some(strong) = weak.upgrade() {
                    strong.end_snapshot();
                }
            },
        );
        Ok(result)
    }

    // ---- shutdown ---------------------------------------------------------

    /// `Stop` (§5): flush, fsync, stop all background tasks; subsequent
    /// operations return `StoreClosed`.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Some(tx) = state.flusher_quit.take() {
            let _ = tx.send(());
        }
        state.flusher_kick = None;
        // Take the timers out but don't drop them yet: dropping joins their
        // threads, and both callbacks re-acquire this same stream lock
        // (`sync_all` reads it, `expire_msgs` writes it) — joining while
        // still holding the write guard would deadlock against an in-flight
        // fire (§5: callbacks are never invoked while a lock is held).
        let sync_timer = state.sync_timer.take();
        let age_timer = state.age_timer.take();
        let blocks = state.blocks.clone();
        drop(state);
        drop(sync_timer);
        drop(age_timer);

        let mut first_err = None;
        for block in blocks {
            if let Err(e) = block.close() {
                first_err.get_or_insert(e);
            }
        }
        // "stops each consumer" (§5): a consumer store has no background
        // tasks of its own, so stopping it means flushing its last state to
        // disk rather than leaving the lazily-truncated o.dat stale.
        let consumers: Vec<_> = self.consumers.read().values().cloned().collect();
        for consumer in consumers {
            if let Err(e) = consumer.sync() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// `Delete` = `Purge` + `Stop` + recursive directory removal.
    pub fn delete(&self) -> Result<()> {
        let _ = self.purge();
        self.stop()?;
        std::fs::remove_dir_all(&self.config.store_dir)?;
        Ok(())
    }
}

/// Best-effort flush/fsync/thread-teardown if `Stop` was never called
/// explicitly, mirroring the teacher crates' pattern of not leaking
/// background threads on unwind (§15).
impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
