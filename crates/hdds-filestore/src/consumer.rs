// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer cursor store (C4, §4.5): `AckFloor`, `Delivered`, `Pending`,
//! `Redelivered`, persisted as a compact varint-delta record in
//! `obs/<name>/o.dat`, alongside `meta.inf`/`meta.sum` (§4.6).

use crate::error::{Result, StoreError};
use crate::hash::KeyedHasher;
use crate::index::{MAGIC, VERSION};
use crate::meta::{read_meta, write_meta};

use integer_encoding::{VarIntReader, VarIntWriter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// `(ConsumerSeq, StreamSeq)`, used for both `AckFloor` and `Delivered`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqPair {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

/// A consumer's full durable cursor (§3.5).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerState {
    pub ack_floor: SeqPair,
    pub delivered: SeqPair,
    /// `stream_seq -> delivery timestamp (ns)`.
    pub pending: BTreeMap<u64, i64>,
    /// `stream_seq -> redelivery count`.
    pub redelivered: BTreeMap<u64, u64>,
}

fn validate(state: &ConsumerState) -> Result<()> {
    if state.delivered.consumer_seq < 1 || state.delivered.stream_seq < 1 {
        return Err(StoreError::InvalidConsumerState(
            "Delivered must be >= (1,1)".into(),
        ));
    }
    if state.ack_floor.consumer_seq > state.delivered.consumer_seq
        || state.ack_floor.stream_seq > state.delivered.stream_seq
    {
        return Err(StoreError::InvalidConsumerState(
            "AckFloor must be <= Delivered".into(),
        ));
    }
    for &k in state.pending.keys() {
        if k <= state.ack_floor.stream_seq || k > state.delivered.stream_seq {
            return Err(StoreError::InvalidConsumerState(format!(
                "pending key {k} outside (AckFloor.StreamSeq, Delivered.StreamSeq]"
            )));
        }
    }
    Ok(())
}

/// Encodes `state` per §4.5's wire format.
pub fn encode_state(state: &ConsumerState) -> Result<Vec<u8>> {
    validate(state)?;
    let mut buf = Vec::new();
    buf.push(MAGIC);
    buf.push(VERSION);
    buf.write_varint(state.ack_floor.consumer_seq)?;
    buf.write_varint(state.ack_floor.stream_seq)?;
    buf.write_varint(state.delivered.consumer_seq - state.ack_floor.consumer_seq)?;
    buf.write_varint(state.delivered.stream_seq - state.ack_floor.stream_seq)?;
    buf.write_varint(state.pending.len() as u64)?;
    if !state.pending.is_empty() {
        let min_ts_secs = state.pending.values().map(|v| v / NANOS_PER_SEC).min().unwrap();
        buf.write_varint(min_ts_secs)?;
        for (&k, &v) in &state.pending {
            buf.write_varint(k - state.ack_floor.stream_seq)?;
            buf.write_varint(v / NANOS_PER_SEC - min_ts_secs)?;
        }
    }
    buf.write_varint(state.redelivered.len() as u64)?;
    for (&k, &v) in &state.redelivered {
        buf.write_varint(k)?;
        buf.write_varint(v)?;
    }
    Ok(buf)
}

/// Decodes the inverse of [`encode_state`], shifting `pending` keys/values
/// back to absolute stream sequences and nanosecond timestamps.
pub fn decode_state(bytes: &[u8]) -> Result<ConsumerState> {
    let mut cursor = Cursor::new(bytes);
    let mut header = [0u8; 2];
    cursor
        .read_exact(&mut header)
        .map_err(|_| StoreError::InvalidConsumerState("truncated header".into()))?;
    if header[0] != MAGIC || header[1] != VERSION {
        return Err(StoreError::InvalidConsumerState(
            "bad magic/version".into(),
        ));
    }

    let ack_consumer: u64 = cursor.read_varint()?;
    let ack_stream: u64 = cursor.read_varint()?;
    let delivered_consumer_delta: u64 = cursor.read_varint()?;
    let delivered_stream_delta: u64 = cursor.read_varint()?;
    let ack_floor = SeqPair {
        consumer_seq: ack_consumer,
        stream_seq: ack_stream,
    };
    let delivered = SeqPair {
        consumer_seq: ack_consumer + delivered_consumer_delta,
        stream_seq: ack_stream + delivered_stream_delta,
    };

    let pending_len: u64 = cursor.read_varint()?;
    let mut pending = BTreeMap::new();
    if pending_len > 0 {
        let min_ts_secs: i64 = cursor.read_varint()?;
        for _ in 0..pending_len {
            let k_delta: u64 = cursor.read_varint()?;
            let v_delta: i64 = cursor.read_varint()?;
            let stream_seq = ack_stream + k_delta;
            let ts_nanos = (v_delta + min_ts_secs) * NANOS_PER_SEC;
            pending.insert(stream_seq, ts_nanos);
        }
    }

    let redelivered_len: u64 = cursor.read_varint()?;
    let mut redelivered = BTreeMap::new();
    for _ in 0..redelivered_len {
        let k: u64 = cursor.read_varint()?;
        let v: u64 = cursor.read_varint()?;
        redelivered.insert(k, v);
    }

    let state = ConsumerState {
        ack_floor,
        delivered,
        pending,
        redelivered,
    };
    validate(&state)?;
    Ok(state)
}

#[derive(Serialize, Deserialize)]
struct ConsumerMetaFile {
    created: i64,
}

/// One consumer's durable cursor directory: `obs/<name>/{meta.inf,meta.sum,o.dat}`.
pub struct ConsumerStore {
    dir: PathBuf,
    hasher: KeyedHasher,
    state_file: Mutex<File>,
    state: Mutex<ConsumerState>,
    last_write_size: AtomicU64,
}

impl ConsumerStore {
    /// Opens (creating if necessary) the consumer directory under
    /// `obs_dir/<name>`, recovering any state already on disk.
    pub fn open(obs_dir: &Path, name: &str, hasher: KeyedHasher, created: i64) -> Result<Self> {
        let dir = obs_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        let state_path = dir.join("o.dat");
        let state_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&state_path)?;

        let len = state_file.metadata()?.len();
        let state = if len > 0 {
            let mut buf = vec![0u8; len as usize];
            state_file.read_exact_at(&mut buf, 0)?;
            decode_state(&buf).unwrap_or_default()
        } else {
            ConsumerState::default()
        };

        if read_meta::<ConsumerMetaFile>(&dir).is_none() {
            write_meta(&dir, &hasher, &ConsumerMetaFile { created })?;
        }

        Ok(Self {
            dir,
            hasher,
            state_file: Mutex::new(state_file),
            state: Mutex::new(state),
            last_write_size: AtomicU64::new(len),
        })
    }

    /// `Update`: validates and persists a new cursor state at offset 0.
    pub fn update(&self, new_state: ConsumerState) -> Result<()> {
        let encoded = encode_state(&new_state)?;
        let file = self.state_file.lock();
        file.write_all_at(&encoded, 0)?;
        self.last_write_size.store(encoded.len() as u64, Ordering::Relaxed);
        *self.state.lock() = new_state;
        Ok(())
    }

    /// `State`: a snapshot copy of the in-memory cursor.
    pub fn state(&self) -> ConsumerState {
        self.state.lock().clone()
    }

    /// Lazily truncates `o.dat` to the last written size and fsyncs it
    /// (§4.3.3 sync timer, applied per-consumer).
    pub fn sync(&self) -> Result<()> {
        let file = self.state_file.lock();
        file.sync_all()?;
        file.set_len(self.last_write_size.load(Ordering::Relaxed))?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hasher(&self) -> &KeyedHasher {
        &self.hasher
    }

    pub fn delete(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}
