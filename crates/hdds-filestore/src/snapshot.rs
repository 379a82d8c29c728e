// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Snapshotter (C6, §4.4): a consistent tar+gzip archive of a stream's
//! segment/meta/consumer files, streamed through a channel-backed pipe so
//! the caller can read it incrementally without the writer thread holding
//! the whole archive in memory.

use crate::block::MsgBlock;
use crate::consumer::ConsumerStore;

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Bounded to give the writer thread genuine backpressure, mirroring a
/// small-buffer OS pipe rather than building the whole archive in memory.
const PIPE_DEPTH: usize = 4;

struct ChannelWriter {
    tx: crossbeam_channel::Sender<Vec<u8>>,
    deadline: Option<Duration>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let chunk = buf.to_vec();
        let result = match self.deadline {
            Some(d) => self.tx.send_timeout(chunk, d).map_err(|_| ()),
            None => self.tx.send(chunk).map_err(|_| ()),
        };
        match result {
            Ok(()) => Ok(buf.len()),
            Err(()) => Err(io::Error::new(io::ErrorKind::TimedOut, "snapshot reader stalled")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The reader half of a [`ChannelWriter`]; implements [`Read`] by draining
/// whole chunks as they arrive.
pub struct SnapshotReader {
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for SnapshotReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let available = &self.pending[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Result of [`crate::store::FileStore::snapshot`] (§4.4).
pub struct SnapshotResult {
    pub reader: SnapshotReader,
    pub blk_size: u64,
    pub num_blks: usize,
}

pub(crate) struct SnapshotInput {
    pub store_dir: PathBuf,
    pub blocks: Vec<Arc<MsgBlock>>,
    pub block_size: u64,
    pub consumers: Vec<Arc<ConsumerStore>>,
    pub include_consumers: bool,
    pub write_deadline: Option<Duration>,
}

/// Spawns the archive-writer thread and returns the connected reader end.
/// `on_done` runs once the archive is complete (successfully or not) so the
/// caller can release its `sips` guard.
pub(crate) fn spawn_archive_writer(
    input: SnapshotInput,
    on_done: impl FnOnce() + Send + 'static,
) -> SnapshotResult {
    let num_blks = input.blocks.len();
    let block_size = input.block_size;
    let deadline = input.write_deadline;
    let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(PIPE_DEPTH);

    std::thread::Builder::new()
        .name("hdds-filestore-snapshot".into())
        .spawn(move || {
            let writer = ChannelWriter { tx, deadline };
            let gz = GzEncoder::new(writer, Compression::fast());
            let mut archive = tar::Builder::new(gz);
            let _ = append_archive_entries(&mut archive, &input);
            let _ = archive.finish();
            on_done();
        })
        .expect("spawn snapshot writer thread");

    SnapshotResult {
        reader: SnapshotReader {
            rx,
            pending: Vec::new(),
            pos: 0,
        },
        blk_size: block_size,
        num_blks,
    }
}

fn append_archive_entries<W: Write>(
    archive: &mut tar::Builder<W>,
    input: &SnapshotInput,
) -> io::Result<()> {
    append_if_present(archive, &input.store_dir.join("meta.inf"), "meta.inf");
    append_if_present(archive, &input.store_dir.join("meta.sum"), "meta.sum");

    for block in &input.blocks {
        // Flushing here (rather than trusting an earlier flush) covers the
        // tail segment, whose write buffer may still hold unflushed bytes.
        let _ = block.flush_pending();
        let _ = block.write_index_file();
        let blk_name = format!("msgs/{}.blk", block.index);
        let idx_name = format!("msgs/{}.idx", block.index);
        append_if_present(archive, block.blk_path(), &blk_name);
        append_if_present(archive, block.idx_path(), &idx_name);
    }

    if input.include_consumers {
        for consumer in &input.consumers {
            let Some(name) = consumer.dir().file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            append_if_present(
                archive,
                &consumer.dir().join("meta.inf"),
                &format!("obs/{name}/meta.inf"),
            );
            append_if_present(
                archive,
                &consumer.dir().join("meta.sum"),
                &format!("obs/{name}/meta.sum"),
            );
            append_if_present(
                archive,
                &consumer.dir().join("o.dat"),
                &format!("obs/{name}/o.dat"),
            );
        }
    }
    Ok(())
}

/// Best-effort append: a file that vanished between snapshot start and the
/// writer thread running (e.g. a segment emptied by FIFO deletion) is
/// simply skipped rather than failing the whole archive.
fn append_if_present<W: Write>(archive: &mut tar::Builder<W>, path: &std::path::Path, name: &str) {
    if let Ok(mut file) = std::fs::File::open(path) {
        let _ = archive.append_file(name, &mut file);
    }
}
