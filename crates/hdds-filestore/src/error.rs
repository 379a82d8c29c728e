// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Store error taxonomy.
//!
//! Mirrors the kinds enumerated in the design doc's error handling section:
//! a small, closed set of conditions a caller above the store needs to
//! branch on, plus a catch-all for I/O failures.

use std::io;
use thiserror::Error;

/// Errors a [`crate::store::FileStore`] or [`crate::block::MsgBlock`] can
/// surface to a caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operation attempted after `Stop`/`Delete`.
    #[error("store is closed")]
    StoreClosed,

    /// A snapshot is in progress; removals are refused until it completes.
    #[error("snapshot in progress")]
    SnapshotInProgress,

    /// `seq` is past `LastSeq`.
    #[error("sequence past end of stream")]
    Eof,

    /// `seq` falls in a deleted hole or a gap never populated.
    #[error("message not found")]
    MsgNotFound,

    /// `DiscardNew` refused the write: message count limit reached.
    #[error("maximum message count reached")]
    MaxMsgs,

    /// `DiscardNew` refused the write: byte limit reached.
    #[error("maximum byte count reached")]
    MaxBytes,

    /// Encoded record size would set the reserved high bit of `total_len`.
    #[error("message too large to encode ({0} bytes)")]
    MsgTooLarge(usize),

    /// Decode or checksum validation failed.
    #[error("corrupt message: {0}")]
    BadMsg(String),

    /// `seq` is present in the segment's deletion map.
    #[error("message was deleted")]
    DeletedMsg,

    /// The target segment could not be selected for the given sequence/time.
    #[error("no such segment")]
    NoMsgBlock,

    /// Consumer cursor state was invalid (ack floor past delivered, etc).
    #[error("invalid consumer state: {0}")]
    InvalidConsumerState(String),

    /// Store configuration is invalid.
    #[error("invalid store configuration: {0}")]
    Configuration(String),

    /// Wrapped I/O failure (open/read/write/fsync/rename/remove).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
