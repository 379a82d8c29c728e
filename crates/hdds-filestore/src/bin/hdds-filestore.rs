// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `hdds-filestore`: inspect and administer a stream's on-disk store.
//!
//! # Usage
//!
//! ```bash
//! hdds-filestore --store-dir /var/lib/hdds/orders stats
//! hdds-filestore --store-dir /var/lib/hdds/orders dump --seq 42
//! hdds-filestore --store-dir /var/lib/hdds/orders check
//! hdds-filestore --store-dir /var/lib/hdds/orders purge --confirm
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hdds_filestore::{FileStore, FileStoreConfig, StreamConfig};

#[derive(Parser, Debug)]
#[command(name = "hdds-filestore", about = "Inspect and administer a file-backed stream store")]
struct Args {
    /// Directory holding meta.inf, msgs/, obs/ for this stream.
    #[arg(long)]
    store_dir: std::path::PathBuf,

    /// Stream name to use when the store doesn't exist yet.
    #[arg(long, default_value = "default")]
    stream: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print aggregate stream state (first/last seq, msgs, bytes).
    Stats,
    /// List the on-disk segments backing this stream.
    List,
    /// Decode and print a single message by sequence number.
    Dump {
        /// Sequence to load; 0 means the first live message.
        #[arg(long, default_value_t = 0)]
        seq: u64,
    },
    /// Walk every segment and report sequence numbers with a bad checksum.
    Check,
    /// Drop all messages, preserving LastSeq.
    Purge {
        #[arg(long)]
        confirm: bool,
    },
    /// Remove a single message.
    Remove {
        seq: u64,
        #[arg(long)]
        secure: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let store = FileStore::open(
        FileStoreConfig::new(&args.store_dir),
        StreamConfig::new(&args.stream),
    )
    .with_context(|| format!("opening store at {}", args.store_dir.display()))?;

    match args.command {
        Commands::Stats => {
            let state = store.state();
            println!("first_seq = {}", state.first_seq);
            println!("last_seq  = {}", state.last_seq);
            println!("msgs      = {}", state.msgs);
            println!("bytes     = {}", state.bytes);
        }
        Commands::List => {
            let msgs_dir = args.store_dir.join("msgs");
            let mut entries: Vec<_> = std::fs::read_dir(&msgs_dir)
                .with_context(|| format!("reading {}", msgs_dir.display()))?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("blk"))
                .map(|e| e.path())
                .collect();
            entries.sort();
            for path in entries {
                println!("{}", path.display());
            }
        }
        Commands::Dump { seq } => {
            let rec = store.load_msg(seq)?;
            println!("seq     = {}", rec.seq);
            println!("ts      = {}", rec.ts);
            println!("subject = {}", String::from_utf8_lossy(&rec.subject));
            println!("payload = {} bytes", rec.payload.len());
        }
        Commands::Check => {
            let bad = store.check_msgs();
            if bad.is_empty() {
                println!("all segments verified clean");
            } else {
                println!("corrupt sequences: {bad:?}");
                std::process::exit(1);
            }
        }
        Commands::Purge { confirm } => {
            if !confirm {
                anyhow::bail!("refusing to purge without --confirm");
            }
            let purged = store.purge()?;
            println!("purged {purged} messages");
        }
        Commands::Remove { seq, secure } => {
            let removed = store.remove_msg(seq, secure)?;
            println!("removed = {removed}");
        }
    }

    store.stop()?;
    Ok(())
}
