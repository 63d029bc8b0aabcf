//! shale: a snapshotting copy-on-write block file system
//!
//! Clients see a hierarchical tree of sources; the storage layer splits
//! every stream into a tree of fixed-size blocks identified by
//! cryptographic scores, persists the active tree on a local partition,
//! and periodically archives frozen snapshots into an external
//! content-addressed store (the depot).
//!
//! The facade re-exports the public surface of the workspace crates:
//!
//! ```no_run
//! use std::sync::Arc;
//! use shale::{format, FormatOpts, Fs, MemDepot, Mode, OpenConfig};
//!
//! # fn main() -> shale::Result<()> {
//! let file = std::fs::OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .create(true)
//!     .open("fs.img")?;
//! file.set_len(64 * 1024 * 1024)?;
//! format(&file, 8192, FormatOpts::new("main"))?;
//!
//! let depot = Arc::new(MemDepot::new());
//! let fs = Fs::from_file(file, depot, OpenConfig::new(Mode::ReadWrite))?;
//! let root = fs.root();
//! let f = root.create(false)?;
//! f.write(0, b"hello")?;
//! fs.snapshot(false)?;
//! fs.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use shale_core::{
    bits, entries_per_block, score_check, BlockState, BlockType, CowAction, Depot, Entry, Error,
    Label, MemDepot, Mode, Part, Result, Score, Tuning, ENTRY_ACTIVE, ENTRY_DIR, ENTRY_LOCAL,
    ENTRY_SIZE, LABEL_SIZE, NIL_ADDR, ROOT_TAG, SCORE_SIZE, USER_TAG,
};

pub use shale_disk::{
    format, format_with_header, Disk, FormatOpts, Header, Super, HEADER_MAGIC, HEADER_OFFSET,
    HEADER_SIZE, SUPER_MAGIC, SUPER_SIZE,
};

pub use shale_cache::{BlockRef, Cache, CacheConfig, IoState, Rollback};

pub use shale_fs::{
    snapshot_name, Fs, NullSink, OpenConfig, Periodic, SnapshotInfo, SnapshotSink, Source,
};
