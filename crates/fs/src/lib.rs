//! The shale file-system core
//!
//! This crate assembles the epoch-based copy-on-write machinery on top
//! of the cache:
//! - `Fs`: open/close, sync, snapshots, reclamation, qids, the depot
//!   session
//! - `Source`: growable typed byte streams over block trees
//! - the snapshot/archive protocol and the archiver thread
//! - periodic background tasks (metadata flush, snapshot scheduler)
//!
//! # Lock hierarchy
//!
//! `elk` (the epoch lock) before any source lock before any block lock;
//! the cache's internal locks are below all of them and never held
//! across I/O. Locks are released strictly in reverse order.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod archive;
pub mod fs;
pub mod periodic;
pub mod snap;
pub mod source;

pub use fs::{Epochs, Fs, OpenConfig};
pub use periodic::Periodic;
pub use snap::{snapshot_name, NullSink, SnapshotInfo, SnapshotSink};
pub use source::Source;
