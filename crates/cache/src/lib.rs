//! Buffer pool for shale
//!
//! The cache is a bounded set of block slots hashed by `(Part, addr)`
//! (plus a score-keyed side index for depot-only blocks). It enforces
//! block locking, dirty tracking, disk write ordering through the
//! per-block dependency graph, and LRU eviction, and it runs the
//! background flusher. Block allocation and copy-on-write live here too,
//! since both are label-store transactions.
//!
//! # Locking
//!
//! Three layers, acquired strictly in this order:
//!
//! 1. A block's *logical lock*, spanning `get`..drop of the [`BlockRef`]
//!    guard. Blocks of different roles nest Super -> Data (parent before
//!    child) -> Label; every dependency edge points the same way, so the
//!    forced-write recursion cannot deadlock.
//! 2. The cache-wide index lock (hash map, LRU order, counters), never
//!    held across I/O.
//! 3. A slot's inner lock protecting its image and io state, held only
//!    for short sections; disk and depot I/O happen on a private copy.
//!
//! # Write ordering
//!
//! The dependency graph is a DAG by construction: a new block's
//! dependencies point only at older blocks. When a block must go to disk
//! while a dependency is still dirty, the recorded rollback (old pointer
//! score, old entry image, or old super-block root) is written instead,
//! so the on-disk image never references a block that has not landed.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod block;
mod cache;
mod labels;
mod write;

pub use block::{BlockRef, IoState, Rollback};
pub use cache::{Cache, CacheConfig};
