//! Raw partitioned block I/O for shale
//!
//! This crate owns the byte-exact on-disk layout:
//! - **Header**: the 512-byte record at offset 128 KiB resolving the
//!   partition geometry
//! - **Device**: whole-block reads and writes addressed by
//!   `(Part, addr)`
//! - **Super-block**: the singleton root record of the file system
//! - **format**: initializing a fresh device
//!
//! I/O here is synchronous and uncached; ordering is the caller's
//! responsibility (the cache's dependency graph takes care of it).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod format;
pub mod header;
pub mod super_block;

pub use device::Disk;
pub use format::{format, format_with_header, FormatOpts};
pub use header::{Header, HEADER_MAGIC, HEADER_OFFSET, HEADER_SIZE, HEADER_VERSION};
pub use super_block::{Super, SUPER_MAGIC, SUPER_SIZE, SUPER_VERSION};
