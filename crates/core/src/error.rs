//! Error types for shale
//!
//! One unified error enum is shared by every crate in the workspace. We use
//! `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! The recovery policy per kind:
//! - `BadMode`, `BadAddr`: reported to the caller, no state change.
//! - `BadRoot`: the caller may attempt a copy-on-write of the root and
//!   retry; surfaced if still bad.
//! - `BadLabel`: propagated; the caller typically aborts the operation.
//! - `Read`: surfaced; the cache leaves the block marked so the next get
//!   retries the disk.
//! - Local *write* errors never appear here: the cache retries them with
//!   backoff indefinitely.
//! - `Depot`: surfaced to the caller; the archiver pauses and retries.
//! - `InvalidState`: an invariant violation. The current operation is
//!   aborted and the event logged; the file system itself stays up.

use crate::types::Part;
use std::io;
use thiserror::Error;

/// Result type alias for shale operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the shale block store
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying device file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested open mode is not supported
    #[error("bad open mode")]
    BadMode,

    /// The super-block names a root that cannot be opened
    #[error("root is inaccessible")]
    BadRoot,

    /// A block's on-disk label does not match what the caller expected
    #[error("bad label: {reason} ({part:?} block {addr})")]
    BadLabel {
        /// Partition the block lives in
        part: Part,
        /// Block address within the partition
        addr: u32,
        /// What did not match (type, tag, epoch, or state)
        reason: &'static str,
    },

    /// A block address is outside its partition
    #[error("block address {0} out of range")]
    BadAddr(u32),

    /// A local read failed; the block is marked and the next get retries
    #[error("read error ({part:?} block {addr})")]
    Read {
        /// Partition the block lives in
        part: Part,
        /// Block address within the partition
        addr: u32,
    },

    /// The external content store failed or is unreachable
    #[error("depot error: {0}")]
    Depot(String),

    /// On-disk structure failed validation
    #[error("corruption: {0}")]
    Corruption(String),

    /// An internal invariant was violated
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No free block is available in the data partition
    #[error("file system is full")]
    Full,

    /// The named source or entry does not exist
    #[error("no such source")]
    NotFound,
}

impl Error {
    /// True if the error indicates an unreachable or failing depot.
    ///
    /// The archiver uses this to decide between pausing-and-retrying and
    /// surfacing the failure.
    pub fn is_depot(&self) -> bool {
        matches!(self, Error::Depot(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_bad_label() {
        let err = Error::BadLabel {
            part: Part::Data,
            addr: 42,
            reason: "tag mismatch",
        };
        let msg = err.to_string();
        assert!(msg.contains("bad label"));
        assert!(msg.contains("tag mismatch"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn test_error_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "no device"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_is_depot() {
        assert!(Error::Depot("unreachable".into()).is_depot());
        assert!(!Error::BadRoot.is_depot());
    }
}
