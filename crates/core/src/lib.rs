//! Core types for shale
//!
//! This crate defines the vocabulary shared by every layer of the system:
//! - Score: 20-byte content hash, with the local-address encoding
//! - Part / BlockType / tags: how blocks are addressed and classified
//! - Label and BlockState: per-block metadata and the copy-on-write
//!   state machine
//! - Entry: the fixed-size record pointing at a child source
//! - Depot: the external content-addressed store seam
//! - Error: the error type hierarchy
//! - Tuning: runtime-tuneable constants

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod depot;
pub mod entry;
pub mod error;
pub mod label;
pub mod score;
pub mod tuning;
pub mod types;

pub use depot::{score_check, Depot, MemDepot};
pub use entry::{entries_per_block, Entry, ENTRY_ACTIVE, ENTRY_DIR, ENTRY_LOCAL, ENTRY_SIZE};
pub use error::{Error, Result};
pub use label::{bits, BlockState, CowAction, Label, LABEL_SIZE};
pub use score::{Score, SCORE_SIZE};
pub use tuning::Tuning;
pub use types::{
    BlockType, Mode, Part, BAD_TAG, ENUM_TAG, MAX_ADDR, NIL_ADDR, ROOT_TAG, USER_TAG,
};
