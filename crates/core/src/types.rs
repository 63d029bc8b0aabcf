//! Block addressing and classification
//!
//! A block is addressed by `(Part, addr)` locally and by its [`Score`]
//! globally. Its role in a source tree is described by [`BlockType`]:
//! a direction bit (data stream vs directory) and a level (0 for leaves,
//! up to 7 for pointer blocks).
//!
//! [`Score`]: crate::score::Score

use crate::error::{Error, Result};

/// Sentinel address meaning "no block"
pub const NIL_ADDR: u32 = u32::MAX;

/// Exclusive upper bound on local block addresses
pub const MAX_ADDR: u32 = 1 << 31;

/// Tag that must never appear on an allocated block
pub const BAD_TAG: u32 = 0;

/// Tag of the root source's blocks
pub const ROOT_TAG: u32 = 1;

/// Tag of a directory-listing root
pub const ENUM_TAG: u32 = 2;

/// First tag available for ordinary sources; tags below are well-known
pub const USER_TAG: u32 = 32;

/// Disk partitions
///
/// `Remote` is synthetic: such blocks live only in the depot and occupy a
/// cache slot without any local storage behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Part {
    /// Single-block partition holding the super-block
    Super,
    /// Array of per-block labels, parallel to the data partition
    Label,
    /// Payload blocks
    Data,
    /// Synthetic partition for depot-only blocks
    Remote,
}

/// Access mode for opens and block gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reads only; copy-on-write is never triggered
    ReadOnly,
    /// Reads and writes; mutation may trigger copy-on-write
    ReadWrite,
}

/// Block type: data vs directory, and tree level
///
/// Level 0 blocks are leaves (raw bytes for data sources, packed entries
/// for directory sources); higher levels are pointer blocks holding child
/// scores. The byte encoding uses bit 3 for the directory flag and bits
/// 0..3 for the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockType {
    /// True for directory sources
    pub dir: bool,
    /// Tree level, 0..=7
    pub level: u8,
}

/// Highest representable tree level
pub const MAX_LEVEL: u8 = 7;

impl BlockType {
    /// Leaf or pointer block of a data source at `level`
    pub fn data(level: u8) -> BlockType {
        debug_assert!(level <= MAX_LEVEL);
        BlockType { dir: false, level }
    }

    /// Leaf or pointer block of a directory source at `level`
    pub fn dir(level: u8) -> BlockType {
        debug_assert!(level <= MAX_LEVEL);
        BlockType { dir: true, level }
    }

    /// True for level-0 blocks
    pub fn is_leaf(self) -> bool {
        self.level == 0
    }

    /// The type of this block's children, or `None` for leaves
    pub fn child(self) -> Option<BlockType> {
        if self.level == 0 {
            None
        } else {
            Some(BlockType {
                dir: self.dir,
                level: self.level - 1,
            })
        }
    }

    /// Encode to the on-disk type byte
    pub fn to_byte(self) -> u8 {
        ((self.dir as u8) << 3) | self.level
    }

    /// Decode from the on-disk type byte
    pub fn from_byte(b: u8) -> Result<BlockType> {
        if b & !0x0f != 0 || b & 0x07 > MAX_LEVEL {
            return Err(Error::Corruption(format!("bad block type byte {b:#x}")));
        }
        Ok(BlockType {
            dir: b & 0x08 != 0,
            level: b & 0x07,
        })
    }
}
