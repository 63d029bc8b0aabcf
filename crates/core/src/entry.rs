//! Source entries
//!
//! An entry is the fixed-size record stored inside a directory block that
//! points at a child source: the root score of the child's block tree plus
//! its geometry. Entries are 64 bytes, big-endian:
//!
//! ```text
//! gen u32 | psize u16 | dsize u16 | flags u8 | depth u8 | pad u16 |
//! size u64 | score [20] | tag u32 | snap u32 | archive u8 | pad [15]
//! ```
//!
//! `tag` is meaningful only while the child tree is local; once archived
//! the entry carries `tag = 0` and a depot score. `snap != 0` marks an
//! entry that belongs to a frozen snapshot of that epoch.

use crate::error::{Error, Result};
use crate::score::{Score, SCORE_SIZE};
use byteorder::{BigEndian, ByteOrder};

/// Size of one packed entry in bytes
pub const ENTRY_SIZE: usize = 64;

/// Entry is in use
pub const ENTRY_ACTIVE: u8 = 1 << 0;
/// Child source is a directory
pub const ENTRY_DIR: u8 = 1 << 1;
/// Child tree is rooted in a local block
pub const ENTRY_LOCAL: u8 = 1 << 2;

/// Entries per directory block of the given block size
pub fn entries_per_block(block_size: usize) -> usize {
    block_size / ENTRY_SIZE
}

/// Record pointing at a child source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Generation number, bumped when the slot is reused
    pub gen: u32,
    /// Pointer-block size of the child tree
    pub psize: u16,
    /// Data-block size of the child tree
    pub dsize: u16,
    /// ENTRY_* flag bits
    pub flags: u8,
    /// Height of the child tree
    pub depth: u8,
    /// Logical size of the child stream in bytes
    pub size: u64,
    /// Root score of the child tree
    pub score: Score,
    /// Tag of the child's local blocks; 0 once archived
    pub tag: u32,
    /// Non-zero: entry belongs to a snapshot frozen at this epoch
    pub snap: u32,
    /// The snapshot this entry belongs to is to be archived
    pub archive: bool,
}

impl Entry {
    /// An inactive (empty) entry slot
    pub fn empty() -> Entry {
        Entry {
            gen: 0,
            psize: 0,
            dsize: 0,
            flags: 0,
            depth: 0,
            size: 0,
            score: Score::ZERO,
            tag: 0,
            snap: 0,
            archive: false,
        }
    }

    /// True if the slot is in use
    pub fn is_active(&self) -> bool {
        self.flags & ENTRY_ACTIVE != 0
    }

    /// True if the child source is a directory
    pub fn is_dir(&self) -> bool {
        self.flags & ENTRY_DIR != 0
    }

    /// True while the child tree is rooted in a local block
    pub fn is_local(&self) -> bool {
        self.flags & ENTRY_LOCAL != 0
    }

    /// Pack into `buf[off..off + ENTRY_SIZE]`
    pub fn pack(&self, buf: &mut [u8], off: usize) {
        let b = &mut buf[off..off + ENTRY_SIZE];
        b.fill(0);
        BigEndian::write_u32(&mut b[0..4], self.gen);
        BigEndian::write_u16(&mut b[4..6], self.psize);
        BigEndian::write_u16(&mut b[6..8], self.dsize);
        b[8] = self.flags;
        b[9] = self.depth;
        BigEndian::write_u64(&mut b[12..20], self.size);
        self.score.write_to(b, 20);
        BigEndian::write_u32(&mut b[40..44], self.tag);
        BigEndian::write_u32(&mut b[44..48], self.snap);
        b[48] = self.archive as u8;
    }

    /// Unpack from `buf[off..off + ENTRY_SIZE]`
    pub fn unpack(buf: &[u8], off: usize) -> Result<Entry> {
        let b = &buf[off..off + ENTRY_SIZE];
        let e = Entry {
            gen: BigEndian::read_u32(&b[0..4]),
            psize: BigEndian::read_u16(&b[4..6]),
            dsize: BigEndian::read_u16(&b[6..8]),
            flags: b[8],
            depth: b[9],
            size: BigEndian::read_u64(&b[12..20]),
            score: Score::read_from(b, 20),
            tag: BigEndian::read_u32(&b[40..44]),
            snap: BigEndian::read_u32(&b[44..48]),
            archive: b[48] != 0,
        };
        if e.is_active() && (e.psize < SCORE_SIZE as u16 || (e.dsize as usize) < ENTRY_SIZE) {
            return Err(Error::Corruption(format!(
                "entry with degenerate block sizes psize={} dsize={}",
                e.psize, e.dsize
            )));
        }
        Ok(e)
    }
}
