//! Block slots and the `BlockRef` guard

use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use shale_core::{BlockType, Label, Mode, Part, Score, ENTRY_SIZE};
use smallvec::SmallVec;

use crate::cache::Shared;

/// Per-block I/O state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    /// Slot assigned but the image is not valid yet
    Empty,
    /// Image matches the disk
    Clean,
    /// Image is newer than the disk
    Dirty,
    /// A writer thread is pushing the image to disk
    Writing,
    /// The last local read failed; the next get retries
    ReadError,
    /// The last depot read failed; the next get retries
    DepotError,
}

/// How to present an older, consistent image of a block when one of its
/// dependencies has not landed on disk yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollback {
    /// No rollback possible: the dependency must be forced out first
    None,
    /// Restore the old child score at pointer slot `index`
    Pointer {
        /// Pointer slot within the block
        index: usize,
        /// Score the slot held before the update
        old: Score,
    },
    /// Restore the old image of entry `index`
    Entry {
        /// Entry slot within the block
        index: usize,
        /// Packed entry the slot held before the update
        old: [u8; ENTRY_SIZE],
    },
    /// Restore the super-block's old active-root address
    SuperRoot {
        /// Local score of the previous root
        old: Score,
    },
}

/// A dependency edge: this block must not reach disk before `(part,
/// addr)` at version `vers` does
#[derive(Debug, Clone)]
pub(crate) struct Dep {
    pub part: Part,
    pub addr: u32,
    pub vers: u64,
    pub rollback: Rollback,
}

/// A block to retire once the block carrying this record is durable
#[derive(Debug, Clone)]
pub(crate) struct Unlink {
    pub addr: u32,
    pub typ: BlockType,
    pub tag: u32,
    pub epoch: u32,
    pub close_epoch: u32,
    pub recurse: bool,
}

pub(crate) struct SlotInner {
    pub part: Part,
    pub addr: u32,
    /// Content score, for depot-only blocks
    pub remote_score: Option<Score>,
    /// Cached label (data-partition blocks only)
    pub label: Label,
    pub iostate: IoState,
    /// Dirty-version counter; bumped on every mutation
    pub vers: u64,
    /// When the block was last dirtied; orders the flusher
    pub dirty_seq: u64,
    pub data: Vec<u8>,
    /// Blocks that must hit disk before this one
    pub priors: SmallVec<[Dep; 4]>,
    /// Blocks to retire after this one hits disk
    pub unlinks: Vec<Unlink>,
    /// Logical lock flag; spans get..put
    pub locked: bool,
}

pub(crate) struct BlockSlot {
    pub inner: Mutex<SlotInner>,
    /// Signals logical-lock release and I/O completion
    pub ready: Condvar,
}

impl BlockSlot {
    pub fn new(block_size: usize) -> BlockSlot {
        BlockSlot {
            inner: Mutex::new(SlotInner {
                part: Part::Data,
                addr: 0,
                remote_score: None,
                label: Label::free(BlockType::data(0)),
                iostate: IoState::Empty,
                vers: 0,
                dirty_seq: 0,
                data: vec![0u8; block_size],
                priors: SmallVec::new(),
                unlinks: Vec::new(),
                locked: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Take the logical lock, waiting out other holders
    pub fn lock_logical(&self) {
        let mut inner = self.inner.lock();
        while inner.locked {
            self.ready.wait(&mut inner);
        }
        inner.locked = true;
    }

    /// Release the logical lock
    pub fn unlock_logical(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.locked);
        inner.locked = false;
        drop(inner);
        self.ready.notify_all();
    }
}

/// Reference-counted, logically locked handle on a cached block
///
/// Holding a `BlockRef` keeps the slot pinned and excludes other lockers
/// of the same block; dropping it unlocks and makes the slot an eviction
/// candidate once the reference count reaches zero.
pub struct BlockRef<'c> {
    pub(crate) cache: &'c Shared,
    pub(crate) slot: usize,
    pub(crate) mode: Mode,
}

impl<'c> BlockRef<'c> {
    fn inner(&self) -> MutexGuard<'_, SlotInner> {
        self.cache.slots[self.slot].inner.lock()
    }

    /// Partition this block lives in
    pub fn part(&self) -> Part {
        self.inner().part
    }

    /// Address within the partition
    pub fn addr(&self) -> u32 {
        self.inner().addr
    }

    /// Score of this block: the depot score for remote blocks, the local
    /// encoding otherwise
    pub fn score(&self) -> Score {
        let inner = self.inner();
        match inner.remote_score {
            Some(s) => s,
            None => Score::local(inner.addr),
        }
    }

    /// The block's cached label (meaningful for data-partition and
    /// remote blocks)
    pub fn label(&self) -> Label {
        self.inner().label
    }

    /// Current I/O state
    pub fn iostate(&self) -> IoState {
        self.inner().iostate
    }

    pub(crate) fn set_cached_label(&self, label: Label) {
        self.inner().label = label;
    }

    /// Read access to the block image
    pub fn data(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.inner(), |i| i.data.as_mut_slice())
    }

    /// Write access to the block image; callers must `dirty()` afterwards
    pub fn data_mut(&self) -> MappedMutexGuard<'_, [u8]> {
        debug_assert_eq!(self.mode, Mode::ReadWrite);
        MutexGuard::map(self.inner(), |i| i.data.as_mut_slice())
    }

    /// Mark the image newer than the disk and queue it for writing
    pub fn dirty(&self) {
        self.cache.dirty(self);
    }

    /// Force this block (and everything it depends on) to disk
    pub fn write(&self) -> shale_core::Result<()> {
        self.cache.write_block(self)
    }
}

impl std::fmt::Debug for BlockRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        write!(
            f,
            "BlockRef({:?} {} {:?} vers {})",
            inner.part, inner.addr, inner.iostate, inner.vers
        )
    }
}

impl Drop for BlockRef<'_> {
    fn drop(&mut self) {
        self.cache.release(self.slot);
    }
}
