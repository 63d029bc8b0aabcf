//! Labels and the block state machine
//!
//! Every data-partition block has a 14-byte label stored in the label
//! partition at the same index. The label carries the block's type, its
//! lifecycle state, the tag of the source it belongs to, and the two
//! epochs that pin the state in time: `epoch` (birth) and `epoch_close`
//! (retirement from the active tree; 0 while still reachable).
//!
//! # State machine
//!
//! In memory a state is a tagged variant over role x storage status:
//! role in {Active, Snap, Zombie}, status in {local-only, Ro, A}, plus
//! Free and Bad. On disk the state is bit-encoded (`bits` module) and the
//! `*Ro` refinements are volatile: they exist only while the archiver has
//! fixed a block's pointers and are re-derived after a crash.
//!
//! Mutator at high epoch h wanting to modify a block:
//!
//! | current | condition | action |
//! |---|---|---|
//! | depot-only      | -      | allocate new Active(h), copy contents |
//! | Active(x)       | x == h | mutate in place |
//! | Active(x)       | x < h  | copy; the old block closes when the new pointer lands |
//! | ActiveRo(x)     | any    | copy |
//! | ActiveA(x)      | any    | copy; the archived copy stays valid |
//! | Snap* / Zombie  | -      | forbidden, corruption bug |

use crate::error::{Error, Result};
use crate::types::BlockType;
use byteorder::{BigEndian, ByteOrder};

/// Size of one packed label in bytes
pub const LABEL_SIZE: usize = 14;

/// On-disk state byte encoding
pub mod bits {
    /// Block is in use
    pub const ALLOC: u8 = 1 << 0;
    /// A newer copy of this block exists
    pub const COPIED: u8 = 1 << 1;
    /// Block contents are stored in the depot
    pub const ARCHIVED: u8 = 1 << 2;
    /// Block has been unlinked from the active tree
    pub const CLOSED: u8 = 1 << 3;
    /// All meaningful state bits
    pub const MASK: u8 = ALLOC | COPIED | ARCHIVED | CLOSED;
    /// Available for allocation
    pub const FREE: u8 = 0;
    /// Something is wrong with this block
    pub const BAD: u8 = 0xff;
}

/// Per-block lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Available for allocation
    Free,
    /// Reachable from the active tree, mutable at its birth epoch
    Active,
    /// Active, pointers fixed to depot scores, store pending
    ActiveRo,
    /// Active and present in the depot
    ActiveA,
    /// Reachable only from frozen snapshots
    Snap,
    /// Snap, pointers fixed, store pending
    SnapRo,
    /// Snap and present in the depot
    SnapA,
    /// Closed with `epoch_close <= epoch_low`; local storage reclaimable
    Zombie,
    /// Label failed validation
    Bad,
}

impl BlockState {
    /// Encode to state bits (without the orthogonal `COPIED` bit)
    ///
    /// The `*Ro` refinements persist as their base state, and `Zombie`
    /// as `Snap`: both distinctions are re-derived from epochs after a
    /// crash.
    pub fn to_bits(self) -> u8 {
        match self {
            BlockState::Free => bits::FREE,
            BlockState::Active | BlockState::ActiveRo => bits::ALLOC,
            BlockState::ActiveA => bits::ALLOC | bits::ARCHIVED,
            BlockState::Snap | BlockState::SnapRo | BlockState::Zombie => {
                bits::ALLOC | bits::CLOSED
            }
            BlockState::SnapA => bits::ALLOC | bits::CLOSED | bits::ARCHIVED,
            BlockState::Bad => bits::BAD,
        }
    }

    /// Decode state bits into `(state, copied)`
    pub fn from_bits(b: u8) -> (BlockState, bool) {
        if b == bits::BAD {
            return (BlockState::Bad, false);
        }
        let copied = b & bits::COPIED != 0;
        let state = match b & !bits::COPIED {
            bits::FREE => BlockState::Free,
            x if x == bits::ALLOC => BlockState::Active,
            x if x == bits::ALLOC | bits::ARCHIVED => BlockState::ActiveA,
            x if x == bits::ALLOC | bits::CLOSED => BlockState::Snap,
            x if x == bits::ALLOC | bits::CLOSED | bits::ARCHIVED => BlockState::SnapA,
            _ => BlockState::Bad,
        };
        (state, copied)
    }

    /// True for any allocated (non-Free, non-Bad) state
    pub fn is_allocated(self) -> bool {
        !matches!(self, BlockState::Free | BlockState::Bad)
    }

    /// True for states unlinked from the active tree
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            BlockState::Snap | BlockState::SnapRo | BlockState::SnapA | BlockState::Zombie
        )
    }

    /// True once the block's contents are in the depot
    pub fn is_archived(self) -> bool {
        matches!(self, BlockState::ActiveA | BlockState::SnapA)
    }

    /// Archiver transition: pointers are now all depot scores
    pub fn fixed(self) -> Result<BlockState> {
        match self {
            BlockState::Active => Ok(BlockState::ActiveRo),
            BlockState::Snap => Ok(BlockState::SnapRo),
            BlockState::ActiveRo
            | BlockState::ActiveA
            | BlockState::SnapRo
            | BlockState::SnapA => Ok(self),
            BlockState::Free | BlockState::Zombie | BlockState::Bad => Err(
                Error::InvalidState(format!("cannot fix pointers of a {self:?} block")),
            ),
        }
    }

    /// Archiver transition: the depot acknowledged the block's score
    pub fn archived(self) -> Result<BlockState> {
        match self {
            BlockState::Active | BlockState::ActiveRo | BlockState::ActiveA => {
                Ok(BlockState::ActiveA)
            }
            BlockState::Snap | BlockState::SnapRo | BlockState::SnapA => Ok(BlockState::SnapA),
            BlockState::Free | BlockState::Zombie | BlockState::Bad => Err(Error::InvalidState(
                format!("cannot archive a {self:?} block"),
            )),
        }
    }
}

/// What a mutator must do before modifying a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowAction {
    /// The block is already writable at the current epoch
    InPlace,
    /// Duplicate first; the parent pointer moves to the copy
    Copy,
}

/// Per-block metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    /// Block type (data/dir and level)
    pub typ: BlockType,
    /// Lifecycle state
    pub state: BlockState,
    /// A newer copy of this block exists
    pub copied: bool,
    /// Source the block belongs to
    pub tag: u32,
    /// Epoch the block was created at
    pub epoch: u32,
    /// Epoch at which the block left the active tree; 0 if still reachable
    pub epoch_close: u32,
}

impl Label {
    /// Label of a freshly allocated block
    pub fn new_active(typ: BlockType, tag: u32, epoch: u32) -> Label {
        Label {
            typ,
            state: BlockState::Active,
            copied: false,
            tag,
            epoch,
            epoch_close: 0,
        }
    }

    /// Label of a free block slot
    pub fn free(typ: BlockType) -> Label {
        Label {
            typ,
            state: BlockState::Free,
            copied: false,
            tag: 0,
            epoch: 0,
            epoch_close: 0,
        }
    }

    /// Pack into `buf[..LABEL_SIZE]`, big-endian
    pub fn pack(&self, buf: &mut [u8]) {
        buf[0] = self.typ.to_byte();
        buf[1] = if self.state == BlockState::Bad {
            bits::BAD
        } else {
            self.state.to_bits() | if self.copied { bits::COPIED } else { 0 }
        };
        BigEndian::write_u32(&mut buf[2..6], self.tag);
        BigEndian::write_u32(&mut buf[6..10], self.epoch);
        BigEndian::write_u32(&mut buf[10..14], self.epoch_close);
    }

    /// Unpack from `buf[..LABEL_SIZE]`
    pub fn unpack(buf: &[u8]) -> Result<Label> {
        let (state, copied) = BlockState::from_bits(buf[1]);
        let typ = match state {
            // A bad label's type byte is not trustworthy.
            BlockState::Bad => BlockType::data(0),
            _ => BlockType::from_byte(buf[0])?,
        };
        Ok(Label {
            typ,
            state,
            copied,
            tag: BigEndian::read_u32(&buf[2..6]),
            epoch: BigEndian::read_u32(&buf[6..10]),
            epoch_close: BigEndian::read_u32(&buf[10..14]),
        })
    }

    /// State with the `Zombie` reclassification applied
    pub fn state_at(&self, epoch_low: u32) -> BlockState {
        if self.state.is_closed() && self.epoch_close != 0 && self.epoch_close <= epoch_low {
            BlockState::Zombie
        } else {
            self.state
        }
    }

    /// True if this block's local storage can be reused
    pub fn is_reclaimable(&self, epoch_low: u32) -> bool {
        match self.state {
            BlockState::Free => true,
            _ => self.state_at(epoch_low) == BlockState::Zombie,
        }
    }

    /// Decide the copy-on-write action for a mutator at high epoch `h`
    pub fn mutate_action(&self, h: u32) -> Result<CowAction> {
        match self.state {
            BlockState::Active if self.epoch == h => Ok(CowAction::InPlace),
            BlockState::Active if self.epoch < h => Ok(CowAction::Copy),
            BlockState::Active => Err(Error::InvalidState(format!(
                "active block from future epoch {} > {}",
                self.epoch, h
            ))),
            BlockState::ActiveRo | BlockState::ActiveA => Ok(CowAction::Copy),
            BlockState::Free
            | BlockState::Snap
            | BlockState::SnapRo
            | BlockState::SnapA
            | BlockState::Zombie
            | BlockState::Bad => Err(Error::InvalidState(format!(
                "mutating a {:?} block (epoch {}, close {})",
                self.state, self.epoch, self.epoch_close
            ))),
        }
    }

    /// Retire this block from the active tree at high epoch `h`.
    ///
    /// A block born at `h` was never visible in a snapshot and returns to
    /// `Free` immediately; otherwise it closes with `epoch_close = h`,
    /// which keeps `epoch_close > epoch`. A closed block whose
    /// `epoch_close` is at or below `epoch_low` frees as well.
    pub fn close(&mut self, h: u32, epoch_low: u32) {
        if self.epoch == h {
            *self = Label::free(self.typ);
            return;
        }
        self.state = match self.state {
            BlockState::ActiveA | BlockState::SnapA => BlockState::SnapA,
            _ => BlockState::Snap,
        };
        self.epoch_close = h;
        if self.epoch_close <= epoch_low {
            *self = Label::free(self.typ);
        }
    }
}
