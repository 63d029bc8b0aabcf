//! Label store access, block allocation, and copy-on-write
//!
//! Labels live in the label partition, fourteen bytes per data block,
//! and are read and written through the same buffer pool as everything
//! else. Allocation scans from a rotating hint for a free label (or a
//! closed one past the reclamation watermark), claims it, and ties the
//! new data block to its label block so the label always lands first.

use crate::block::{BlockRef, IoState, Rollback, Unlink};
use crate::cache::{Cache, Fill, Shared};
use shale_core::{BlockType, Error, Label, Mode, Part, Result, LABEL_SIZE};
use std::sync::atomic::Ordering;
use tracing::trace;

impl Shared {
    fn labels_per_block(&self) -> usize {
        self.block_size / LABEL_SIZE
    }

    /// Read the label of data block `addr`
    pub(crate) fn label(&self, addr: u32) -> Result<Label> {
        let lpb = self.labels_per_block();
        let lb = self.get(
            Part::Label,
            addr / lpb as u32,
            Mode::ReadOnly,
            Fill::Read,
        )?;
        let off = (addr as usize % lpb) * LABEL_SIZE;
        let data = lb.data();
        Label::unpack(&data[off..off + LABEL_SIZE])
    }

    /// Write the label of data block `addr`, returning the dirtied label
    /// block so the caller can hang dependencies off it
    pub(crate) fn set_label(&self, addr: u32, label: &Label) -> Result<BlockRef<'_>> {
        let lpb = self.labels_per_block();
        let lb = self.get(
            Part::Label,
            addr / lpb as u32,
            Mode::ReadWrite,
            Fill::Read,
        )?;
        let off = (addr as usize % lpb) * LABEL_SIZE;
        {
            let mut data = lb.data_mut();
            label.pack(&mut data[off..off + LABEL_SIZE]);
        }
        self.dirty(&lb);
        // refresh the cached copy on the data slot, if it is resident
        let sid = {
            let st = self.state.lock();
            st.map.get(&(Part::Data, addr)).copied()
        };
        if let Some(sid) = sid {
            let mut inner = self.slots[sid].inner.lock();
            if inner.part == Part::Data && inner.addr == addr {
                inner.label = *label;
            }
        }
        Ok(lb)
    }

    /// Allocate a fresh `Active(epoch)` data block
    pub(crate) fn alloc_block(
        &self,
        typ: BlockType,
        tag: u32,
        epoch: u32,
    ) -> Result<BlockRef<'_>> {
        let ndata = self.disk.part_size(Part::Data)?;
        let epoch_low = self.epoch_low.load(Ordering::SeqCst);
        let mut hint = self.alloc_hint.lock();
        for i in 0..ndata {
            let addr = (*hint + i) % ndata;
            let l = self.label(addr)?;
            if !l.is_reclaimable(epoch_low) {
                continue;
            }
            // A reclaimable block must not still sit on a write queue.
            let mut claimable = true;
            {
                let mut st = self.state.lock();
                if let Some(&sid) = st.map.get(&(Part::Data, addr)) {
                    match self.slots[sid].inner.try_lock() {
                        Some(inner)
                            if st.refs[sid] == 0
                                && matches!(
                                    inner.iostate,
                                    IoState::Clean | IoState::Empty | IoState::ReadError
                                ) =>
                        {
                            drop(inner);
                            self.evict_slot(&mut st, sid);
                        }
                        _ => claimable = false,
                    }
                }
            }
            if !claimable {
                continue;
            }
            let label = Label::new_active(typ, tag, epoch);
            let label_block_addr = {
                let lb = self.set_label(addr, &label)?;
                lb.addr()
                // lb drops here: holding a label block across a get can
                // deadlock against eviction forcing that same block
            };
            let b = self.get(Part::Data, addr, Mode::ReadWrite, Fill::Zero)?;
            b.set_cached_label(label);
            self.dirty(&b);
            // the label must reach disk before the data block does
            self.dependency_addr(&b, Part::Label, label_block_addr, Rollback::None);
            *hint = (addr + 1) % ndata;
            trace!(addr, ?typ, tag, epoch, "allocated block");
            return Ok(b);
        }
        Err(Error::Full)
    }

    /// Duplicate `b` into a fresh `Active(epoch_high)` block
    ///
    /// Sets the `COPIED` bit on the old block's label (once, data
    /// partition only) and ties the new block to that label write, so a
    /// crash can never observe the copy without the copied mark.
    pub(crate) fn copy_block(
        &self,
        b: &BlockRef<'_>,
        tag: u32,
        epoch_high: u32,
    ) -> Result<BlockRef<'_>> {
        let label = b.label();
        if label.state.is_closed() {
            return Err(Error::InvalidState(format!(
                "copying a closed block ({:?} epoch {} close {})",
                label.state, label.epoch, label.epoch_close
            )));
        }
        if b.part() == Part::Data && label.epoch >= epoch_high {
            return Err(Error::InvalidState(format!(
                "copying a block of the current epoch ({} >= {})",
                label.epoch, epoch_high
            )));
        }
        let bb = self.alloc_block(label.typ, tag, epoch_high)?;
        if b.part() == Part::Data && !label.copied {
            let mut marked = label;
            marked.copied = true;
            let lb = self.set_label(b.addr(), &marked)?;
            b.set_cached_label(marked);
            self.dependency(&bb, &lb, Rollback::None);
        }
        let image = b.data().to_vec();
        bb.data_mut().copy_from_slice(&image);
        self.dirty(&bb);
        trace!(from = b.addr(), to = bb.addr(), epoch_high, "copied block");
        Ok(bb)
    }

    /// Queue `addr` for retirement once `holder` (the block whose new
    /// pointer supersedes it) reaches the disk
    pub(crate) fn queue_unlink(
        &self,
        holder: &BlockRef<'_>,
        addr: u32,
        typ: BlockType,
        tag: u32,
        epoch: u32,
        close_epoch: u32,
        recurse: bool,
    ) {
        // The queue only drains when `holder` completes a clean write,
        // so the caller must dirty it before that write can happen.
        let mut inner = self.slots[holder.slot].inner.lock();
        inner.unlinks.push(Unlink {
            addr,
            typ,
            tag,
            epoch,
            close_epoch,
            recurse,
        });
    }

    /// Drop a clean, unpinned slot from the index (the caller verified
    /// eligibility under the same `state` lock)
    pub(crate) fn evict_slot(&self, st: &mut crate::cache::State, sid: usize) {
        self.unfile(st, sid);
        st.free.push(sid);
    }
}

impl Cache {
    /// Read the label of data block `addr`
    pub fn label(&self, addr: u32) -> Result<Label> {
        self.shared.label(addr)
    }

    /// Write the label of data block `addr`; the label block comes back
    /// dirtied and locked so callers can record dependencies against it
    pub fn set_label(&self, addr: u32, label: &Label) -> Result<BlockRef<'_>> {
        self.shared.set_label(addr, label)
    }

    /// Allocate a fresh `Active(epoch)` data block under `tag`
    pub fn alloc_block(&self, typ: BlockType, tag: u32, epoch: u32) -> Result<BlockRef<'_>> {
        self.shared.alloc_block(typ, tag, epoch)
    }

    /// Copy-on-write duplicate of `b` at `epoch_high`
    pub fn copy_block(
        &self,
        b: &BlockRef<'_>,
        tag: u32,
        epoch_high: u32,
    ) -> Result<BlockRef<'_>> {
        self.shared.copy_block(b, tag, epoch_high)
    }

    /// Queue `addr` for retirement once `holder` reaches the disk
    #[allow(clippy::too_many_arguments)]
    pub fn queue_unlink(
        &self,
        holder: &BlockRef<'_>,
        addr: u32,
        typ: BlockType,
        tag: u32,
        epoch: u32,
        close_epoch: u32,
        recurse: bool,
    ) {
        self.shared
            .queue_unlink(holder, addr, typ, tag, epoch, close_epoch, recurse)
    }
}
