//! Disk write scheduling: rollback, forced dependencies, and the flusher
//!
//! A block with dirty dependencies is never written as-is. Dependencies
//! that carry rollback information are patched to their recorded old
//! values in a private copy of the image, so the disk always sees a tree
//! consistent with what has already landed. Dependencies without rollback
//! information (label blocks) are forced out first; they never have
//! dependencies of their own, so the recursion is one level deep.
//!
//! Local write errors are retried with backoff indefinitely: the storage
//! is assumed to be durable or to eventually recover.

use crate::block::{BlockRef, IoState, Rollback, Unlink};
use crate::cache::{Fill, Shared};
use shale_core::{Error, Mode, Part, Result, Score, ENTRY_SIZE, NIL_ADDR, SCORE_SIZE};
use shale_disk::{Super, SUPER_SIZE};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Rollback target location, for first-pending-wins selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollLoc {
    Pointer(usize),
    Entry(usize),
    Super,
}

impl RollLoc {
    fn of(r: &Rollback) -> Option<RollLoc> {
        match r {
            Rollback::None => None,
            Rollback::Pointer { index, .. } => Some(RollLoc::Pointer(*index)),
            Rollback::Entry { index, .. } => Some(RollLoc::Entry(*index)),
            Rollback::SuperRoot { .. } => Some(RollLoc::Super),
        }
    }
}

impl Shared {
    /// Force one block (and whatever it depends on) to disk. The caller
    /// holds the logical lock; it is released around the disk I/O so
    /// readers and writers of the block may proceed, and reacquired
    /// before returning.
    pub(crate) fn write_block(&self, r: &BlockRef<'_>) -> Result<()> {
        self.write_locked(r.slot)?;
        Ok(())
    }

    /// Lock a slot and write it; used by the flusher and by eviction
    pub(crate) fn flush_slot(&self, id: usize) -> Result<()> {
        self.slots[id].lock_logical();
        let res = self.write_locked(id);
        self.slots[id].unlock_logical();
        res
    }

    fn write_locked(&self, id: usize) -> Result<()> {
        // Snapshot the image and its dependency list.
        let (vers0, part, addr, mut buf, deps) = {
            let mut inner = self.slots[id].inner.lock();
            while inner.iostate == IoState::Writing {
                // a previous writer released the logical lock mid-I/O
                self.slots[id].ready.wait(&mut inner);
            }
            if inner.iostate != IoState::Dirty {
                return Ok(());
            }
            (
                inner.vers,
                inner.part,
                inner.addr,
                inner.data.clone(),
                inner.priors.clone(),
            )
        };

        // Resolve dependencies: roll back what we can, force the rest.
        // Rollbacks for one location are recorded oldest first; only the
        // earliest still-pending one may be applied, since each later
        // `old` value is itself a block that has not necessarily landed.
        let mut rolled_back = false;
        let mut rolled_locations: Vec<RollLoc> = Vec::new();
        for dep in &deps {
            if let Some(loc) = RollLoc::of(&dep.rollback) {
                if rolled_locations.contains(&loc) {
                    continue;
                }
                if self.dep_pending(dep.part, dep.addr) {
                    rolled_locations.push(loc);
                }
            }
            if !self.dep_pending(dep.part, dep.addr) {
                continue;
            }
            match &dep.rollback {
                Rollback::None => {
                    let sid = {
                        let st = self.state.lock();
                        st.map.get(&(dep.part, dep.addr)).copied()
                    };
                    if let Some(sid) = sid {
                        self.flush_slot(sid)?;
                    }
                    if self.dep_pending(dep.part, dep.addr) {
                        error!(
                            ?part, addr,
                            dep_part = ?dep.part, dep_addr = dep.addr,
                            "dependency would not settle; write-order invariant broken"
                        );
                        return Err(Error::InvalidState(
                            "unresolvable write dependency".into(),
                        ));
                    }
                }
                Rollback::Pointer { index, old } => {
                    old.write_to(&mut buf, index * SCORE_SIZE);
                    rolled_back = true;
                }
                Rollback::Entry { index, old } => {
                    buf[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE].copy_from_slice(old);
                    rolled_back = true;
                }
                Rollback::SuperRoot { old } => {
                    if let Ok(mut sup) = Super::unpack(&buf[..SUPER_SIZE]) {
                        sup.active = old.to_local().unwrap_or(NIL_ADDR);
                        sup.pack(&mut buf[..SUPER_SIZE]);
                        rolled_back = true;
                    }
                }
            }
        }

        // Release the block for the duration of the I/O.
        self.slots[id].inner.lock().iostate = IoState::Writing;
        self.slots[id].unlock_logical();
        trace!(?part, addr, rolled_back, "writing block");
        loop {
            match self.disk.write(part, addr, &buf) {
                Ok(()) => break,
                Err(e) => {
                    warn!(?part, addr, %e, "block write failed; retrying");
                    std::thread::sleep(self.tuning.write_retry.min(Duration::from_secs(600)));
                }
            }
        }

        // Finalize, then hand the logical lock back to the caller.
        let unlinks: Vec<Unlink> = {
            let mut st = self.state.lock();
            let mut inner = self.slots[id].inner.lock();
            debug_assert_eq!(inner.iostate, IoState::Writing);
            if !rolled_back && inner.vers == vers0 {
                inner.iostate = IoState::Clean;
                st.dirty = st.dirty.saturating_sub(1);
                inner.priors.clear();
                std::mem::take(&mut inner.unlinks)
            } else {
                // the disk holds a consistent older image; stay dirty
                inner.iostate = IoState::Dirty;
                Vec::new()
            }
        };
        self.slots[id].ready.notify_all();
        self.avail.notify_all();
        for u in unlinks {
            self.do_unlink(&u);
        }
        self.slots[id].lock_logical();
        Ok(())
    }

    /// Is the dependency target still waiting to reach the disk?
    fn dep_pending(&self, part: Part, addr: u32) -> bool {
        let sid = {
            let st = self.state.lock();
            st.map.get(&(part, addr)).copied()
        };
        let Some(sid) = sid else {
            // evicted blocks are clean by construction
            return false;
        };
        let inner = self.slots[sid].inner.lock();
        inner.part == part
            && inner.addr == addr
            && matches!(inner.iostate, IoState::Dirty | IoState::Writing)
    }

    /// Write dirty blocks, oldest-dirtied first
    ///
    /// Level 0 stops once the dirty share is back under
    /// `dirty_percentage` (writing at most `flush_size` blocks); level 1
    /// drains the cache completely.
    pub(crate) fn flush(&self, level: usize) -> Result<()> {
        let threshold = if level == 0 {
            self.tuning.dirty_percentage * self.slots.len() / 100
        } else {
            0
        };
        let mut passes = 0usize;
        loop {
            let mut targets: Vec<(u64, usize)> = Vec::new();
            for (id, slot) in self.slots.iter().enumerate() {
                let inner = slot.inner.lock();
                if inner.iostate == IoState::Dirty {
                    targets.push((inner.dirty_seq, id));
                }
            }
            if targets.len() <= threshold || targets.is_empty() {
                return Ok(());
            }
            targets.sort_unstable();
            let mut written = 0usize;
            for &(_, id) in &targets {
                self.flush_slot(id)?;
                written += 1;
                if level == 0
                    && (written >= self.tuning.flush_size
                        || self.state.lock().dirty <= threshold)
                {
                    return Ok(());
                }
            }
            if level == 0 {
                return Ok(());
            }
            passes += 1;
            if passes > 1024 {
                return Err(Error::InvalidState(
                    "cache flush is not converging".into(),
                ));
            }
        }
    }

    /// Flusher thread body: wake on demand or once a second, shed dirty
    /// blocks down to the configured share
    pub(crate) fn flush_loop(&self) {
        debug!("flusher up");
        loop {
            {
                let mut st = self.state.lock();
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let _ = self.flush_cv.wait_for(&mut st, Duration::from_secs(1));
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let over =
                    st.dirty * 100 > self.tuning.dirty_percentage * self.slots.len();
                if !over {
                    continue;
                }
            }
            if let Err(e) = self.flush(0) {
                error!(%e, "flusher pass failed");
            }
        }
        debug!("flusher down");
    }

    /// Retire a block (and, for pointer blocks, its subtree) once the
    /// record naming it is durable
    pub(crate) fn do_unlink(&self, u: &Unlink) {
        let epoch_low = self.epoch_low.load(Ordering::SeqCst);
        let mut label = match self.label(u.addr) {
            Ok(l) => l,
            Err(e) => {
                warn!(addr = u.addr, %e, "unlink: cannot read label");
                return;
            }
        };
        // Stale queue entries are normal: the block may already have been
        // retired and even reused by the time its unlink record lands.
        if !label.state.is_allocated()
            || label.state.is_closed()
            || label.tag != u.tag
            || label.epoch != u.epoch
        {
            return;
        }
        if u.recurse && u.typ.level > 0 {
            let children = self.collect_children(u);
            for child in children {
                self.do_unlink(&child);
            }
        }
        label.close(u.close_epoch, epoch_low);
        trace!(addr = u.addr, state = ?label.state, "unlinked block");
        if let Err(e) = self.set_label(u.addr, &label) {
            warn!(addr = u.addr, %e, "unlink: cannot update label");
        }
    }

    fn collect_children(&self, u: &Unlink) -> Vec<Unlink> {
        let Some(child_typ) = u.typ.child() else {
            return Vec::new();
        };
        let b = match self.get(Part::Data, u.addr, Mode::ReadOnly, Fill::Read) {
            Ok(b) => b,
            Err(e) => {
                warn!(addr = u.addr, %e, "unlink: cannot read pointer block");
                return Vec::new();
            }
        };
        let addrs: Vec<u32> = {
            let data = b.data();
            (0..self.block_size / SCORE_SIZE)
                .filter_map(|i| {
                    let s = Score::read_from(&data, i * SCORE_SIZE);
                    // a zero score is an empty slot, not local block 0
                    if s == Score::ZERO {
                        None
                    } else {
                        s.to_local()
                    }
                })
                .filter(|&a| a != NIL_ADDR)
                .collect()
        };
        let mut out = Vec::new();
        for addr in addrs {
            if let Ok(cl) = self.label(addr) {
                if cl.tag == u.tag && cl.state.is_allocated() && !cl.state.is_closed() {
                    out.push(Unlink {
                        addr,
                        typ: child_typ,
                        tag: u.tag,
                        epoch: cl.epoch,
                        close_epoch: u.close_epoch,
                        recurse: true,
                    });
                }
            }
        }
        out
    }
}
