//! Sources: growable typed byte streams over block trees
//!
//! A source is rooted at an [`Entry`] in its parent's data stream and
//! realized as a balanced tree of blocks of fixed depth: level-0 leaves
//! hold raw bytes (data sources) or packed entries (directory sources),
//! higher levels hold child scores. Reads of unallocated regions yield
//! zeros; writes allocate missing blocks along the path and trigger the
//! copy-on-write state machine for any block older than the file
//! system's high epoch.
//!
//! A read-write source whose epoch lags the high epoch is re-walked
//! lazily, parent chain first, before any mutation; that re-walk is also
//! what the snapshot protocol runs over every open source after bumping
//! the epoch, so blocks newly shared with a snapshot keep at most one
//! parent per epoch.

use crate::fs::FsCore;
use parking_lot::Mutex;
use shale_cache::{BlockRef, Rollback};
use shale_core::{
    BlockType, CowAction, Entry, Error, Mode, Part, Result, Score, ENTRY_ACTIVE, ENTRY_DIR,
    ENTRY_LOCAL, ENTRY_SIZE, NIL_ADDR, ROOT_TAG, SCORE_SIZE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Mutable per-source bookkeeping: where the entry lives and how fresh
/// this source is relative to the epoch
struct SourceState {
    /// Epoch the source was last walked writable at
    epoch: u32,
    /// Score of the block holding this source's entry
    score: Score,
    /// Epoch of that block
    score_epoch: u32,
}

/// A logical byte stream rooted at an entry
pub struct Source {
    core: Arc<FsCore>,
    parent: Option<Arc<Source>>,
    mode: Mode,
    gen: u32,
    dir: bool,
    dsize: usize,
    psize: usize,
    /// Entry index within the parent stream
    offset: usize,
    /// Tag on the blocks holding this source's entry
    ptag: u32,
    /// Entries per block in the parent
    epb: usize,
    state: Mutex<SourceState>,
    defunct: AtomicBool,
}

impl Source {
    /// Open the root source from the root block at `addr`
    pub(crate) fn root(
        core: &Arc<FsCore>,
        addr: u32,
        mode: Mode,
        epoch_high: u32,
    ) -> Result<Arc<Source>> {
        let b = core
            .cache
            .local(addr, Some(BlockType::dir(0)), ROOT_TAG, Mode::ReadOnly, 0)?;
        let l = b.label();
        if mode == Mode::ReadWrite && (l.state.is_closed() || l.epoch != epoch_high) {
            // the root needs a copy-on-write before it is usable
            return Err(Error::BadRoot);
        }
        let e = Entry::unpack(&b.data(), 0)?;
        if !e.is_active() || !e.is_dir() {
            return Err(Error::BadRoot);
        }
        let src = Arc::new(Source {
            core: Arc::clone(core),
            parent: None,
            mode,
            gen: e.gen,
            dir: true,
            dsize: e.dsize as usize,
            psize: e.psize as usize,
            offset: 0,
            ptag: ROOT_TAG,
            epb: core.cache.block_size() / ENTRY_SIZE,
            state: Mutex::new(SourceState {
                epoch: l.epoch,
                score: b.score(),
                score_epoch: l.epoch,
            }),
            defunct: AtomicBool::new(false),
        });
        core.register_source(&src);
        Ok(src)
    }

    /// True for directory sources
    pub fn is_dir(&self) -> bool {
        self.dir
    }

    /// The source's access mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Entry index in the parent
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// This source's entry, as currently stored
    pub fn entry(&self) -> Result<Entry> {
        let _elk = self.core.elk.read();
        self.entry_locked()
    }

    /// Logical stream size in bytes
    pub fn size(&self) -> Result<u64> {
        Ok(self.entry()?.size)
    }

    /// Read up to `buf.len()` bytes at `offset`; holes read as zeros
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _elk = self.core.elk.read();
        self.read_locked(offset, buf)
    }

    /// Write `data` at `offset`, extending the stream as needed
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let elk = self.core.elk.read();
        let h = elk.high;
        self.write_locked(offset, data, h)
    }

    /// Set the logical size; growth exposes zeros, shrink only trims the
    /// recorded length
    pub fn set_size(&self, size: u64) -> Result<()> {
        let elk = self.core.elk.read();
        let h = elk.high;
        self.update_size(h, size)
    }

    /// Open the child source at entry `offset`
    ///
    /// Entries marked as belonging to a snapshot open read-only at the
    /// recorded epoch regardless of `mode`.
    pub fn open(self: &Arc<Self>, offset: usize, mode: Mode) -> Result<Arc<Source>> {
        let _elk = self.core.elk.read();
        self.open_locked(offset, mode)
    }

    /// Create a child source in the first inactive entry slot
    pub fn create(self: &Arc<Self>, dir: bool) -> Result<Arc<Source>> {
        let elk = self.core.elk.read();
        let h = elk.high;
        self.create_locked(dir, h)
    }

    /// Remove this source: deactivate its entry and retire its tree once
    /// the entry update is durable
    pub fn remove(&self) -> Result<()> {
        let elk = self.core.elk.read();
        let h = elk.high;
        self.remove_locked(h)
    }

    fn check_alive(&self) -> Result<()> {
        if self.defunct.load(Ordering::SeqCst) {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn tree_type(&self, level: u8) -> BlockType {
        BlockType {
            dir: self.dir,
            level,
        }
    }

    fn pointers_per_block(&self) -> u128 {
        (self.psize / SCORE_SIZE) as u128
    }

    fn coverage(&self, depth: u8) -> u128 {
        self.pointers_per_block().saturating_pow(depth as u32)
    }

    /// Fetch a tree block by score: local scores through the label-
    /// checked path, depot scores read-only
    fn fetch(&self, score: Score, typ: BlockType, tag: u32, mode: Mode) -> Result<BlockRef<'_>> {
        match score.to_local() {
            Some(NIL_ADDR) => Err(Error::NotFound),
            Some(addr) => self.core.cache.local(addr, Some(typ), tag, mode, 0),
            None => self.core.cache.global(score, typ, tag, Mode::ReadOnly),
        }
    }

    /// Make `b` writable at epoch `h`, copying if the state machine says
    /// so; returns the writable block plus the replaced local block's
    /// `(addr, epoch)` when a local copy took place
    fn cow_for_write<'s>(
        &'s self,
        b: BlockRef<'s>,
        tag: u32,
        h: u32,
    ) -> Result<(BlockRef<'s>, Option<(u32, u32)>)> {
        if b.part() == Part::Remote {
            let bb = self.core.cache.copy_block(&b, tag, h)?;
            return Ok((bb, None));
        }
        match b.label().mutate_action(h)? {
            CowAction::InPlace => Ok((b, None)),
            CowAction::Copy => {
                let old = (b.addr(), b.label().epoch);
                let bb = self.core.cache.copy_block(&b, tag, h)?;
                Ok((bb, Some(old)))
            }
        }
    }

    /// Locate the block holding this source's entry, read-only
    fn entry_ro(&self) -> Result<(BlockRef<'_>, usize)> {
        self.check_alive()?;
        match &self.parent {
            None => {
                let score = self.state.lock().score;
                let b = self.fetch(score, BlockType::dir(0), self.ptag, Mode::ReadOnly)?;
                Ok((b, 0))
            }
            Some(p) => {
                let bn = (self.offset / self.epb) as u64;
                let b = p.block_ro(bn)?.ok_or(Error::NotFound)?;
                Ok((b, self.offset % self.epb))
            }
        }
    }

    /// Locate the block holding this source's entry, writable at `h`;
    /// the walk copies the whole path from the root as needed
    fn entry_rw(&self, h: u32) -> Result<(BlockRef<'_>, usize)> {
        self.check_alive()?;
        if self.mode != Mode::ReadWrite {
            return Err(Error::BadMode);
        }
        match &self.parent {
            None => {
                let score = self.state.lock().score;
                let addr = match score.to_local() {
                    Some(a) if a != NIL_ADDR => a,
                    _ => return Err(Error::BadRoot),
                };
                let b = self.core.cache.local(
                    addr,
                    Some(BlockType::dir(0)),
                    self.ptag,
                    Mode::ReadWrite,
                    0,
                )?;
                let l = b.label();
                if l.state.is_closed() || l.epoch != h {
                    return Err(Error::BadRoot);
                }
                Ok((b, 0))
            }
            Some(p) => {
                let bn = (self.offset / self.epb) as u64;
                let b = p.block_rw(bn, h)?;
                let mut st = self.state.lock();
                st.score = b.score();
                st.epoch = h;
                st.score_epoch = h;
                drop(st);
                Ok((b, self.offset % self.epb))
            }
        }
    }

    fn entry_image(eb: &BlockRef<'_>, slot: usize) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        let data = eb.data();
        out.copy_from_slice(&data[slot * ENTRY_SIZE..(slot + 1) * ENTRY_SIZE]);
        out
    }

    fn unpack_entry(&self, eb: &BlockRef<'_>, slot: usize) -> Result<Entry> {
        let e = {
            let data = eb.data();
            Entry::unpack(&data, slot * ENTRY_SIZE)?
        };
        if !e.is_active() || e.gen != self.gen {
            return Err(Error::NotFound);
        }
        Ok(e)
    }

    pub(crate) fn entry_locked(&self) -> Result<Entry> {
        let (eb, slot) = self.entry_ro()?;
        self.unpack_entry(&eb, slot)
    }

    /// Score of the block holding this source's entry
    pub(crate) fn root_score(&self) -> Score {
        self.state.lock().score
    }

    /// Walk to data block `bn`, read-only; `None` means a hole
    fn block_ro(&self, bn: u64) -> Result<Option<BlockRef<'_>>> {
        let (eb, slot) = self.entry_ro()?;
        let e = self.unpack_entry(&eb, slot)?;
        drop(eb);
        if e.score == Score::ZERO || bn as u128 >= self.coverage(e.depth) {
            return Ok(None);
        }
        let ppb = self.pointers_per_block();
        let mut cur = self.fetch(e.score, self.tree_type(e.depth), e.tag, Mode::ReadOnly)?;
        for lvl in (1..=e.depth).rev() {
            let idx = ((bn as u128 / ppb.pow(lvl as u32 - 1)) % ppb) as usize;
            let s = {
                let data = cur.data();
                Score::read_from(&data, idx * SCORE_SIZE)
            };
            if s == Score::ZERO {
                return Ok(None);
            }
            let next = self.fetch(s, self.tree_type(lvl - 1), e.tag, Mode::ReadOnly)?;
            cur = next;
        }
        Ok(Some(cur))
    }

    /// Walk to data block `bn`, writable at epoch `h`, allocating and
    /// copying along the path as needed
    fn block_rw(&self, bn: u64, h: u32) -> Result<BlockRef<'_>> {
        let cache = &self.core.cache;
        let (eb, slot) = self.entry_rw(h)?;
        let old_image = Self::entry_image(&eb, slot);
        let mut e = self.unpack_entry(&eb, slot)?;
        let ppb = self.pointers_per_block();
        let mut entry_changed = false;

        // An archived tree carries no tag; mutation brings it back local
        // under a fresh one.
        if e.tag == 0 {
            e.tag = self.core.next_tag();
            entry_changed = true;
        }

        // Raise the tree until bn is addressable.
        while self.coverage(e.depth) <= bn as u128 {
            if e.depth >= shale_core::types::MAX_LEVEL {
                return Err(Error::InvalidState(format!(
                    "source cannot reach block {bn} at max depth"
                )));
            }
            let nb = cache.alloc_block(self.tree_type(e.depth + 1), e.tag, h)?;
            if e.score != Score::ZERO {
                {
                    let mut d = nb.data_mut();
                    e.score.write_to(&mut d, 0);
                }
                nb.dirty();
            }
            cache.dependency(
                &eb,
                &nb,
                Rollback::Entry {
                    index: slot,
                    old: old_image,
                },
            );
            e.depth += 1;
            e.score = nb.score();
            entry_changed = true;
            trace!(depth = e.depth, tag = e.tag, "source grew");
        }

        // Materialize the tree root, or make it writable at h.
        let mut cur = if e.score == Score::ZERO {
            let nb = cache.alloc_block(self.tree_type(e.depth), e.tag, h)?;
            cache.dependency(
                &eb,
                &nb,
                Rollback::Entry {
                    index: slot,
                    old: old_image,
                },
            );
            e.score = nb.score();
            entry_changed = true;
            nb
        } else {
            let prev = e.score;
            let b = self.fetch(prev, self.tree_type(e.depth), e.tag, Mode::ReadWrite)?;
            let (w, replaced) = self.cow_for_write(b, e.tag, h)?;
            if w.score() != prev {
                cache.dependency(
                    &eb,
                    &w,
                    Rollback::Entry {
                        index: slot,
                        old: old_image,
                    },
                );
                if let Some((old_addr, old_epoch)) = replaced {
                    cache.queue_unlink(
                        &eb,
                        old_addr,
                        self.tree_type(e.depth),
                        e.tag,
                        old_epoch,
                        h,
                        false,
                    );
                }
                e.score = w.score();
                entry_changed = true;
            }
            w
        };
        if entry_changed {
            if e.score.to_local().is_some() {
                e.flags |= ENTRY_LOCAL;
            }
            {
                let mut d = eb.data_mut();
                e.pack(&mut d, slot * ENTRY_SIZE);
            }
            eb.dirty();
        }
        drop(eb);

        // Descend, allocating and copying as we go.
        for lvl in (1..=e.depth).rev() {
            let idx = ((bn as u128 / ppb.pow(lvl as u32 - 1)) % ppb) as usize;
            let child_typ = self.tree_type(lvl - 1);
            let s = {
                let data = cur.data();
                Score::read_from(&data, idx * SCORE_SIZE)
            };
            let child = if s == Score::ZERO {
                let nb = cache.alloc_block(child_typ, e.tag, h)?;
                {
                    let mut d = cur.data_mut();
                    nb.score().write_to(&mut d, idx * SCORE_SIZE);
                }
                cur.dirty();
                cache.dependency(&cur, &nb, Rollback::Pointer { index: idx, old: s });
                nb
            } else {
                let b = self.fetch(s, child_typ, e.tag, Mode::ReadWrite)?;
                let (w, replaced) = self.cow_for_write(b, e.tag, h)?;
                if w.score() != s {
                    {
                        let mut d = cur.data_mut();
                        w.score().write_to(&mut d, idx * SCORE_SIZE);
                    }
                    cur.dirty();
                    cache.dependency(&cur, &w, Rollback::Pointer { index: idx, old: s });
                    if let Some((old_addr, old_epoch)) = replaced {
                        cache.queue_unlink(&cur, old_addr, child_typ, e.tag, old_epoch, h, false);
                    }
                }
                w
            };
            cur = child;
        }
        Ok(cur)
    }

    fn read_locked(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.entry_locked()?.size;
        if offset >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - offset) as usize;
        let dsize = self.dsize as u64;
        let mut done = 0usize;
        while done < want {
            let pos = offset + done as u64;
            let bn = pos / dsize;
            let boff = (pos % dsize) as usize;
            let m = (self.dsize - boff).min(want - done);
            match self.block_ro(bn)? {
                Some(b) => {
                    let data = b.data();
                    buf[done..done + m].copy_from_slice(&data[boff..boff + m]);
                }
                None => buf[done..done + m].fill(0),
            }
            done += m;
        }
        Ok(done)
    }

    fn write_locked(&self, offset: u64, data: &[u8], h: u32) -> Result<usize> {
        if self.dir {
            return Err(Error::InvalidState(
                "raw writes into a directory source".into(),
            ));
        }
        let dsize = self.dsize as u64;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let bn = pos / dsize;
            let boff = (pos % dsize) as usize;
            let m = (self.dsize - boff).min(data.len() - done);
            let b = self.block_rw(bn, h)?;
            {
                let mut d = b.data_mut();
                d[boff..boff + m].copy_from_slice(&data[done..done + m]);
            }
            b.dirty();
            done += m;
        }
        let end = offset + data.len() as u64;
        if end > self.entry_locked()?.size {
            self.update_size(h, end)?;
        }
        Ok(done)
    }

    fn update_size(&self, h: u32, size: u64) -> Result<()> {
        let (eb, slot) = self.entry_rw(h)?;
        let mut e = self.unpack_entry(&eb, slot)?;
        e.size = size;
        {
            let mut d = eb.data_mut();
            e.pack(&mut d, slot * ENTRY_SIZE);
        }
        eb.dirty();
        Ok(())
    }

    fn open_locked(self: &Arc<Self>, offset: usize, mode: Mode) -> Result<Arc<Source>> {
        if !self.dir {
            return Err(Error::InvalidState("open inside a data source".into()));
        }
        if mode == Mode::ReadWrite && self.mode != Mode::ReadWrite {
            return Err(Error::BadMode);
        }
        // read our own entry first: taking it while holding one of our
        // tree blocks would invert the parent-before-child lock order
        let ptag = self.entry_locked()?.tag;
        let child_epb = self.dsize / ENTRY_SIZE;
        let bn = (offset / child_epb) as u64;
        let b = self.block_ro(bn)?.ok_or(Error::NotFound)?;
        let slot = offset % child_epb;
        let e = {
            let data = b.data();
            Entry::unpack(&data, slot * ENTRY_SIZE)?
        };
        if !e.is_active() {
            return Err(Error::NotFound);
        }
        // snapshot entries are frozen
        let mode = if e.snap != 0 { Mode::ReadOnly } else { mode };
        let label = b.label();
        let src = Arc::new(Source {
            core: Arc::clone(&self.core),
            parent: Some(Arc::clone(self)),
            mode,
            gen: e.gen,
            dir: e.is_dir(),
            dsize: e.dsize as usize,
            psize: e.psize as usize,
            offset,
            ptag,
            epb: child_epb,
            state: Mutex::new(SourceState {
                epoch: label.epoch,
                score: b.score(),
                score_epoch: label.epoch,
            }),
            defunct: AtomicBool::new(false),
        });
        self.core.register_source(&src);
        Ok(src)
    }

    fn create_locked(self: &Arc<Self>, dir: bool, h: u32) -> Result<Arc<Source>> {
        if !self.dir {
            return Err(Error::InvalidState("create inside a data source".into()));
        }
        if self.mode != Mode::ReadWrite {
            return Err(Error::BadMode);
        }
        let epb = self.dsize / ENTRY_SIZE;
        let nentries = (self.entry_locked()?.size / ENTRY_SIZE as u64) as usize;
        let mut free = None;
        for i in 0..nentries {
            let bn = (i / epb) as u64;
            match self.block_ro(bn)? {
                Some(b) => {
                    let data = b.data();
                    let active = data[(i % epb) * ENTRY_SIZE + 8] & ENTRY_ACTIVE != 0;
                    if !active {
                        free = Some(i);
                        break;
                    }
                }
                None => {
                    free = Some(i);
                    break;
                }
            }
        }
        let i = free.unwrap_or(nentries);
        let b = self.block_rw((i / epb) as u64, h)?;
        let slot = i % epb;
        let old_gen = {
            let data = b.data();
            Entry::unpack(&data, slot * ENTRY_SIZE)
                .map(|e| e.gen)
                .unwrap_or(0)
        };
        let bs = self.core.cache.block_size() as u16;
        let e = Entry {
            gen: old_gen.wrapping_add(1),
            psize: bs,
            dsize: bs,
            flags: ENTRY_ACTIVE | ENTRY_LOCAL | if dir { ENTRY_DIR } else { 0 },
            depth: 0,
            size: 0,
            score: Score::ZERO,
            tag: self.core.next_tag(),
            snap: 0,
            archive: false,
        };
        {
            let mut d = b.data_mut();
            e.pack(&mut d, slot * ENTRY_SIZE);
        }
        b.dirty();
        drop(b);
        if i >= nentries {
            self.update_size(h, ((i + 1) * ENTRY_SIZE) as u64)?;
        }
        trace!(offset = i, tag = e.tag, dir, "created source");
        self.open_locked(i, Mode::ReadWrite)
    }

    fn remove_locked(&self, h: u32) -> Result<()> {
        if self.parent.is_none() {
            return Err(Error::InvalidState("cannot remove the root source".into()));
        }
        let (eb, slot) = self.entry_rw(h)?;
        let e = self.unpack_entry(&eb, slot)?;
        let mut dead = Entry::empty();
        dead.gen = e.gen.wrapping_add(1);
        {
            let mut d = eb.data_mut();
            dead.pack(&mut d, slot * ENTRY_SIZE);
        }
        eb.dirty();
        if e.is_local() && e.score != Score::ZERO {
            if let Some(addr) = e.score.to_local() {
                if addr != NIL_ADDR {
                    let l = self.core.cache.label(addr)?;
                    self.core.cache.queue_unlink(
                        &eb,
                        addr,
                        self.tree_type(e.depth),
                        e.tag,
                        l.epoch,
                        h,
                        true,
                    );
                }
            }
        }
        drop(eb);
        self.defunct.store(true, Ordering::SeqCst);
        trace!(offset = self.offset, "removed source");
        Ok(())
    }

    /// Force the path from the root to this source's entry writable at
    /// `h`; run over every open source after an epoch bump
    pub(crate) fn rewalk(&self, h: u32) -> Result<()> {
        if self.mode != Mode::ReadWrite || self.defunct.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.entry_rw(h) {
            Ok(_) => Ok(()),
            // the slot was reused behind this handle's back
            Err(Error::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Point the root source at a fresh root block (epoch bump)
    pub(crate) fn reroot(&self, score: Score, epoch: u32) {
        debug_assert!(self.parent.is_none());
        let mut st = self.state.lock();
        st.score = score;
        st.epoch = epoch;
        st.score_epoch = epoch;
    }

    /// The source's current epoch
    pub fn epoch(&self) -> u32 {
        self.state.lock().epoch
    }

    /// Epoch of the block holding this source's entry
    pub fn entry_block_epoch(&self) -> u32 {
        self.state.lock().score_epoch
    }
}
