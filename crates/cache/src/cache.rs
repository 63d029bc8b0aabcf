//! The cache proper: slot index, gets, pinning, and LRU eviction

use crate::block::{BlockRef, BlockSlot, IoState};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use shale_core::{
    BlockState, BlockType, Depot, Error, Label, Mode, Part, Result, Score, Tuning, NIL_ADDR,
};
use shale_disk::Disk;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace};

/// Cache construction parameters
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of block slots
    pub nblocks: usize,
    /// Access mode; `ReadOnly` refuses every `ReadWrite` get
    pub mode: Mode,
    /// Tuneables (dirty percentage, flush size, retry backoff)
    pub tuning: Tuning,
}

/// Slot index: either a local block or a depot block by score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Key {
    Local(Part, u32),
    Remote(Score),
}

/// How to make a slot's image valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fill {
    /// Read the image from disk
    Read,
    /// Fresh allocation: a zeroed image is the truth
    Zero,
}

pub(crate) struct State {
    pub map: FxHashMap<(Part, u32), usize>,
    pub remote: FxHashMap<Score, usize>,
    /// Key each slot is filed under, for eviction bookkeeping
    pub keys: Vec<Option<Key>>,
    pub refs: Vec<u32>,
    pub used: Vec<u64>,
    /// `(used, slot)` for every unpinned slot, oldest first
    pub lru: BTreeSet<(u64, usize)>,
    pub used_counter: u64,
    pub dirty: usize,
    pub free: Vec<usize>,
}

pub(crate) struct Shared {
    pub disk: Arc<Disk>,
    pub depot: Arc<dyn Depot>,
    pub mode: Mode,
    pub tuning: Tuning,
    pub block_size: usize,
    pub slots: Vec<BlockSlot>,
    pub state: Mutex<State>,
    /// A slot became available for eviction or reuse
    pub avail: Condvar,
    /// The flusher should take a look
    pub flush_cv: Condvar,
    /// Mirror of the file system's low epoch, for reclamation decisions
    pub epoch_low: AtomicU32,
    /// Rotating allocation scan position, serializing allocators
    pub alloc_hint: Mutex<u32>,
    pub shutdown: AtomicBool,
    pub dirty_counter: AtomicU64,
}

/// The in-memory buffer pool
///
/// See the crate docs for the locking and write-ordering rules.
pub struct Cache {
    pub(crate) shared: Arc<Shared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// Build a cache over `disk`, with `depot` serving archived blocks
    pub fn new(disk: Arc<Disk>, depot: Arc<dyn Depot>, config: CacheConfig) -> Cache {
        let nblocks = config.nblocks.max(8);
        let block_size = disk.block_size();
        let shared = Arc::new(Shared {
            disk,
            depot,
            mode: config.mode,
            tuning: config.tuning,
            block_size,
            slots: (0..nblocks).map(|_| BlockSlot::new(block_size)).collect(),
            state: Mutex::new(State {
                map: FxHashMap::default(),
                remote: FxHashMap::default(),
                keys: vec![None; nblocks],
                refs: vec![0; nblocks],
                used: vec![0; nblocks],
                lru: BTreeSet::new(),
                used_counter: 0,
                dirty: 0,
                free: (0..nblocks).rev().collect(),
            }),
            avail: Condvar::new(),
            flush_cv: Condvar::new(),
            epoch_low: AtomicU32::new(0),
            alloc_hint: Mutex::new(0),
            shutdown: AtomicBool::new(false),
            dirty_counter: AtomicU64::new(0),
        });
        let flusher = if config.mode == Mode::ReadWrite {
            let s = Arc::clone(&shared);
            Some(std::thread::spawn(move || s.flush_loop()))
        } else {
            None
        };
        debug!(nblocks, block_size, "cache up");
        Cache {
            shared,
            flusher: Mutex::new(flusher),
        }
    }

    /// Block size served by this cache
    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    /// The cache's open mode
    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// The underlying device
    pub fn disk(&self) -> &Disk {
        &self.shared.disk
    }

    /// The depot session
    pub fn depot(&self) -> &Arc<dyn Depot> {
        &self.shared.depot
    }

    /// Update the reclamation watermark mirror
    pub fn set_epoch_low(&self, epoch_low: u32) {
        self.shared.epoch_low.store(epoch_low, Ordering::SeqCst);
    }

    /// Current reclamation watermark mirror
    pub fn epoch_low(&self) -> u32 {
        self.shared.epoch_low.load(Ordering::SeqCst)
    }

    /// Number of dirty blocks right now
    pub fn ndirty(&self) -> usize {
        self.shared.state.lock().dirty
    }

    /// Get a block without label validation (super and label partitions)
    pub fn get(&self, part: Part, addr: u32, mode: Mode) -> Result<BlockRef<'_>> {
        self.shared.get(part, addr, mode, Fill::Read)
    }

    /// Get a data block, validating its label against the expected type,
    /// tag, and (when non-zero) epoch
    pub fn local(
        &self,
        addr: u32,
        typ: Option<BlockType>,
        tag: u32,
        mode: Mode,
        epoch: u32,
    ) -> Result<BlockRef<'_>> {
        self.shared.local(addr, typ, tag, mode, epoch)
    }

    /// Get a block by score: local blocks through the local path, depot
    /// blocks into a synthetic read-only slot
    pub fn global(
        &self,
        score: Score,
        typ: BlockType,
        tag: u32,
        mode: Mode,
    ) -> Result<BlockRef<'_>> {
        self.shared.global(score, typ, tag, mode)
    }

    /// Record that `dst` must not reach disk before `src`; `rollback`
    /// lets the writer emit a consistent older image of `dst` instead
    pub fn dependency(&self, dst: &BlockRef<'_>, src: &BlockRef<'_>, rollback: crate::Rollback) {
        self.shared.dependency(dst, src, rollback)
    }

    /// Write dirty blocks: level 0 until under the dirty threshold,
    /// level 1 until none remain
    pub fn flush(&self, level: usize) -> Result<()> {
        self.shared.flush(level)
    }

    /// Drain everything and stop the flusher
    pub fn close(&self) -> Result<()> {
        if self.shared.mode == Mode::ReadWrite {
            self.shared.flush(1)?;
        }
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.flush_cv.notify_all();
        if let Some(h) = self.flusher.lock().take() {
            let _ = h.join();
        }
        self.shared.disk.sync()
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.flush_cv.notify_all();
        if let Some(h) = self.flusher.lock().take() {
            let _ = h.join();
        }
    }
}

enum Victim {
    Ready(usize),
    NeedsWrite(usize),
    None,
}

impl Shared {
    pub(crate) fn get(
        &self,
        part: Part,
        addr: u32,
        mode: Mode,
        fill: Fill,
    ) -> Result<BlockRef<'_>> {
        if mode == Mode::ReadWrite && self.mode == Mode::ReadOnly {
            return Err(Error::BadMode);
        }
        if addr >= self.disk.part_size(part)? {
            return Err(Error::BadAddr(addr));
        }
        let id = self.lookup_or_assign(Key::Local(part, addr));
        self.slots[id].lock_logical();
        let r = BlockRef {
            cache: self,
            slot: id,
            mode,
        };
        self.fill_local(&r, part, addr, fill)?;
        Ok(r)
    }

    pub(crate) fn local(
        &self,
        addr: u32,
        typ: Option<BlockType>,
        tag: u32,
        mode: Mode,
        epoch: u32,
    ) -> Result<BlockRef<'_>> {
        let label = self.label(addr)?;
        if !label.state.is_allocated() {
            return Err(Error::BadLabel {
                part: Part::Data,
                addr,
                reason: "block is not allocated",
            });
        }
        if label.state == BlockState::Bad {
            return Err(Error::BadLabel {
                part: Part::Data,
                addr,
                reason: "label marked bad",
            });
        }
        if let Some(t) = typ {
            if label.typ != t {
                return Err(Error::BadLabel {
                    part: Part::Data,
                    addr,
                    reason: "type mismatch",
                });
            }
        }
        if label.tag != tag {
            return Err(Error::BadLabel {
                part: Part::Data,
                addr,
                reason: "tag mismatch",
            });
        }
        if epoch != 0 && label.epoch != epoch {
            return Err(Error::BadLabel {
                part: Part::Data,
                addr,
                reason: "epoch mismatch",
            });
        }
        let b = self.get(Part::Data, addr, mode, Fill::Read)?;
        b.set_cached_label(label);
        Ok(b)
    }

    pub(crate) fn global(
        &self,
        score: Score,
        typ: BlockType,
        tag: u32,
        mode: Mode,
    ) -> Result<BlockRef<'_>> {
        if let Some(addr) = score.to_local() {
            if addr == NIL_ADDR {
                return Err(Error::InvalidState("get of the nil block".into()));
            }
            return self.local(addr, Some(typ), tag, mode, 0);
        }
        if mode == Mode::ReadWrite {
            // depot blocks are immutable; mutation goes through copy-on-write
            return Err(Error::BadMode);
        }
        let id = self.lookup_or_assign(Key::Remote(score));
        self.slots[id].lock_logical();
        let r = BlockRef {
            cache: self,
            slot: id,
            mode,
        };
        self.fill_remote(&r, score, typ, tag)?;
        Ok(r)
    }

    fn lookup_or_assign(&self, key: Key) -> usize {
        loop {
            let mut st = self.state.lock();
            let hit = match key {
                Key::Local(part, addr) => st.map.get(&(part, addr)).copied(),
                Key::Remote(score) => st.remote.get(&score).copied(),
            };
            if let Some(id) = hit {
                self.pin(&mut st, id);
                return id;
            }
            if let Some(id) = st.free.pop() {
                self.assign(&mut st, id, key);
                return id;
            }
            match self.scan_victim(&mut st) {
                Victim::Ready(id) => {
                    self.unfile(&mut st, id);
                    self.assign(&mut st, id, key);
                    return id;
                }
                Victim::NeedsWrite(id) => {
                    self.pin(&mut st, id);
                    drop(st);
                    let _ = self.flush_slot(id);
                    let mut st = self.state.lock();
                    self.unpin(&mut st, id);
                    // loop: the slot is a clean candidate now, unless
                    // someone re-dirtied or claimed it
                }
                Victim::None => {
                    trace!("cache full, waiting for a slot");
                    let _ = self.avail.wait_for(&mut st, Duration::from_millis(200));
                }
            }
        }
    }

    /// Pick an eviction candidate in LRU order
    fn scan_victim(&self, st: &mut State) -> Victim {
        let mut needs_write = None;
        for &(_, id) in st.lru.iter() {
            let Some(inner) = self.slots[id].inner.try_lock() else {
                continue;
            };
            match inner.iostate {
                IoState::Empty | IoState::Clean | IoState::ReadError | IoState::DepotError => {
                    return Victim::Ready(id);
                }
                IoState::Dirty => {
                    if needs_write.is_none() {
                        needs_write = Some(id);
                    }
                }
                IoState::Writing => {}
            }
        }
        match needs_write {
            Some(id) => Victim::NeedsWrite(id),
            None => Victim::None,
        }
    }

    fn pin(&self, st: &mut State, id: usize) {
        if st.refs[id] == 0 {
            st.lru.remove(&(st.used[id], id));
        }
        st.refs[id] += 1;
        st.used_counter += 1;
        st.used[id] = st.used_counter;
    }

    fn unpin(&self, st: &mut State, id: usize) {
        st.refs[id] -= 1;
        if st.refs[id] == 0 {
            st.lru.insert((st.used[id], id));
            self.avail.notify_one();
        }
    }

    /// Remove a slot's index entries (slot must be unpinned and clean)
    pub(crate) fn unfile(&self, st: &mut State, id: usize) {
        if let Some(key) = st.keys[id].take() {
            match key {
                Key::Local(part, addr) => {
                    st.map.remove(&(part, addr));
                }
                Key::Remote(score) => {
                    st.remote.remove(&score);
                }
            }
        }
        st.lru.remove(&(st.used[id], id));
    }

    fn assign(&self, st: &mut State, id: usize, key: Key) {
        st.keys[id] = Some(key);
        match key {
            Key::Local(part, addr) => {
                st.map.insert((part, addr), id);
            }
            Key::Remote(score) => {
                st.remote.insert(score, id);
            }
        }
        st.refs[id] = 1;
        st.used_counter += 1;
        st.used[id] = st.used_counter;
        let mut inner = self.slots[id].inner.lock();
        debug_assert!(!inner.locked);
        match key {
            Key::Local(part, addr) => {
                inner.part = part;
                inner.addr = addr;
                inner.remote_score = None;
            }
            Key::Remote(score) => {
                inner.part = Part::Remote;
                inner.addr = 0;
                inner.remote_score = Some(score);
            }
        }
        inner.iostate = IoState::Empty;
        inner.label = Label::free(BlockType::data(0));
        inner.priors.clear();
        inner.unlinks.clear();
    }

    pub(crate) fn release(&self, id: usize) {
        let mut st = self.state.lock();
        self.unpin(&mut st, id);
        drop(st);
        self.slots[id].unlock_logical();
    }

    fn fill_local(&self, r: &BlockRef<'_>, part: Part, addr: u32, fill: Fill) -> Result<()> {
        let state = r.iostate();
        match state {
            IoState::Clean | IoState::Dirty | IoState::Writing => Ok(()),
            IoState::Empty | IoState::ReadError | IoState::DepotError => match fill {
                Fill::Zero => {
                    let mut inner = self.slots[r.slot].inner.lock();
                    inner.data.fill(0);
                    inner.iostate = IoState::Clean;
                    Ok(())
                }
                Fill::Read => {
                    let mut buf = vec![0u8; self.block_size];
                    match self.disk.read(part, addr, &mut buf) {
                        Ok(()) => {
                            let mut inner = self.slots[r.slot].inner.lock();
                            inner.data = buf;
                            inner.iostate = IoState::Clean;
                            Ok(())
                        }
                        Err(e) => {
                            self.slots[r.slot].inner.lock().iostate = IoState::ReadError;
                            Err(e)
                        }
                    }
                }
            },
        }
    }

    fn fill_remote(&self, r: &BlockRef<'_>, score: Score, typ: BlockType, tag: u32) -> Result<()> {
        match r.iostate() {
            IoState::Clean => Ok(()),
            IoState::Empty | IoState::DepotError => {
                let mut buf = vec![0u8; self.block_size];
                match self.depot.read(score, typ, &mut buf) {
                    Ok(_) => {
                        let mut inner = self.slots[r.slot].inner.lock();
                        inner.data = buf;
                        inner.label = Label {
                            typ,
                            state: BlockState::ActiveA,
                            copied: false,
                            tag,
                            epoch: 0,
                            epoch_close: 0,
                        };
                        inner.iostate = IoState::Clean;
                        Ok(())
                    }
                    Err(e) => {
                        self.slots[r.slot].inner.lock().iostate = IoState::DepotError;
                        Err(e)
                    }
                }
            }
            other => Err(Error::InvalidState(format!(
                "remote block in io state {other:?}"
            ))),
        }
    }

    pub(crate) fn dirty(&self, r: &BlockRef<'_>) {
        let mut st = self.state.lock();
        let mut inner = self.slots[r.slot].inner.lock();
        inner.vers += 1;
        match inner.iostate {
            IoState::Clean | IoState::Empty => {
                inner.iostate = IoState::Dirty;
                inner.dirty_seq = self.dirty_counter.fetch_add(1, Ordering::SeqCst);
                st.dirty += 1;
            }
            IoState::Dirty | IoState::Writing => {}
            IoState::ReadError | IoState::DepotError => {}
        }
        let over = st.dirty * 100 > self.tuning.dirty_percentage * self.slots.len();
        drop(inner);
        drop(st);
        if over {
            self.flush_cv.notify_one();
        }
    }

    pub(crate) fn dependency(
        &self,
        dst: &BlockRef<'_>,
        src: &BlockRef<'_>,
        rollback: crate::Rollback,
    ) {
        let (part, addr) = {
            let inner = self.slots[src.slot].inner.lock();
            (inner.part, inner.addr)
        };
        self.dependency_addr(dst, part, addr, rollback);
    }

    /// Record a dependency on `(part, addr)` without holding the source
    /// block; a no-op if that block is already durable
    pub(crate) fn dependency_addr(
        &self,
        dst: &BlockRef<'_>,
        part: Part,
        addr: u32,
        rollback: crate::Rollback,
    ) {
        let sid = {
            let st = self.state.lock();
            st.map.get(&(part, addr)).copied()
        };
        let Some(sid) = sid else { return };
        let vers = {
            let inner = self.slots[sid].inner.lock();
            if inner.part != part
                || inner.addr != addr
                || !matches!(inner.iostate, IoState::Dirty | IoState::Writing)
            {
                return;
            }
            inner.vers
        };
        let mut inner = self.slots[dst.slot].inner.lock();
        inner.priors.push(crate::block::Dep {
            part,
            addr,
            vers,
            rollback,
        });
    }
}
