//! The file-system object
//!
//! `Fs` ties the pieces together: the cache over a formatted device, the
//! epoch lock, the root source, the snapshot protocol, the archiver, and
//! the periodic flush and snapshot tasks.
//!
//! Most operations take a read lock of `elk`, ensuring the high and low
//! epochs do not change underfoot. Snapshots, reclamation, and sync take
//! it exclusively. The super-block is the one globally shared record;
//! every update goes through `super_get` / `super_put` under `elk`.

use crate::archive;
use crate::periodic::Periodic;
use crate::snap::{self, SnapTimes, SnapshotInfo, SnapshotSink};
use crate::source::Source;
use parking_lot::{Condvar, Mutex, RwLock};
use shale_cache::{BlockRef, Cache, CacheConfig, Rollback};
use shale_core::{
    score_check, BlockType, Depot, Entry, Error, Mode, Part, Result, Score, Tuning, ENTRY_ACTIVE,
    ENTRY_DIR, ENTRY_LOCAL, ENTRY_SIZE, NIL_ADDR, ROOT_TAG, USER_TAG,
};
use shale_disk::{Disk, Super, SUPER_SIZE};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The two epoch watermarks, guarded by the epoch lock
#[derive(Debug, Clone, Copy)]
pub struct Epochs {
    /// Current mutation epoch
    pub high: u32,
    /// Reclamation watermark
    pub low: u32,
}

pub(crate) struct ArchCtl {
    pub lock: Mutex<ArchFlags>,
    pub cv: Condvar,
}

pub(crate) struct ArchFlags {
    pub kick: bool,
    pub shutdown: bool,
}

/// Shared state behind every `Fs` handle
pub(crate) struct FsCore {
    pub cache: Cache,
    pub mode: Mode,
    pub block_size: usize,
    pub tuning: Tuning,
    /// Epoch lock: read-held by mutators, write-held by snapshot,
    /// reclamation, and sync
    pub elk: RwLock<Epochs>,
    pub root: OnceLock<Arc<Source>>,
    pub sources: Mutex<Vec<Weak<Source>>>,
    pub snapshots: Mutex<Vec<SnapshotInfo>>,
    pub sink: Box<dyn SnapshotSink>,
    pub arch: ArchCtl,
    tag_counter: AtomicU32,
}

impl FsCore {
    /// Hand out a fresh source tag, always at or above `USER_TAG`
    pub fn next_tag(&self) -> u32 {
        loop {
            let t = self.tag_counter.fetch_add(1, Ordering::SeqCst);
            if t >= USER_TAG {
                return t;
            }
        }
    }

    pub fn register_source(&self, src: &Arc<Source>) {
        let mut sources = self.sources.lock();
        sources.retain(|w| w.strong_count() > 0);
        sources.push(Arc::downgrade(src));
    }

    pub fn root_source(&self) -> &Arc<Source> {
        self.root.get().expect("file system fully opened")
    }

    /// Fetch and unpack the super-block
    pub fn super_get(&self) -> Result<(BlockRef<'_>, Super)> {
        let b = self.cache.get(Part::Super, 0, self.mode)?;
        let sup = {
            let data = b.data();
            Super::unpack(&data[..SUPER_SIZE])?
        };
        Ok((b, sup))
    }

    /// Pack the super-block back and optionally force it out
    ///
    /// A forced write may well push a slightly outdated active-root
    /// address (the rollback to the most recent root already on disk);
    /// the epoch fields go out as given, and those are the ones crash
    /// recovery cares about.
    pub fn super_put(&self, b: BlockRef<'_>, sup: &Super, force: bool) -> Result<()> {
        {
            let mut data = b.data_mut();
            sup.pack(&mut data[..SUPER_SIZE]);
        }
        b.dirty();
        if force {
            b.write()?;
        }
        Ok(())
    }

    /// Duplicate the root block into the next epoch and move the
    /// super-block to it; returns the old root's address
    ///
    /// Entry 1 of the new root keeps a pointer to the old root as a hint
    /// to checkers and (human) debuggers.
    pub fn bump_epoch(&self, ep: &mut Epochs, archive: bool) -> Result<u32> {
        let root = self.root_source();
        let b = self
            .cache
            .global(root.root_score(), BlockType::dir(0), ROOT_TAG, Mode::ReadOnly)?;
        let hint = Entry {
            gen: 0,
            psize: self.block_size as u16,
            dsize: self.block_size as u16,
            flags: ENTRY_ACTIVE | ENTRY_DIR | ENTRY_LOCAL,
            depth: 0,
            size: self.block_size as u64,
            score: b.score(),
            tag: ROOT_TAG,
            snap: b.label().epoch,
            archive,
        };
        let bb = self.cache.copy_block(&b, ROOT_TAG, ep.high + 1)?;
        drop(b);
        {
            let mut data = bb.data_mut();
            hint.pack(&mut data, ENTRY_SIZE);
        }
        bb.dirty();

        let (sb, mut sup) = self.super_get()?;
        ep.high += 1;
        root.reroot(bb.score(), ep.high);
        sup.epoch_high = ep.high;
        let old_addr = sup.active;
        sup.active = bb.addr();
        if archive {
            sup.next = old_addr;
        }
        // The new active address must not reach disk before the new
        // root block does; until then the old address is written.
        self.cache.dependency(
            &sb,
            &bb,
            Rollback::SuperRoot {
                old: Score::local(old_addr),
            },
        );
        drop(bb);
        // Force the epoch out so a crash cannot treat the snapshot's
        // blocks as active.
        self.super_put(sb, &sup, true)?;
        debug!(epoch = ep.high, root = sup.active, archive, "bumped epoch");
        Ok(old_addr)
    }

    /// Force every open read-write source's entry path writable at `h`
    pub fn walk_sources(&self, h: u32) -> Result<()> {
        let live: Vec<Arc<Source>> = {
            let mut sources = self.sources.lock();
            sources.retain(|w| w.strong_count() > 0);
            sources.iter().filter_map(|w| w.upgrade()).collect()
        };
        for src in live {
            src.rewalk(h)?;
        }
        Ok(())
    }

    pub fn kick_archiver(&self) {
        let mut g = self.arch.lock.lock();
        g.kick = true;
        drop(g);
        self.arch.cv.notify_all();
    }
}

/// Snapshot the active tree; with `archive` also queue it for the depot
///
/// Runs under the exclusive epoch lock: bump the epoch, re-walk open
/// sources so blocks newly shared with the snapshot keep one parent per
/// epoch, drain the cache, publish the frozen root, and (for archival
/// snapshots) save the qid watermark and bump a second time so the
/// snapshot is in both the active tree and the archive walk.
pub(crate) fn snapshot(core: &Arc<FsCore>, archive: bool) -> Result<()> {
    if core.mode != Mode::ReadWrite {
        return Err(Error::BadMode);
    }
    let mut ep = core.elk.write();
    let frozen_epoch = ep.high;
    let frozen_root = core.bump_epoch(&mut ep, false)?;
    core.walk_sources(ep.high)?;
    core.cache.flush(1)?;

    let mut snap_info = SnapshotInfo {
        epoch: frozen_epoch,
        root: frozen_root,
        archive,
        name: snap::snapshot_name(chrono::Local::now(), archive),
        qid_max: 0,
    };
    if archive {
        let (b, sup) = core.super_get()?;
        snap_info.qid_max = sup.qid;
        drop(b);
        core.bump_epoch(&mut ep, true)?;
    }
    core.snapshots.lock().push(snap_info.clone());
    core.sink.publish(&snap_info)?;
    drop(ep);
    if archive {
        core.kick_archiver();
    }
    info!(
        epoch = snap_info.epoch,
        root = snap_info.root,
        archive,
        name = %snap_info.name,
        "snapshot taken"
    );
    Ok(())
}

/// Open-time configuration
pub struct OpenConfig {
    /// Access mode for the whole file system
    pub mode: Mode,
    /// Cache size in blocks
    pub cache_blocks: usize,
    /// Tuneables, shared with the cache
    pub tuning: Tuning,
    /// Where published snapshots go; `None` logs and drops them
    pub sink: Option<Box<dyn SnapshotSink>>,
    /// Take a plain snapshot every this many minutes
    pub snap_minutes: Option<u32>,
    /// Take an archival snapshot at this minute of the day
    pub arch_minute: Option<u32>,
}

impl OpenConfig {
    /// Defaults for the given mode
    pub fn new(mode: Mode) -> OpenConfig {
        OpenConfig {
            mode,
            cache_blocks: 1000,
            tuning: Tuning::default(),
            sink: None,
            snap_minutes: None,
            arch_minute: None,
        }
    }

    /// Override the cache size
    pub fn cache_blocks(mut self, n: usize) -> OpenConfig {
        self.cache_blocks = n;
        self
    }

    /// Override the tuneables
    pub fn tuning(mut self, tuning: Tuning) -> OpenConfig {
        self.tuning = tuning;
        self
    }

    /// Route published snapshots somewhere
    pub fn sink(mut self, sink: Box<dyn SnapshotSink>) -> OpenConfig {
        self.sink = Some(sink);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.cache_blocks < 8 {
            return Err(Error::InvalidState(format!(
                "cache of {} blocks is too small",
                self.cache_blocks
            )));
        }
        Ok(())
    }
}

/// A mounted shale file system
pub struct Fs {
    core: Arc<FsCore>,
    arch_thread: Mutex<Option<JoinHandle<()>>>,
    meta_flush: Mutex<Option<Periodic>>,
    snap_sched: Mutex<Option<Periodic>>,
    snap_times: Arc<Mutex<SnapTimes>>,
}

impl Fs {
    /// Open the formatted device at `path`
    pub fn open(path: &Path, depot: Arc<dyn Depot>, config: OpenConfig) -> Result<Fs> {
        let file = OpenOptions::new()
            .read(true)
            .write(config.mode == Mode::ReadWrite)
            .open(path)?;
        Fs::from_file(file, depot, config)
    }

    /// Open a formatted device already held as a file handle
    pub fn from_file(file: File, depot: Arc<dyn Depot>, config: OpenConfig) -> Result<Fs> {
        config.validate()?;
        let mode = config.mode;
        let disk = Arc::new(Disk::open(file)?);
        let block_size = disk.block_size();
        let cache = Cache::new(
            disk,
            Arc::clone(&depot),
            CacheConfig {
                nblocks: config.cache_blocks,
                mode,
                tuning: config.tuning.clone(),
            },
        );

        let sup = {
            let b = cache.get(Part::Super, 0, Mode::ReadOnly)?;
            let data = b.data();
            Super::unpack(&data[..SUPER_SIZE])?
        };
        cache.set_epoch_low(sup.epoch_low);
        debug!(
            epoch_high = sup.epoch_high,
            epoch_low = sup.epoch_low,
            active = sup.active,
            name = %sup.name,
            "opening file system"
        );

        let core = Arc::new(FsCore {
            cache,
            mode,
            block_size,
            tuning: config.tuning.clone(),
            elk: RwLock::new(Epochs {
                high: sup.epoch_high,
                low: sup.epoch_low,
            }),
            root: OnceLock::new(),
            sources: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
            sink: config.sink.unwrap_or_else(|| Box::new(snap::NullSink)),
            arch: ArchCtl {
                lock: Mutex::new(ArchFlags {
                    kick: true,
                    shutdown: false,
                }),
                cv: Condvar::new(),
            },
            tag_counter: AtomicU32::new(
                USER_TAG.wrapping_add((sup.qid as u32).wrapping_mul(0x0001_0003)),
            ),
        });

        let ep = *core.elk.read();
        let root = match Source::root(&core, sup.active, mode, ep.high) {
            Ok(root) => root,
            Err(Error::BadRoot) if mode == Mode::ReadWrite => {
                // Perhaps the root is copy-on-write (a crash caught the
                // epoch bump before the new root landed). Do the copy
                // and try again.
                Fs::recover_root(&core, ep.high)?;
                let (_, sup) = core.super_get()?;
                Source::root(&core, sup.active, mode, ep.high)?
            }
            Err(e) => return Err(e),
        };
        core.root
            .set(root)
            .map_err(|_| Error::InvalidState("root already set".into()))?;

        let mut fs = Fs {
            core: Arc::clone(&core),
            arch_thread: Mutex::new(None),
            meta_flush: Mutex::new(None),
            snap_sched: Mutex::new(None),
            snap_times: Arc::new(Mutex::new(SnapTimes {
                snap_minutes: config.snap_minutes,
                arch_minute: config.arch_minute,
                last_snap: 0,
                last_arch: 0,
            })),
        };
        if mode == Mode::ReadWrite {
            fs.start_tasks();
        }
        Ok(fs)
    }

    fn recover_root(core: &Arc<FsCore>, epoch_high: u32) -> Result<()> {
        let (_, sup) = core.super_get()?;
        let b = core.cache.local(
            sup.active,
            Some(BlockType::dir(0)),
            ROOT_TAG,
            Mode::ReadWrite,
            0,
        )?;
        let l = b.label();
        if !l.state.is_closed() && l.epoch == epoch_high {
            // the root is current; something else is wrong
            return Err(Error::BadRoot);
        }
        warn!(
            active = sup.active,
            root_epoch = l.epoch,
            epoch_high,
            "active root lags the epoch; copying forward"
        );
        let bb = core.cache.copy_block(&b, ROOT_TAG, epoch_high)?;
        drop(b);
        let (sb, mut sup) = core.super_get()?;
        let old_addr = sup.active;
        sup.active = bb.addr();
        core.cache.dependency(
            &sb,
            &bb,
            Rollback::SuperRoot {
                old: Score::local(old_addr),
            },
        );
        drop(bb);
        core.super_put(sb, &sup, false)?;
        Ok(())
    }

    fn start_tasks(&mut self) {
        let arch_core = Arc::clone(&self.core);
        *self.arch_thread.lock() = Some(std::thread::spawn(move || archive::run(arch_core)));

        let flush_core = Arc::downgrade(&self.core);
        *self.meta_flush.lock() = Some(Periodic::start(
            "meta-flush",
            Duration::from_secs(1),
            move || {
                if let Some(core) = flush_core.upgrade() {
                    if let Err(e) = core.cache.flush(0) {
                        warn!(%e, "periodic flush failed");
                    }
                }
            },
        ));

        let snap_core = Arc::downgrade(&self.core);
        let times = Arc::clone(&self.snap_times);
        *self.snap_sched.lock() = Some(Periodic::start(
            "snap-sched",
            Duration::from_secs(10),
            move || {
                if let Some(core) = snap_core.upgrade() {
                    snap::snap_tick(&core, &times);
                }
            },
        ));
    }

    /// Block size of the underlying device
    pub fn block_size(&self) -> usize {
        self.core.block_size
    }

    /// The root source of the active tree
    pub fn root(&self) -> Arc<Source> {
        Arc::clone(self.core.root_source())
    }

    /// Current `(high, low)` epochs
    pub fn epochs(&self) -> (u32, u32) {
        let ep = self.core.elk.read();
        (ep.high, ep.low)
    }

    /// A read-only copy of the super-block
    pub fn super_block(&self) -> Result<Super> {
        let _ep = self.core.elk.read();
        let (_, sup) = self.core.super_get()?;
        Ok(sup)
    }

    /// Drain every dirty block to disk
    pub fn sync(&self) -> Result<()> {
        let _ep = self.core.elk.write();
        self.core.cache.flush(1)
    }

    /// Take a snapshot of the active tree
    pub fn snapshot(&self, archive: bool) -> Result<()> {
        snapshot(&self.core, archive)
    }

    /// Snapshots published since open, newest last
    pub fn snapshots(&self) -> Vec<SnapshotInfo> {
        self.core.snapshots.lock().clone()
    }

    /// Open the frozen root of a published snapshot, read-only
    pub fn snapshot_root(&self, info: &SnapshotInfo) -> Result<Arc<Source>> {
        let ep = self.core.elk.read();
        Source::root(&self.core, info.root, Mode::ReadOnly, ep.high)
    }

    /// Raise the reclamation watermark and free every block retired at
    /// or below it
    pub fn epoch_low(&self, low: u32) -> Result<()> {
        let mut ep = self.core.elk.write();
        if low > ep.high {
            return Err(Error::InvalidState(format!(
                "bad low epoch {} (must be <= {})",
                low, ep.high
            )));
        }
        let (b, mut sup) = self.core.super_get()?;
        sup.epoch_low = low;
        ep.low = low;
        self.core.cache.set_epoch_low(low);
        self.core.super_put(b, &sup, true)?;

        // Eager sweep: closed blocks whose close epoch fell behind the
        // watermark are dead in every remaining snapshot.
        let ndata = self.core.cache.disk().part_size(Part::Data)?;
        let mut freed = 0usize;
        for addr in 0..ndata {
            let l = self.core.cache.label(addr)?;
            if l.state.is_closed() && l.epoch_close != 0 && l.epoch_close <= low {
                let f = shale_core::Label::free(l.typ);
                self.core.cache.set_label(addr, &f)?;
                freed += 1;
            }
        }
        self.core.snapshots.lock().retain(|s| s.epoch >= low);
        info!(low, freed, "raised low epoch");
        Ok(())
    }

    /// Hand out the next qid
    pub fn next_qid(&self) -> Result<u64> {
        let _ep = self.core.elk.read();
        let (b, mut sup) = self.core.super_get()?;
        let qid = sup.qid;
        sup.qid += 1;
        // No force: whoever records the qid can order itself against the
        // super-block with a dependency.
        self.core.super_put(b, &sup, false)?;
        Ok(qid)
    }

    /// Point the depot session at a different host and reconnect
    pub fn redial(&self, host: &str) -> Result<()> {
        self.core.cache.depot().redial(host)?;
        self.core.cache.depot().connect()
    }

    /// Build a self-contained depot root record for an already-archived
    /// source and return its score
    pub fn vac(&self, src: &Source) -> Result<Score> {
        let _ep = self.core.elk.read();
        let e = src.entry_locked()?;
        if e.is_local() {
            return Err(Error::InvalidState(
                "can only vac sources already stored in the depot".into(),
            ));
        }
        let mut buf = vec![0u8; self.core.block_size];
        e.pack(&mut buf, 0);
        let score = self.core.cache.depot().write(BlockType::dir(0), &buf)?;
        score_check(score, &buf)?;
        Ok(score)
    }

    /// Snapshot scheduler settings `(snap_minutes, arch_minute)`
    pub fn snap_times(&self) -> (Option<u32>, Option<u32>) {
        let t = self.snap_times.lock();
        (t.snap_minutes, t.arch_minute)
    }

    /// Update the snapshot scheduler
    pub fn set_snap_times(&self, snap_minutes: Option<u32>, arch_minute: Option<u32>) {
        let mut t = self.snap_times.lock();
        t.snap_minutes = snap_minutes;
        t.arch_minute = arch_minute;
    }

    /// Read the label of data block `addr`
    pub fn read_label(&self, addr: u32) -> Result<shale_core::Label> {
        self.core.cache.label(addr)
    }

    /// Number of blocks in the data partition
    pub fn data_blocks(&self) -> Result<u32> {
        self.core.cache.disk().part_size(Part::Data)
    }

    /// True while a snapshot is queued or being archived
    pub fn archive_pending(&self) -> Result<bool> {
        let sup = self.super_block()?;
        Ok(sup.next != NIL_ADDR || sup.current != NIL_ADDR)
    }

    /// Wait until the archiver has drained, polling the super-block
    pub fn await_archive(&self, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        while self.archive_pending()? {
            if start.elapsed() > timeout {
                return Err(Error::Depot("archiver did not drain in time".into()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn stop_tasks(&self) {
        if let Some(p) = self.meta_flush.lock().take() {
            p.kill();
        }
        if let Some(p) = self.snap_sched.lock().take() {
            p.kill();
        }
        {
            let mut g = self.core.arch.lock.lock();
            g.shutdown = true;
            drop(g);
            self.core.arch.cv.notify_all();
        }
        if let Some(h) = self.arch_thread.lock().take() {
            let _ = h.join();
        }
    }

    /// Shut down: stop the periodic tasks and the archiver, then drain
    /// the cache
    pub fn close(self) -> Result<()> {
        self.stop_tasks();
        self.core.cache.close()
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        // close() already ran this for the normal path; a dropped handle
        // still has to take its threads down with it
        self.stop_tasks();
    }
}
