//! The archiver
//!
//! A dedicated thread that walks the subtree rooted at `super.next` in
//! post-order and pushes each block to the depot. Before a block is
//! stored, every local child pointer (or entry) in it is patched to the
//! child's depot score, so the stored image is self-contained; the
//! patched image is also written back locally. Labels move through
//! `fixed` (pointers all global) to `archived` (score acknowledged), so
//! partial progress survives a crash and the walk is idempotent.
//!
//! When the depot is unreachable the walk pauses and retries; only
//! process exit interrupts it for good.

use crate::fs::FsCore;
use shale_core::{
    score_check, BlockType, Entry, Mode, Result, Score, ENTRY_LOCAL, ENTRY_SIZE, NIL_ADDR,
    ROOT_TAG, SCORE_SIZE,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Archiver thread body
pub(crate) fn run(core: Arc<FsCore>) {
    debug!("archiver up");
    loop {
        {
            let mut g = core.arch.lock.lock();
            if g.shutdown {
                break;
            }
            if !g.kick {
                let _ = core.arch.cv.wait_for(&mut g, Duration::from_secs(60));
            }
            if g.shutdown {
                break;
            }
            g.kick = false;
        }
        match pass(&core) {
            Ok(()) => {}
            Err(e) if e.is_depot() => {
                warn!(%e, "depot unreachable; archiver pausing");
                let mut g = core.arch.lock.lock();
                if !g.shutdown {
                    let _ = core
                        .arch
                        .cv
                        .wait_for(&mut g, core.tuning.arch_retry.min(Duration::from_secs(600)));
                    g.kick = true;
                }
            }
            Err(e) => {
                warn!(%e, "archiver pass failed");
            }
        }
    }
    debug!("archiver down");
}

/// Archive every queued snapshot; returns once the queue is empty
fn pass(core: &Arc<FsCore>) -> Result<()> {
    loop {
        let work = {
            let _ep = core.elk.read();
            let (b, mut sup) = core.super_get()?;
            if sup.current == NIL_ADDR && sup.next != NIL_ADDR {
                sup.current = sup.next;
                sup.next = NIL_ADDR;
                core.super_put(b, &sup, true)?;
            } else {
                drop(b);
            }
            sup.current
        };
        if work == NIL_ADDR {
            return Ok(());
        }
        info!(root = work, "archiving snapshot");
        let score = walk_block(core, work, BlockType::dir(0), ROOT_TAG)?;
        {
            let _ep = core.elk.read();
            let (b, mut sup) = core.super_get()?;
            sup.last = score;
            sup.current = NIL_ADDR;
            core.super_put(b, &sup, true)?;
        }
        info!(root = work, %score, "snapshot archived");
    }
}

/// Store the tree rooted at `(addr, typ, tag)` and return its score
fn walk_block(core: &Arc<FsCore>, addr: u32, typ: BlockType, tag: u32) -> Result<Score> {
    let b = core
        .cache
        .local(addr, Some(typ), tag, Mode::ReadWrite, 0)?;
    if b.label().state.is_archived() {
        // Stored on a previous pass; its image is already pointer-fixed,
        // so its score is just the hash of what we hold.
        let data = b.data().to_vec();
        return Ok(Score::of(&data));
    }

    if typ.level > 0 {
        // pointer block: children first, then patch the slots
        let nptr = core.block_size / SCORE_SIZE;
        let child_typ = typ.child().expect("pointer blocks have children");
        for i in 0..nptr {
            let s = {
                let data = b.data();
                Score::read_from(&data, i * SCORE_SIZE)
            };
            if s == Score::ZERO {
                continue;
            }
            let Some(child_addr) = s.to_local() else {
                continue; // already global
            };
            if child_addr == NIL_ADDR {
                continue;
            }
            let child_score = walk_block(core, child_addr, child_typ, tag)?;
            {
                let mut data = b.data_mut();
                child_score.write_to(&mut data, i * SCORE_SIZE);
            }
            b.dirty();
        }
    } else if typ.dir {
        // directory leaf: archive each entry's tree
        let epb = core.block_size / ENTRY_SIZE;
        for i in 0..epb {
            let e = {
                let data = b.data();
                Entry::unpack(&data, i * ENTRY_SIZE)
            };
            let Ok(mut e) = e else { continue };
            if !e.is_active() || !e.is_local() {
                continue;
            }
            if e.score != Score::ZERO {
                let Some(child_addr) = e.score.to_local() else {
                    continue;
                };
                if child_addr == NIL_ADDR {
                    continue;
                }
                // A reclaimed or reused target means the entry belongs
                // to a retired snapshot chain; leave it alone.
                match core.cache.label(child_addr) {
                    Ok(l) if l.state.is_allocated() && l.tag == e.tag => {}
                    _ => {
                        debug!(addr = child_addr, "skipping retired entry target");
                        continue;
                    }
                }
                let child_typ = BlockType {
                    dir: e.is_dir(),
                    level: e.depth,
                };
                e.score = walk_block(core, child_addr, child_typ, e.tag)?;
            }
            e.tag = 0;
            e.flags &= !ENTRY_LOCAL;
            {
                let mut data = b.data_mut();
                e.pack(&mut data, i * ENTRY_SIZE);
            }
            b.dirty();
        }
    }

    // All outgoing pointers are depot scores now: the block is fixed,
    // then stored, then marked archived once the score checks out.
    let mut l = b.label();
    l.state = l.state.fixed()?;
    core.cache.set_label(addr, &l)?;

    let data = b.data().to_vec();
    let score = core.cache.depot().write(typ, &data)?;
    score_check(score, &data)?;

    let mut l = b.label();
    l.state = l.state.archived()?;
    core.cache.set_label(addr, &l)?;
    trace!(addr, %score, "block archived");
    Ok(score)
}
