//! Cache behavior: gets, dirty tracking, write ordering, eviction

use shale_cache::{Cache, CacheConfig, IoState, Rollback};
use shale_core::{
    BlockState, BlockType, Depot, Label, MemDepot, Mode, Part, Score, Tuning, ROOT_TAG, USER_TAG,
};
use shale_disk::{format, Disk, FormatOpts, Header};
use std::fs::File;
use std::sync::Arc;
use tempfile::tempfile;

const BS: usize = 512;

fn mkdev() -> File {
    let file = tempfile().unwrap();
    let base = Header::partition_base(BS as u16);
    file.set_len(base + 256 * BS as u64).unwrap();
    format(&file, BS as u16, FormatOpts::new("cache-test")).unwrap();
    file
}

fn cache_over(file: &File, nblocks: usize) -> (Cache, Arc<MemDepot>) {
    let disk = Arc::new(Disk::open(file.try_clone().unwrap()).unwrap());
    let depot = Arc::new(MemDepot::new());
    let cache = Cache::new(
        disk,
        Arc::clone(&depot) as Arc<dyn Depot>,
        CacheConfig {
            nblocks,
            mode: Mode::ReadWrite,
            tuning: Tuning::default(),
        },
    );
    (cache, depot)
}

#[test]
fn test_get_dirty_flush_round_trip() {
    let file = mkdev();
    {
        let (cache, _) = cache_over(&file, 32);
        let b = cache.get(Part::Data, 5, Mode::ReadWrite).unwrap();
        {
            let mut d = b.data_mut();
            d.fill(0x5a);
        }
        b.dirty();
        drop(b);
        cache.flush(1).unwrap();
        assert_eq!(cache.ndirty(), 0);
        cache.close().unwrap();
    }
    // a fresh cache over the same device sees the data
    let (cache, _) = cache_over(&file, 32);
    let b = cache.get(Part::Data, 5, Mode::ReadOnly).unwrap();
    assert!(b.data().iter().all(|&x| x == 0x5a));
}

#[test]
fn test_hit_serves_from_memory() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 32);
    let b = cache.get(Part::Data, 9, Mode::ReadWrite).unwrap();
    {
        let mut d = b.data_mut();
        d[0] = 0x77;
    }
    b.dirty();
    drop(b);
    // not flushed yet, so this must come from the slot, not the disk
    let b = cache.get(Part::Data, 9, Mode::ReadOnly).unwrap();
    assert_eq!(b.data()[0], 0x77);
    assert_eq!(b.iostate(), IoState::Dirty);
}

#[test]
fn test_label_set_and_read_back() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 32);
    let l = Label {
        typ: BlockType::data(2),
        state: BlockState::Active,
        copied: false,
        tag: USER_TAG,
        epoch: 3,
        epoch_close: 0,
    };
    let lb = cache.set_label(17, &l).unwrap();
    drop(lb);
    assert_eq!(cache.label(17).unwrap(), l);
    cache.flush(1).unwrap();
    assert_eq!(cache.label(17).unwrap(), l);
}

#[test]
fn test_local_validates_label() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 32);
    // block 40 is free: not gettable through the validated path
    assert!(cache
        .local(40, Some(BlockType::data(0)), USER_TAG, Mode::ReadOnly, 0)
        .is_err());
    // the root block is real, but the wrong tag must be rejected
    assert!(cache
        .local(0, Some(BlockType::dir(0)), USER_TAG, Mode::ReadOnly, 0)
        .is_err());
    assert!(cache
        .local(0, Some(BlockType::dir(0)), ROOT_TAG, Mode::ReadOnly, 0)
        .is_ok());
    // epoch constraint
    assert!(cache
        .local(0, Some(BlockType::dir(0)), ROOT_TAG, Mode::ReadOnly, 7)
        .is_err());
}

#[test]
fn test_alloc_block_claims_and_zeroes() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 32);
    let b = cache.alloc_block(BlockType::data(0), USER_TAG, 1).unwrap();
    let addr = b.addr();
    assert_ne!(addr, 0, "block 0 belongs to the root");
    assert!(b.data().iter().all(|&x| x == 0));
    assert_eq!(b.iostate(), IoState::Dirty);
    let l = b.label();
    assert_eq!(l.state, BlockState::Active);
    assert_eq!(l.tag, USER_TAG);
    assert_eq!(l.epoch, 1);
    drop(b);
    assert_eq!(cache.label(addr).unwrap().state, BlockState::Active);
}

#[test]
fn test_copy_block_marks_old_copied() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 32);
    let b = cache.alloc_block(BlockType::data(0), USER_TAG, 1).unwrap();
    let old_addr = b.addr();
    {
        let mut d = b.data_mut();
        d[..4].copy_from_slice(b"orig");
    }
    b.dirty();
    let bb = cache.copy_block(&b, USER_TAG, 2).unwrap();
    assert_ne!(bb.addr(), old_addr);
    assert_eq!(&bb.data()[..4], b"orig");
    assert_eq!(bb.label().epoch, 2);
    assert!(b.label().copied);
    assert!(!bb.label().copied);
    // copying a block already at the mutation epoch is a bug
    drop(b);
    assert!(cache.copy_block(&bb, USER_TAG, 2).is_err());
}

#[test]
fn test_rollback_writes_old_pointer_first() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 32);
    let old_score = Score::of(b"the old child");

    // parent with slot 0 naming the old child, safely on disk
    let p = cache
        .alloc_block(BlockType::data(1), USER_TAG, 1)
        .unwrap();
    let p_addr = p.addr();
    {
        let mut d = p.data_mut();
        old_score.write_to(&mut d, 0);
    }
    p.dirty();
    drop(p);
    cache.flush(1).unwrap();

    // new child, not yet on disk; repoint the parent at it
    let c = cache.alloc_block(BlockType::data(0), USER_TAG, 1).unwrap();
    let c_score = c.score();
    let p = cache.get(Part::Data, p_addr, Mode::ReadWrite).unwrap();
    {
        let mut d = p.data_mut();
        c_score.write_to(&mut d, 0);
    }
    p.dirty();
    cache.dependency(
        &p,
        &c,
        Rollback::Pointer {
            index: 0,
            old: old_score,
        },
    );

    // forcing the parent while the child is dirty writes the OLD pointer
    p.write().unwrap();
    assert_eq!(p.iostate(), IoState::Dirty, "rolled-back block stays dirty");
    let disk = Disk::open(file.try_clone().unwrap()).unwrap();
    let mut raw = vec![0u8; BS];
    disk.read(Part::Data, p_addr, &mut raw).unwrap();
    assert_eq!(Score::read_from(&raw, 0), old_score);

    // a full flush settles the child first, then the parent for real
    drop(c);
    drop(p);
    cache.flush(1).unwrap();
    disk.read(Part::Data, p_addr, &mut raw).unwrap();
    assert_eq!(Score::read_from(&raw, 0), c_score);
}

#[test]
fn test_unlink_after_write_closes_block() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 32);
    let old = cache.alloc_block(BlockType::data(0), USER_TAG, 1).unwrap();
    let old_addr = old.addr();
    drop(old);
    cache.flush(1).unwrap();

    let holder = cache.alloc_block(BlockType::data(1), USER_TAG, 1).unwrap();
    holder.dirty();
    cache.queue_unlink(&holder, old_addr, BlockType::data(0), USER_TAG, 1, 3, false);
    holder.write().unwrap();
    drop(holder);

    let l = cache.label(old_addr).unwrap();
    assert_eq!(l.state, BlockState::Snap);
    assert_eq!(l.epoch_close, 3);
    assert!(l.epoch_close > l.epoch);
}

#[test]
fn test_unlink_same_epoch_frees() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 32);
    let old = cache.alloc_block(BlockType::data(0), USER_TAG, 2).unwrap();
    let old_addr = old.addr();
    drop(old);
    cache.flush(1).unwrap();

    let holder = cache.alloc_block(BlockType::data(1), USER_TAG, 2).unwrap();
    holder.dirty();
    cache.queue_unlink(&holder, old_addr, BlockType::data(0), USER_TAG, 2, 2, false);
    holder.write().unwrap();
    drop(holder);

    assert_eq!(cache.label(old_addr).unwrap().state, BlockState::Free);
}

#[test]
fn test_eviction_under_pressure() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 8);
    // touch far more blocks than there are slots
    for addr in 0..64u32 {
        let b = cache.get(Part::Data, addr + 1, Mode::ReadWrite).unwrap();
        {
            let mut d = b.data_mut();
            d[0] = addr as u8;
        }
        b.dirty();
        drop(b);
    }
    // every block survives, evicted ones via their disk copies
    for addr in 0..64u32 {
        let b = cache.get(Part::Data, addr + 1, Mode::ReadOnly).unwrap();
        assert_eq!(b.data()[0], addr as u8);
    }
}

#[test]
fn test_remote_blocks_cached_by_score() {
    let file = mkdev();
    let (cache, depot) = cache_over(&file, 32);
    let payload = vec![0x42u8; BS];
    let score = depot.write(BlockType::data(0), &payload).unwrap();

    let b = cache
        .global(score, BlockType::data(0), 0, Mode::ReadOnly)
        .unwrap();
    assert_eq!(&b.data()[..], &payload[..]);
    assert_eq!(b.part(), Part::Remote);
    assert_eq!(b.score(), score);
    drop(b);

    // second get is served from the cache even with the depot down
    depot.set_offline(true);
    let b = cache
        .global(score, BlockType::data(0), 0, Mode::ReadOnly)
        .unwrap();
    assert_eq!(b.data()[0], 0x42);
    // depot blocks are immutable
    drop(b);
    assert!(cache
        .global(score, BlockType::data(0), 0, Mode::ReadWrite)
        .is_err());
}

#[test]
fn test_flush_level0_respects_threshold() {
    let file = mkdev();
    let (cache, _) = cache_over(&file, 32);
    for addr in 0..4u32 {
        let b = cache.get(Part::Data, addr + 1, Mode::ReadWrite).unwrap();
        b.dirty();
        drop(b);
    }
    // 4 dirty of 32 slots is far under 50%, so level 0 is a no-op
    cache.flush(0).unwrap();
    assert_eq!(cache.ndirty(), 4);
    cache.flush(1).unwrap();
    assert_eq!(cache.ndirty(), 0);
}
