//! The format/mount, snapshot, copy-on-write, archive, crash, and
//! reclamation stories, end to end

use crate::util::*;
use shale::{Disk, MemDepot, Mode, Score, Super, SUPER_SIZE};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_s1_format_and_mount() {
    let file = mkdev_8k();

    // the header reads back byte-exact
    let disk = Disk::open(file.try_clone().unwrap()).unwrap();
    assert_eq!(*disk.header(), s1_header());
    assert_eq!(disk.block_size(), 8192);

    let depot = Arc::new(MemDepot::new());
    let fs = open_rw(&file, &depot);
    assert_eq!(fs.block_size(), 8192);
    let root = fs.root();
    assert!(root.is_dir());
    assert_eq!(root.size().unwrap(), 0, "the fresh root is empty");
    fs.close().unwrap();
}

#[test]
fn test_s2_write_then_snapshot() {
    let file = mkdev_8k();
    let depot = Arc::new(MemDepot::new());
    let fs = open_rw(&file, &depot);
    let root = fs.root();
    let f = root.create(false).unwrap();
    f.write(0, b"hello").unwrap();

    let (pre, _) = fs.epochs();
    fs.snapshot(false).unwrap();
    let (post, _) = fs.epochs();
    // one bump for a plain snapshot; archival snapshots bump twice
    assert_eq!(post, pre + 1);

    let snaps = fs.snapshots();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].epoch, pre);
    assert!(snaps[0].name.starts_with("/snapshot/"));

    let snap_root = fs.snapshot_root(&snaps[0]).unwrap();
    let frozen = snap_root.open(0, Mode::ReadOnly).unwrap();
    let mut buf = [0u8; 5];
    frozen.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
    fs.close().unwrap();
}

#[test]
fn test_s3_copy_on_write() {
    let file = mkdev_8k();
    let depot = Arc::new(MemDepot::new());
    let fs = open_rw(&file, &depot);
    let root = fs.root();
    let f = root.create(false).unwrap();
    f.write(0, b"hello").unwrap();

    let (pre, _) = fs.epochs();
    fs.snapshot(false).unwrap();

    // remember where the frozen copy's data block lives
    let snaps = fs.snapshots();
    let snap_root = fs.snapshot_root(&snaps[0]).unwrap();
    let frozen = snap_root.open(0, Mode::ReadOnly).unwrap();
    let frozen_addr = frozen.entry().unwrap().score.to_local().unwrap();

    f.write(0, b"world").unwrap();

    let mut buf = [0u8; 5];
    frozen.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello", "the snapshot still reads the old bytes");
    f.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"world", "the active copy reads the new bytes");

    // the duplicated block: allocated, marked copied, at the
    // pre-snapshot epoch
    let l = fs.read_label(frozen_addr).unwrap();
    assert!(l.state.is_allocated());
    assert!(l.copied);
    assert_eq!(l.epoch, pre);
    fs.close().unwrap();
}

#[test]
fn test_s4_archive_round_trip() {
    let file = mkdev_8k();
    let depot = Arc::new(MemDepot::new());
    let fs = open_rw(&file, &depot);
    let root = fs.root();
    let f = root.create(false).unwrap();
    f.write(0, b"hello").unwrap();
    let data_addr = f.entry().unwrap().score.to_local().unwrap();

    let (pre, _) = fs.epochs();
    fs.snapshot(true).unwrap();
    let (post, _) = fs.epochs();
    assert_eq!(post, pre + 2, "archival snapshots bump twice");

    fs.await_archive(Duration::from_secs(10)).unwrap();

    let sup = fs.super_block().unwrap();
    assert_ne!(sup.last, Score::ZERO);
    assert!(
        depot.contains(sup.last),
        "super.last names the archived root in the depot"
    );
    assert!(!fs.archive_pending().unwrap());

    // blocks of the archived subtree carry the archived state
    let snaps = fs.snapshots();
    let arch = snaps.iter().find(|s| s.archive).unwrap();
    assert!(fs.read_label(data_addr).unwrap().state.is_archived());

    // the archived snapshot reads back through depot scores
    let snap_root = fs.snapshot_root(arch).unwrap();
    let frozen = snap_root.open(0, Mode::ReadOnly).unwrap();
    let mut buf = [0u8; 5];
    frozen.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
    fs.close().unwrap();
}

#[test]
fn test_s5_crash_between_root_and_super() {
    let file = mkdev_small(512);
    let depot = Arc::new(MemDepot::new());
    {
        let fs = open_rw(&file, &depot);
        let root = fs.root();
        let f = root.create(false).unwrap();
        f.write(0, b"sturdy").unwrap();
        fs.sync().unwrap();
        fs.close().unwrap();
    }

    // Simulate the torn epoch bump: the super-block went out with the
    // new high epoch and the rolled-back (old) root address, and the new
    // root block never landed.
    let disk = Disk::open(file.try_clone().unwrap()).unwrap();
    let mut buf = vec![0u8; disk.block_size()];
    disk.read(shale::Part::Super, 0, &mut buf).unwrap();
    let mut sup = Super::unpack(&buf[..SUPER_SIZE]).unwrap();
    let crashed_epoch = sup.epoch_high + 1;
    sup.epoch_high = crashed_epoch;
    sup.pack(&mut buf[..SUPER_SIZE]);
    disk.write(shale::Part::Super, 0, &buf).unwrap();
    drop(disk);

    // recovery copies the lagging root forward
    let fs = open_rw(&file, &depot);
    assert_eq!(fs.epochs().0, crashed_epoch);
    let root = fs.root();
    let f = root.open(0, Mode::ReadOnly).unwrap();
    let mut out = [0u8; 6];
    f.read(0, &mut out).unwrap();
    assert_eq!(&out, b"sturdy");

    // and the tree is mutable again at the recovered epoch
    let g = root.create(false).unwrap();
    g.write(0, b"post-crash").unwrap();
    fs.sync().unwrap();

    // labels agree with the super-block
    let n = fs.data_blocks().unwrap();
    for addr in 0..n {
        let l = fs.read_label(addr).unwrap();
        if l.state.is_allocated() {
            assert!(l.epoch <= crashed_epoch);
        }
        if l.epoch_close != 0 {
            assert!(l.epoch_close > l.epoch);
        }
    }
    fs.close().unwrap();
}

#[test]
fn test_s6_reclamation() {
    let file = mkdev_small(512);
    let depot = Arc::new(MemDepot::new());
    let fs = open_rw(&file, &depot);
    let root = fs.root();
    let f = root.create(false).unwrap();
    f.write(0, b"aaaa").unwrap();

    fs.snapshot(true).unwrap();
    fs.await_archive(Duration::from_secs(10)).unwrap();

    // push the active copy past the snapshot so the old path closes
    f.write(0, b"bbbb").unwrap();
    fs.sync().unwrap();

    let free_before = count_free(&fs);
    let n = fs.data_blocks().unwrap();
    let closed_archived: Vec<u32> = (0..n)
        .filter(|&a| {
            let l = fs.read_label(a).unwrap();
            l.state.is_closed() && l.state.is_archived()
        })
        .collect();
    assert!(
        !closed_archived.is_empty(),
        "superseded path blocks close as archived snapshot blocks"
    );

    let (high, _) = fs.epochs();
    fs.epoch_low(high).unwrap();

    let free_after = count_free(&fs);
    assert!(free_after > free_before, "reclamation frees blocks");
    for addr in closed_archived {
        assert_eq!(
            fs.read_label(addr).unwrap().state,
            shale::BlockState::Free,
            "archived snapshot block {addr} was not reclaimed"
        );
    }
    // nothing below the watermark survives in the closed state
    for addr in 0..n {
        let l = fs.read_label(addr).unwrap();
        if l.epoch_close != 0 {
            assert!(l.epoch_close > high);
        }
    }

    // nothing reachable from the active root names a freed block
    fs.sync().unwrap();
    let sup = fs.super_block().unwrap();
    let disk = Disk::open(file.try_clone().unwrap()).unwrap();
    for (addr, label) in reachable(&disk, sup.active) {
        assert!(
            label.state.is_allocated(),
            "reachable block {addr} is freed"
        );
    }

    // the active data still reads
    let mut buf = [0u8; 4];
    f.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"bbbb");
    fs.close().unwrap();
}
