//! Source-layer behavior over a real (temporary) device

use shale_core::{Depot, MemDepot, Mode, Tuning};
use shale_disk::{format, FormatOpts, Header};
use shale_fs::{Fs, OpenConfig};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempfile;

const BS: usize = 512;

fn mkdev(blocks: u64) -> File {
    let file = tempfile().unwrap();
    let base = Header::partition_base(BS as u16);
    file.set_len(base + blocks * BS as u64).unwrap();
    format(&file, BS as u16, FormatOpts::new("fs-test")).unwrap();
    file
}

fn quick_tuning() -> Tuning {
    Tuning {
        arch_retry: Duration::from_millis(20),
        ..Tuning::default()
    }
}

fn open_rw(file: &File) -> Fs {
    let depot: Arc<dyn Depot> = Arc::new(MemDepot::new());
    Fs::from_file(
        file.try_clone().unwrap(),
        depot,
        OpenConfig::new(Mode::ReadWrite)
            .cache_blocks(64)
            .tuning(quick_tuning()),
    )
    .unwrap()
}

#[test]
fn test_open_fresh_fs() {
    let file = mkdev(256);
    let fs = open_rw(&file);
    assert_eq!(fs.block_size(), BS);
    assert_eq!(fs.epochs(), (1, 1));
    let root = fs.root();
    assert!(root.is_dir());
    assert_eq!(root.size().unwrap(), 0);
    fs.close().unwrap();
}

#[test]
fn test_create_write_read() {
    let file = mkdev(256);
    let fs = open_rw(&file);
    let root = fs.root();
    let f = root.create(false).unwrap();
    assert_eq!(f.write(0, b"hello").unwrap(), 5);
    assert_eq!(f.size().unwrap(), 5);

    let mut buf = [0u8; 5];
    assert_eq!(f.read(0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    // a write crossing a block boundary
    let pattern: Vec<u8> = (0..BS + 100).map(|i| i as u8).collect();
    f.write(400, &pattern).unwrap();
    let mut big = vec![0u8; BS + 100];
    assert_eq!(f.read(400, &mut big).unwrap(), BS + 100);
    assert_eq!(big, pattern);
    fs.close().unwrap();
}

#[test]
fn test_holes_read_as_zeros() {
    let file = mkdev(256);
    let fs = open_rw(&file);
    let root = fs.root();
    let f = root.create(false).unwrap();
    f.write(3 * BS as u64, b"tail").unwrap();
    let mut buf = vec![0xffu8; BS];
    assert_eq!(f.read(0, &mut buf).unwrap(), BS);
    assert!(buf.iter().all(|&b| b == 0));
    fs.close().unwrap();
}

#[test]
fn test_tree_grows_depth() {
    let file = mkdev(512);
    let fs = open_rw(&file);
    let root = fs.root();
    let f = root.create(false).unwrap();
    // pointers per block = 512/20 = 25, so block 30 needs depth 2
    let off = 30 * BS as u64;
    f.write(off, b"deep").unwrap();
    let e = f.entry().unwrap();
    assert_eq!(e.depth, 2);
    let mut buf = [0u8; 4];
    f.read(off, &mut buf).unwrap();
    assert_eq!(&buf, b"deep");
    // earlier offsets still work through the raised tree
    f.write(0, b"head").unwrap();
    f.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"head");
    fs.close().unwrap();
}

#[test]
fn test_directory_grows_past_one_block() {
    let file = mkdev(512);
    let fs = open_rw(&file);
    let root = fs.root();
    // 512-byte blocks hold 8 entries; push well past that
    let n = 20usize;
    for i in 0..n {
        let f = root.create(false).unwrap();
        f.write(0, format!("file-{i}").as_bytes()).unwrap();
    }
    for i in 0..n {
        let f = root.open(i, Mode::ReadOnly).unwrap();
        let mut buf = vec![0u8; 16];
        let got = f.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..got], format!("file-{i}").as_bytes());
    }
    fs.close().unwrap();
}

#[test]
fn test_remove_frees_slot_and_invalidates_handle() {
    let file = mkdev(256);
    let fs = open_rw(&file);
    let root = fs.root();
    let f = root.create(false).unwrap();
    let off = f.offset();
    f.write(0, b"doomed").unwrap();
    f.remove().unwrap();
    assert!(f.read(0, &mut [0u8; 4]).is_err());
    assert!(root.open(off, Mode::ReadOnly).is_err());
    // the slot is reused by the next create
    let g = root.create(false).unwrap();
    assert_eq!(g.offset(), off);
    fs.close().unwrap();
}

#[test]
fn test_persistence_across_reopen() {
    let file = mkdev(256);
    {
        let fs = open_rw(&file);
        let root = fs.root();
        let f = root.create(false).unwrap();
        f.write(0, b"durable").unwrap();
        fs.sync().unwrap();
        fs.close().unwrap();
    }
    let fs = open_rw(&file);
    let root = fs.root();
    let f = root.open(0, Mode::ReadOnly).unwrap();
    let mut buf = [0u8; 7];
    f.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"durable");
    fs.close().unwrap();
}

#[test]
fn test_old_handles_survive_snapshot() {
    let file = mkdev(512);
    let fs = open_rw(&file);
    let root = fs.root();
    let f = root.create(false).unwrap();
    f.write(0, b"one").unwrap();

    fs.snapshot(false).unwrap();

    // the pre-snapshot handle is lazily re-walked into the new epoch
    f.write(0, b"two").unwrap();
    let mut buf = [0u8; 3];
    f.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"two");

    // and the frozen copy still reads the old bytes
    let snaps = fs.snapshots();
    assert_eq!(snaps.len(), 1);
    let snap_root = fs.snapshot_root(&snaps[0]).unwrap();
    let frozen = snap_root.open(0, Mode::ReadOnly).unwrap();
    frozen.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"one");
    // frozen sources refuse writes
    assert!(frozen.write(0, b"nope").is_err());
    fs.close().unwrap();
}

#[test]
fn test_next_qid_is_monotonic_and_durable() {
    let file = mkdev(256);
    let a;
    let b;
    {
        let fs = open_rw(&file);
        a = fs.next_qid().unwrap();
        b = fs.next_qid().unwrap();
        assert_eq!(b, a + 1);
        fs.sync().unwrap();
        fs.close().unwrap();
    }
    let fs = open_rw(&file);
    let c = fs.next_qid().unwrap();
    assert!(c > b);
    fs.close().unwrap();
}

#[test]
fn test_read_only_mount_refuses_mutation() {
    let file = mkdev(256);
    {
        let fs = open_rw(&file);
        let root = fs.root();
        let f = root.create(false).unwrap();
        f.write(0, b"ro").unwrap();
        fs.sync().unwrap();
        fs.close().unwrap();
    }
    let depot: Arc<dyn Depot> = Arc::new(MemDepot::new());
    let fs = Fs::from_file(
        file.try_clone().unwrap(),
        depot,
        OpenConfig::new(Mode::ReadOnly).cache_blocks(64),
    )
    .unwrap();
    let root = fs.root();
    let f = root.open(0, Mode::ReadOnly).unwrap();
    let mut buf = [0u8; 2];
    f.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"ro");
    assert!(root.create(false).is_err());
    assert!(fs.snapshot(false).is_err());
    fs.close().unwrap();
}
