//! Quantified invariants: epoch bounds, closure ordering, durability
//! round trips, and a randomized reference-model equivalence check

use crate::util::*;
use proptest::prelude::*;
use shale::{Disk, MemDepot, Mode};
use std::sync::Arc;

#[test]
fn test_reachable_blocks_respect_epoch_high() {
    let file = mkdev_small(512);
    let depot = Arc::new(MemDepot::new());
    let fs = open_rw(&file, &depot);
    let root = fs.root();
    for i in 0..4 {
        let f = root.create(false).unwrap();
        f.write(0, format!("payload-{i}").as_bytes()).unwrap();
        if i % 2 == 0 {
            fs.snapshot(false).unwrap();
        }
    }
    fs.sync().unwrap();

    let (high, _) = fs.epochs();
    let sup = fs.super_block().unwrap();
    let disk = Disk::open(file.try_clone().unwrap()).unwrap();
    let blocks = reachable(&disk, sup.active);
    assert!(!blocks.is_empty());
    for (addr, label) in blocks {
        assert!(label.state.is_allocated(), "reachable block {addr} is free");
        assert!(
            label.epoch <= high,
            "block {addr} born at {} after epoch {high}",
            label.epoch
        );
    }
    fs.close().unwrap();
}

#[test]
fn test_closure_is_always_after_birth() {
    let file = mkdev_small(512);
    let depot = Arc::new(MemDepot::new());
    let fs = open_rw(&file, &depot);
    let root = fs.root();
    let f = root.create(false).unwrap();
    // churn across several epochs so plenty of blocks close
    for round in 0..5u8 {
        f.write(0, &[round; 64]).unwrap();
        fs.snapshot(false).unwrap();
        f.write(0, &[round ^ 0xff; 64]).unwrap();
    }
    fs.sync().unwrap();

    let n = fs.data_blocks().unwrap();
    for addr in 0..n {
        let l = fs.read_label(addr).unwrap();
        if l.epoch_close != 0 {
            assert!(
                l.epoch_close > l.epoch,
                "block {addr} closed at {} but born at {}",
                l.epoch_close,
                l.epoch
            );
        }
    }
    fs.close().unwrap();
}

#[test]
fn test_snapshot_blocks_respect_snapshot_epoch() {
    let file = mkdev_small(512);
    let depot = Arc::new(MemDepot::new());
    let fs = open_rw(&file, &depot);
    let root = fs.root();
    let f = root.create(false).unwrap();
    f.write(0, b"frozen payload").unwrap();
    fs.snapshot(false).unwrap();
    f.write(0, b"newer payload!").unwrap();
    fs.sync().unwrap();

    let snap = &fs.snapshots()[0];
    let disk = Disk::open(file.try_clone().unwrap()).unwrap();
    for (addr, label) in reachable(&disk, snap.root) {
        assert!(
            label.epoch <= snap.epoch,
            "snapshot block {addr} from epoch {} leaked into snapshot {}",
            label.epoch,
            snap.epoch
        );
    }
    fs.close().unwrap();
}

#[test]
fn test_reopen_round_trip_preserves_data_and_labels() {
    let file = mkdev_small(512);
    let depot = Arc::new(MemDepot::new());
    let mut contents = Vec::new();
    let nlabels;
    let labels_before: Vec<_>;
    {
        let fs = open_rw(&file, &depot);
        let root = fs.root();
        for i in 0..6u8 {
            let f = root.create(false).unwrap();
            let body = vec![i.wrapping_mul(37); 300 + i as usize * 91];
            f.write(0, &body).unwrap();
            contents.push(body);
        }
        fs.snapshot(false).unwrap();
        fs.sync().unwrap();
        nlabels = fs.data_blocks().unwrap();
        labels_before = (0..nlabels).map(|a| fs.read_label(a).unwrap()).collect();
        fs.close().unwrap();
    }

    let fs = open_rw(&file, &depot);
    let root = fs.root();
    for (i, body) in contents.iter().enumerate() {
        let f = root.open(i, Mode::ReadOnly).unwrap();
        let mut got = vec![0u8; body.len()];
        assert_eq!(f.read(0, &mut got).unwrap(), body.len());
        assert_eq!(&got, body, "source {i} changed across reopen");
    }
    for addr in 0..nlabels {
        assert_eq!(
            fs.read_label(addr).unwrap(),
            labels_before[addr as usize],
            "label {addr} changed across reopen"
        );
    }
    fs.close().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Random writes against a plain in-memory model, with snapshots
    /// and a remount thrown in, read back identically.
    #[test]
    fn prop_source_matches_reference_model(
        ops in prop::collection::vec(
            (0u64..6000, prop::collection::vec(any::<u8>(), 1..400), any::<bool>()),
            1..10,
        )
    ) {
        let file = mkdev_small(1024);
        let depot = Arc::new(MemDepot::new());
        let mut model: Vec<u8> = Vec::new();

        {
            let fs = open_rw(&file, &depot);
            let root = fs.root();
            let f = root.create(false).unwrap();
            for (offset, data, snap) in &ops {
                f.write(*offset, data).unwrap();
                let end = *offset as usize + data.len();
                if model.len() < end {
                    model.resize(end, 0);
                }
                model[*offset as usize..end].copy_from_slice(data);
                if *snap {
                    fs.snapshot(false).unwrap();
                }

                let mut got = vec![0u8; model.len()];
                prop_assert_eq!(f.read(0, &mut got).unwrap(), model.len());
                prop_assert_eq!(&got, &model);
            }
            fs.sync().unwrap();
            fs.close().unwrap();
        }

        // remount and compare once more
        let fs = open_rw(&file, &depot);
        let root = fs.root();
        let f = root.open(0, Mode::ReadOnly).unwrap();
        let mut got = vec![0u8; model.len()];
        prop_assert_eq!(f.read(0, &mut got).unwrap(), model.len());
        prop_assert_eq!(&got, &model);
        fs.close().unwrap();
    }
}
