//! Shared helpers: devices, mounts, and a raw on-disk walker

use shale::{
    format, format_with_header, Depot, Disk, Entry, FormatOpts, Fs, Header, Label, MemDepot, Mode,
    OpenConfig, Score, Tuning, ENTRY_SIZE, LABEL_SIZE, NIL_ADDR, SCORE_SIZE,
};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempfile;

/// Geometry from the format-and-mount scenario
pub fn s1_header() -> Header {
    Header {
        version: 1,
        block_size: 8192,
        super_: 0,
        label: 1,
        data: 33,
        end: 1057,
    }
}

/// Device with the scenario geometry (8 KiB blocks)
pub fn mkdev_8k() -> File {
    let file = tempfile().unwrap();
    format_with_header(&file, s1_header(), FormatOpts::new("scenario")).unwrap();
    file
}

/// Small 512-byte-block device for cheap tests
pub fn mkdev_small(blocks: u64) -> File {
    let file = tempfile().unwrap();
    let base = Header::partition_base(512);
    file.set_len(base + blocks * 512).unwrap();
    format(&file, 512, FormatOpts::new("small")).unwrap();
    file
}

pub fn quick_tuning() -> Tuning {
    Tuning {
        arch_retry: Duration::from_millis(20),
        ..Tuning::default()
    }
}

pub fn open_rw(file: &File, depot: &Arc<MemDepot>) -> Fs {
    let _ = tracing_subscriber::fmt().try_init();
    Fs::from_file(
        file.try_clone().unwrap(),
        Arc::clone(depot) as Arc<dyn Depot>,
        OpenConfig::new(Mode::ReadWrite)
            .cache_blocks(128)
            .tuning(quick_tuning()),
    )
    .unwrap()
}

/// Read a label straight off the device
pub fn raw_label(disk: &Disk, addr: u32) -> Label {
    let bs = disk.block_size();
    let lpb = bs / LABEL_SIZE;
    let mut buf = vec![0u8; bs];
    disk.read(shale::Part::Label, addr / lpb as u32, &mut buf)
        .unwrap();
    Label::unpack(&buf[(addr as usize % lpb) * LABEL_SIZE..]).unwrap()
}

/// Every local block reachable from the tree rooted at `start`,
/// following pointer blocks and active local entries (the raw walk the
/// invariant sweeps use; run it on a synced device)
pub fn reachable(disk: &Disk, start: u32) -> Vec<(u32, Label)> {
    let bs = disk.block_size();
    let mut out = Vec::new();
    let mut stack = vec![start];
    let mut seen = std::collections::HashSet::new();
    while let Some(addr) = stack.pop() {
        if !seen.insert(addr) {
            continue;
        }
        let label = raw_label(disk, addr);
        out.push((addr, label));
        let mut buf = vec![0u8; bs];
        disk.read(shale::Part::Data, addr, &mut buf).unwrap();
        if label.typ.level > 0 {
            for i in 0..bs / SCORE_SIZE {
                let s = Score::read_from(&buf, i * SCORE_SIZE);
                if s == Score::ZERO {
                    continue;
                }
                if let Some(a) = s.to_local() {
                    if a != NIL_ADDR {
                        stack.push(a);
                    }
                }
            }
        } else if label.typ.dir {
            for i in 0..bs / ENTRY_SIZE {
                if label.tag == shale::ROOT_TAG && i == 1 {
                    // entry 1 of a root block is the old-root hint; that
                    // chain belongs to retired snapshots, not this tree
                    continue;
                }
                let Ok(e) = Entry::unpack(&buf, i * ENTRY_SIZE) else {
                    continue;
                };
                if !e.is_active() || !e.is_local() || e.score == Score::ZERO {
                    continue;
                }
                if let Some(a) = e.score.to_local() {
                    if a != NIL_ADDR {
                        stack.push(a);
                    }
                }
            }
        }
    }
    out
}

/// Count free labels on the device
pub fn count_free(fs: &Fs) -> usize {
    let n = fs.data_blocks().unwrap();
    (0..n)
        .filter(|&a| fs.read_label(a).unwrap().state == shale::BlockState::Free)
        .count()
}
