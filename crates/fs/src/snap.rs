//! Snapshot publication and scheduling
//!
//! The core freezes trees; naming them and wiring them into a name
//! space belongs to the upper layer, reached through [`SnapshotSink`].
//! The conventional names (`/snapshot/yyyy/mmdd/hhmm` for temporary
//! snapshots, `/archive/yyyy/mmdd` for archival ones) are policy, not
//! protocol; sinks are free to ignore them.
//!
//! The scheduler ticks every ten seconds: plain snapshots fire every
//! `snap_minutes` minutes, archival snapshots at `arch_minute` of the
//! local day. A missed slot (the machine was down) waits for the next
//! one rather than firing late.

use crate::fs::FsCore;
use chrono::{DateTime, Datelike, Local, Timelike};
use parking_lot::Mutex;
use shale_core::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// A frozen snapshot as handed to the sink
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    /// Epoch the tree was frozen at
    pub epoch: u32,
    /// Data-partition address of the frozen root block
    pub root: u32,
    /// The snapshot is queued for the depot
    pub archive: bool,
    /// Conventional name for the upper layer
    pub name: String,
    /// Qid watermark saved with archival snapshots
    pub qid_max: u64,
}

/// Where published snapshots go (the upper file tree in a full system)
pub trait SnapshotSink: Send + Sync {
    /// A snapshot has been frozen; wire it into the name space
    fn publish(&self, info: &SnapshotInfo) -> Result<()>;
}

/// Default sink: log and drop
pub struct NullSink;

impl SnapshotSink for NullSink {
    fn publish(&self, info: &SnapshotInfo) -> Result<()> {
        debug!(epoch = info.epoch, name = %info.name, "snapshot published");
        Ok(())
    }
}

/// Conventional snapshot name for `now`
pub fn snapshot_name(now: DateTime<Local>, archive: bool) -> String {
    if archive {
        format!(
            "/archive/{:04}/{:02}{:02}",
            now.year(),
            now.month(),
            now.day()
        )
    } else {
        format!(
            "/snapshot/{:04}/{:02}{:02}/{:02}{:02}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute()
        )
    }
}

/// Scheduler state
pub(crate) struct SnapTimes {
    pub snap_minutes: Option<u32>,
    pub arch_minute: Option<u32>,
    /// Minute stamp of the last plain snapshot, to fire once per slot
    pub last_snap: u32,
    /// Minute stamp of the last archival snapshot
    pub last_arch: u32,
}

/// One scheduler tick
pub(crate) fn snap_tick(core: &Arc<FsCore>, times: &Mutex<SnapTimes>) {
    let now = Local::now();
    let now_min = (now.timestamp() / 60) as u32;
    let mut t = times.lock();

    if let Some(every) = t.snap_minutes {
        if every != 0 && now_min % every == 0 && t.last_snap != now_min {
            if let Err(e) = crate::fs::snapshot(core, false) {
                warn!(%e, "scheduled snapshot failed");
            }
            t.last_snap = now_min;
        }
    }

    if let Some(at) = t.arch_minute {
        let minute_of_day = now.hour() * 60 + now.minute();
        if minute_of_day == at && t.last_arch != now_min {
            if let Err(e) = crate::fs::snapshot(core, true) {
                warn!(%e, "scheduled archive snapshot failed");
            }
            t.last_arch = now_min;
        }
    }
}
