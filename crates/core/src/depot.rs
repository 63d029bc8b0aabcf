//! Depot: the external content-addressed store seam
//!
//! The archiver pushes frozen blocks here and the cache pulls archived
//! blocks back on demand. The wire protocol behind the trait is out of
//! scope; implementations are expected to be shared read-only after
//! initialization and may block for unbounded time.

use crate::error::{Error, Result};
use crate::score::Score;
use crate::types::BlockType;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Session with the external content-addressed store
pub trait Depot: Send + Sync {
    /// Store `data`, returning the score it is now addressable by
    fn write(&self, typ: BlockType, data: &[u8]) -> Result<Score>;

    /// Fetch the block named `score` into `buf`; returns the stored length
    fn read(&self, score: Score, typ: BlockType, buf: &mut [u8]) -> Result<usize>;

    /// (Re-)establish the session
    fn connect(&self) -> Result<()>;

    /// Point the session at a different host, then `connect`
    fn redial(&self, host: &str) -> Result<()>;
}

/// Verify that `score` names `data`
pub fn score_check(score: Score, data: &[u8]) -> Result<()> {
    let actual = Score::of(data);
    if actual != score {
        return Err(Error::Depot(format!(
            "score mismatch: expected {score}, stored data hashes to {actual}"
        )));
    }
    Ok(())
}

/// In-memory depot for tests and single-host use
///
/// `set_offline(true)` makes every call fail, which is how tests exercise
/// the archiver's pause-and-retry path.
#[derive(Default)]
pub struct MemDepot {
    blocks: Mutex<HashMap<Score, (u8, Vec<u8>)>>,
    offline: Mutex<bool>,
}

impl MemDepot {
    /// Create an empty depot
    pub fn new() -> MemDepot {
        MemDepot::default()
    }

    /// Toggle simulated unreachability
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// True if nothing has been stored
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// True if `score` is present
    pub fn contains(&self, score: Score) -> bool {
        self.blocks.lock().contains_key(&score)
    }

    fn check_online(&self) -> Result<()> {
        if *self.offline.lock() {
            return Err(Error::Depot("depot unreachable".into()));
        }
        Ok(())
    }
}

impl Depot for MemDepot {
    fn write(&self, typ: BlockType, data: &[u8]) -> Result<Score> {
        self.check_online()?;
        let score = Score::of(data);
        self.blocks
            .lock()
            .insert(score, (typ.to_byte(), data.to_vec()));
        Ok(score)
    }

    fn read(&self, score: Score, typ: BlockType, buf: &mut [u8]) -> Result<usize> {
        self.check_online()?;
        let blocks = self.blocks.lock();
        let (stored_typ, data) = blocks
            .get(&score)
            .ok_or_else(|| Error::Depot(format!("no block {score}")))?;
        if *stored_typ != typ.to_byte() {
            return Err(Error::Depot(format!(
                "block {score} stored with type {stored_typ:#x}, wanted {:#x}",
                typ.to_byte()
            )));
        }
        if data.len() > buf.len() {
            return Err(Error::Depot(format!(
                "block {score} is {} bytes, buffer holds {}",
                data.len(),
                buf.len()
            )));
        }
        buf[..data.len()].copy_from_slice(data);
        buf[data.len()..].fill(0);
        Ok(data.len())
    }

    fn connect(&self) -> Result<()> {
        self.check_online()
    }

    fn redial(&self, _host: &str) -> Result<()> {
        self.check_online()
    }
}
