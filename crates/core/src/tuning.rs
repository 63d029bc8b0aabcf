//! Runtime-tuneable constants
//!
//! These probably should not be constants, so they are not: callers can
//! override any of them through `Tuning` at open time. The defaults match
//! long-standing practice.

use std::time::Duration;

/// Tuneable parameters carried by the cache and file system
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Estimate of bytes per directory entry; sizes directory read-ahead
    pub bytes_per_entry: usize,
    /// Don't allocate into a block more than this percent full
    pub full_percentage: usize,
    /// Blocks written per flusher pass
    pub flush_size: usize,
    /// Maximum percentage of dirty blocks before the flusher kicks in
    pub dirty_percentage: usize,
    /// Backoff between local write retries
    pub write_retry: Duration,
    /// Backoff while the depot is unreachable
    pub arch_retry: Duration,
}

impl Default for Tuning {
    fn default() -> Tuning {
        Tuning {
            bytes_per_entry: 100,
            full_percentage: 80,
            flush_size: 200,
            dirty_percentage: 50,
            write_retry: Duration::from_secs(10),
            arch_retry: Duration::from_secs(10),
        }
    }
}
