//! Content scores
//!
//! A score is the 20-byte cryptographic hash naming a block's contents in
//! the depot. Blocks still on the local disk are addressed inside score
//! space with the *local encoding*: sixteen zero bytes followed by the
//! big-endian block address. A genuine content hash is vanishingly
//! unlikely to collide with that prefix.

use sha1::{Digest, Sha1};
use std::fmt;

/// Size of a score in bytes
pub const SCORE_SIZE: usize = 20;

/// 20-byte content hash identifying a block
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Score(pub [u8; SCORE_SIZE]);

impl Score {
    /// The all-zero score (also the local encoding of address 0)
    pub const ZERO: Score = Score([0; SCORE_SIZE]);

    /// Hash `data` into a score
    pub fn of(data: &[u8]) -> Score {
        let mut h = Sha1::new();
        h.update(data);
        Score(h.finalize().into())
    }

    /// Local encoding of a block address
    pub fn local(addr: u32) -> Score {
        let mut s = [0u8; SCORE_SIZE];
        s[16..].copy_from_slice(&addr.to_be_bytes());
        Score(s)
    }

    /// Decode the local encoding; `None` for genuine content hashes
    pub fn to_local(&self) -> Option<u32> {
        if self.0[..16].iter().all(|&b| b == 0) {
            Some(u32::from_be_bytes(self.0[16..].try_into().unwrap()))
        } else {
            None
        }
    }

    /// Read a score out of a byte slice at `off`
    pub fn read_from(buf: &[u8], off: usize) -> Score {
        let mut s = [0u8; SCORE_SIZE];
        s.copy_from_slice(&buf[off..off + SCORE_SIZE]);
        Score(s)
    }

    /// Write this score into a byte slice at `off`
    pub fn write_to(&self, buf: &mut [u8], off: usize) {
        buf[off..off + SCORE_SIZE].copy_from_slice(&self.0);
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Score({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NIL_ADDR;

    #[test]
    fn test_local_round_trip() {
        for addr in [0u32, 1, 33, 0x7fff_ffff, NIL_ADDR] {
            assert_eq!(Score::local(addr).to_local(), Some(addr));
        }
    }

    #[test]
    fn test_content_hash_is_not_local() {
        let s = Score::of(b"hello");
        assert_eq!(s.to_local(), None);
    }

    #[test]
    fn test_known_digest() {
        // sha1("hello")
        let s = Score::of(b"hello");
        assert_eq!(s.to_string(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }

    #[test]
    fn test_slice_round_trip() {
        let s = Score::of(b"x");
        let mut buf = [0u8; 64];
        s.write_to(&mut buf, 17);
        assert_eq!(Score::read_from(&buf, 17), s);
    }
}
