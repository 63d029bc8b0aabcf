//! Super-block codec
//!
//! The super-block is the single on-disk root record: epoch watermarks,
//! the next qid, the active-tree root, the two archiver roots, the score
//! of the last successfully archived snapshot, and a human label. It
//! occupies the first 512 bytes of the one-block super partition.

use byteorder::{BigEndian, ByteOrder};
use shale_core::{Error, Result, Score, NIL_ADDR};

/// Magic number identifying a super-block
pub const SUPER_MAGIC: u32 = 0x2340_a3b1;

/// Size of the packed super-block in bytes
pub const SUPER_SIZE: usize = 512;

/// Current super-block format version
pub const SUPER_VERSION: u16 = 1;

const NAME_SIZE: usize = 128;

/// The file system's root record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Super {
    /// Format version
    pub version: u16,
    /// Reclamation watermark: snapshots at or below are retired
    pub epoch_low: u32,
    /// Current mutation epoch
    pub epoch_high: u32,
    /// Next qid to hand out
    pub qid: u64,
    /// Root of the active tree (data-partition address)
    pub active: u32,
    /// Root of the next snapshot to archive, or `NIL_ADDR`
    pub next: u32,
    /// Root of the snapshot currently archiving, or `NIL_ADDR`
    pub current: u32,
    /// Score of the last snapshot successfully archived
    pub last: Score,
    /// Human label, at most 127 bytes
    pub name: String,
}

impl Super {
    /// Super-block of a freshly formatted file system
    pub fn new(name: &str) -> Super {
        Super {
            version: SUPER_VERSION,
            epoch_low: 1,
            epoch_high: 1,
            qid: 1,
            active: 0,
            next: NIL_ADDR,
            current: NIL_ADDR,
            last: Score::ZERO,
            name: name.to_string(),
        }
    }

    /// Pack into `buf[..SUPER_SIZE]`, big-endian
    pub fn pack(&self, buf: &mut [u8]) {
        buf[..SUPER_SIZE].fill(0);
        BigEndian::write_u32(&mut buf[0..4], SUPER_MAGIC);
        BigEndian::write_u16(&mut buf[4..6], self.version);
        BigEndian::write_u32(&mut buf[6..10], self.epoch_low);
        BigEndian::write_u32(&mut buf[10..14], self.epoch_high);
        BigEndian::write_u64(&mut buf[14..22], self.qid);
        BigEndian::write_u32(&mut buf[22..26], self.active);
        BigEndian::write_u32(&mut buf[26..30], self.next);
        BigEndian::write_u32(&mut buf[30..34], self.current);
        self.last.write_to(buf, 34);
        let name = self.name.as_bytes();
        let n = name.len().min(NAME_SIZE - 1);
        buf[54..54 + n].copy_from_slice(&name[..n]);
    }

    /// Unpack and validate from `buf[..SUPER_SIZE]`
    pub fn unpack(buf: &[u8]) -> Result<Super> {
        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != SUPER_MAGIC {
            return Err(Error::Corruption(format!(
                "bad super-block magic {magic:#010x}"
            )));
        }
        let version = BigEndian::read_u16(&buf[4..6]);
        if version != SUPER_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported super-block version {version}"
            )));
        }
        let name_bytes = &buf[54..54 + NAME_SIZE];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
        let s = Super {
            version,
            epoch_low: BigEndian::read_u32(&buf[6..10]),
            epoch_high: BigEndian::read_u32(&buf[10..14]),
            qid: BigEndian::read_u64(&buf[14..22]),
            active: BigEndian::read_u32(&buf[22..26]),
            next: BigEndian::read_u32(&buf[26..30]),
            current: BigEndian::read_u32(&buf[30..34]),
            last: Score::read_from(buf, 34),
            name,
        };
        if s.epoch_low > s.epoch_high {
            return Err(Error::Corruption(format!(
                "epoch_low {} above epoch_high {}",
                s.epoch_low, s.epoch_high
            )));
        }
        Ok(s)
    }
}
