//! Device header
//!
//! The header lives at byte offset 128 KiB, leaving room for boot data
//! below it, and resolves the three partitions. Partition addresses are
//! block numbers relative to the *partition base*: the first block
//! boundary at or after the end of the header. Label and data partitions
//! share an index: block `i` of the data partition has its label at index
//! `i` of the label partition.

use byteorder::{BigEndian, ByteOrder};
use shale_core::{Error, Part, Result};

/// Byte offset of the header on the device
pub const HEADER_OFFSET: u64 = 128 * 1024;

/// Size of the packed header in bytes
pub const HEADER_SIZE: usize = 512;

/// Magic number identifying a shale device
pub const HEADER_MAGIC: u32 = 0x3776_ae89;

/// Current header format version
pub const HEADER_VERSION: u16 = 1;

/// Partition geometry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Format version
    pub version: u16,
    /// Block size in bytes, a power of two
    pub block_size: u16,
    /// First block of the super partition (always one block long)
    pub super_: u32,
    /// First block of the label partition
    pub label: u32,
    /// First block of the data partition (one past the last label block)
    pub data: u32,
    /// One past the last data block
    pub end: u32,
}

impl Header {
    /// Byte offset of the partition base for a given block size
    pub fn partition_base(block_size: u16) -> u64 {
        let bs = block_size as u64;
        (HEADER_OFFSET + HEADER_SIZE as u64 + bs - 1) / bs * bs
    }

    /// First block of `part` within the shared address space
    pub fn part_start(&self, part: Part) -> Result<u32> {
        match part {
            Part::Super => Ok(self.super_),
            Part::Label => Ok(self.label),
            Part::Data => Ok(self.data),
            Part::Remote => Err(Error::InvalidState(
                "remote partition has no disk address".into(),
            )),
        }
    }

    /// Number of blocks in `part`
    pub fn part_size(&self, part: Part) -> Result<u32> {
        match part {
            Part::Super => Ok(1),
            Part::Label => Ok(self.data - self.label),
            Part::Data => Ok(self.end - self.data),
            Part::Remote => Err(Error::InvalidState(
                "remote partition has no disk size".into(),
            )),
        }
    }

    /// Pack into `buf[..HEADER_SIZE]`, big-endian
    pub fn pack(&self, buf: &mut [u8]) {
        buf[..HEADER_SIZE].fill(0);
        BigEndian::write_u32(&mut buf[0..4], HEADER_MAGIC);
        BigEndian::write_u16(&mut buf[4..6], self.version);
        BigEndian::write_u16(&mut buf[6..8], self.block_size);
        BigEndian::write_u32(&mut buf[8..12], self.super_);
        BigEndian::write_u32(&mut buf[12..16], self.label);
        BigEndian::write_u32(&mut buf[16..20], self.data);
        BigEndian::write_u32(&mut buf[20..24], self.end);
    }

    /// Unpack and validate from `buf[..HEADER_SIZE]`
    pub fn unpack(buf: &[u8]) -> Result<Header> {
        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != HEADER_MAGIC {
            return Err(Error::Corruption(format!(
                "bad header magic {magic:#010x}"
            )));
        }
        let h = Header {
            version: BigEndian::read_u16(&buf[4..6]),
            block_size: BigEndian::read_u16(&buf[6..8]),
            super_: BigEndian::read_u32(&buf[8..12]),
            label: BigEndian::read_u32(&buf[12..16]),
            data: BigEndian::read_u32(&buf[16..20]),
            end: BigEndian::read_u32(&buf[20..24]),
        };
        h.validate()?;
        Ok(h)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.version != HEADER_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported header version {}",
                self.version
            )));
        }
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(Error::Corruption(format!(
                "bad block size {}",
                self.block_size
            )));
        }
        if self.label != self.super_ + 1 || self.data <= self.label || self.end <= self.data {
            return Err(Error::Corruption(format!(
                "bad partition geometry super={} label={} data={} end={}",
                self.super_, self.label, self.data, self.end
            )));
        }
        let labels_per_block = self.block_size as u64 / shale_core::LABEL_SIZE as u64;
        let label_capacity = (self.data - self.label) as u64 * labels_per_block;
        if label_capacity < (self.end - self.data) as u64 {
            return Err(Error::Corruption(format!(
                "label partition holds {} labels for {} data blocks",
                label_capacity,
                self.end - self.data
            )));
        }
        Ok(())
    }
}
