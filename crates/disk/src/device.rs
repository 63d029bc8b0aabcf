//! Block device
//!
//! A `Disk` wraps the partition file (or raw device) and serves whole
//! blocks by `(Part, addr)`. It is safely shared: positional I/O needs no
//! seek state, so `&Disk` suffices for both reads and writes.

use crate::header::{Header, HEADER_OFFSET, HEADER_SIZE};
use shale_core::{Error, Part, Result};
use std::fs::File;
use std::os::unix::fs::FileExt;
use tracing::trace;

/// Partitioned block device
#[derive(Debug)]
pub struct Disk {
    file: File,
    header: Header,
    base: u64,
}

impl Disk {
    /// Open a formatted device, reading and validating its header
    pub fn open(file: File) -> Result<Disk> {
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut buf, HEADER_OFFSET)?;
        let header = Header::unpack(&buf)?;
        Ok(Disk {
            base: Header::partition_base(header.block_size),
            file,
            header,
        })
    }

    /// Block size in bytes
    pub fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    /// The device's partition geometry
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Number of blocks in `part`
    pub fn part_size(&self, part: Part) -> Result<u32> {
        self.header.part_size(part)
    }

    fn offset(&self, part: Part, addr: u32) -> Result<u64> {
        if addr >= self.header.part_size(part)? {
            return Err(Error::BadAddr(addr));
        }
        let start = self.header.part_start(part)? as u64;
        Ok(self.base + (start + addr as u64) * self.header.block_size as u64)
    }

    /// Read block `(part, addr)` into `buf` (exactly one block long)
    pub fn read(&self, part: Part, addr: u32, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), self.block_size());
        let off = self.offset(part, addr)?;
        trace!(?part, addr, off, "disk read");
        self.file
            .read_exact_at(buf, off)
            .map_err(|_| Error::Read { part, addr })
    }

    /// Write block `(part, addr)` from `buf` (exactly one block long)
    pub fn write(&self, part: Part, addr: u32, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), self.block_size());
        let off = self.offset(part, addr)?;
        trace!(?part, addr, off, "disk write");
        self.file.write_all_at(buf, off)?;
        Ok(())
    }

    /// Flush OS buffers to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{format_with_header, FormatOpts};
    use tempfile::tempfile;

    fn small_disk() -> Disk {
        let file = tempfile().unwrap();
        let header = Header {
            version: 1,
            block_size: 512,
            super_: 0,
            label: 1,
            data: 2,
            end: 18,
        };
        format_with_header(&file, header, FormatOpts::new("test")).unwrap();
        Disk::open(file).unwrap()
    }

    #[test]
    fn test_read_back_what_was_written() {
        let disk = small_disk();
        let block = vec![0x5au8; 512];
        disk.write(Part::Data, 3, &block).unwrap();
        let mut got = vec![0u8; 512];
        disk.read(Part::Data, 3, &mut got).unwrap();
        assert_eq!(got, block);
    }

    #[test]
    fn test_partitions_do_not_overlap() {
        let disk = small_disk();
        let labels = vec![0x11u8; 512];
        let data = vec![0x22u8; 512];
        disk.write(Part::Label, 0, &labels).unwrap();
        disk.write(Part::Data, 0, &data).unwrap();
        let mut got = vec![0u8; 512];
        disk.read(Part::Label, 0, &mut got).unwrap();
        assert_eq!(got, labels);
    }

    #[test]
    fn test_out_of_range_address_rejected() {
        let disk = small_disk();
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            disk.read(Part::Data, 16, &mut buf),
            Err(Error::BadAddr(16))
        ));
        assert!(matches!(
            disk.read(Part::Super, 1, &mut buf),
            Err(Error::BadAddr(1))
        ));
    }
}
