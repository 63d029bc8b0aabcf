//! Device formatting
//!
//! Writes the header, a zeroed label partition, the root block (a
//! directory block under the root tag whose entry 0 is the empty root
//! source), and a fresh super-block naming that root at epoch 1.

use crate::device::Disk;
use crate::header::{Header, HEADER_OFFSET, HEADER_SIZE};
use crate::super_block::Super;
use shale_core::{
    BlockType, Entry, Error, Label, Part, Result, Score, ENTRY_ACTIVE, ENTRY_DIR, ENTRY_LOCAL,
    LABEL_SIZE, ROOT_TAG,
};
use std::fs::File;
use std::os::unix::fs::FileExt;
use tracing::debug;

/// Formatting options
#[derive(Debug, Clone)]
pub struct FormatOpts {
    /// Human label stored in the super-block
    pub name: String,
}

impl FormatOpts {
    /// Options with the given file-system name
    pub fn new(name: &str) -> FormatOpts {
        FormatOpts {
            name: name.to_string(),
        }
    }
}

/// Format `file` with geometry derived from its length
///
/// The label partition is sized to cover every remaining block, so the
/// data partition fills whatever the device offers.
pub fn format(file: &File, block_size: u16, opts: FormatOpts) -> Result<Header> {
    let base = Header::partition_base(block_size);
    let len = file.metadata()?.len();
    let total = len.saturating_sub(base) / block_size as u64;
    let labels_per_block = block_size as u64 / LABEL_SIZE as u64;
    if total < 4 {
        return Err(Error::Corruption(format!(
            "device too small: {total} blocks past the header"
        )));
    }
    // one super block; labels sized to cover the rest
    let label_blocks = ((total - 1) + labels_per_block) / (labels_per_block + 1);
    let header = Header {
        version: 1,
        block_size,
        super_: 0,
        label: 1,
        data: 1 + label_blocks as u32,
        end: total as u32,
    };
    format_with_header(file, header, opts)?;
    Ok(header)
}

/// Format `file` with an explicit partition geometry
pub fn format_with_header(file: &File, header: Header, opts: FormatOpts) -> Result<()> {
    header.validate()?;
    let bs = header.block_size as usize;
    let base = Header::partition_base(header.block_size);
    file.set_len(base + header.end as u64 * header.block_size as u64)?;

    let mut buf = vec![0u8; HEADER_SIZE];
    header.pack(&mut buf);
    file.write_all_at(&buf, HEADER_OFFSET)?;

    let disk = Disk::open(file.try_clone()?)?;

    // Label partition: everything free except the root block's label.
    let zero = vec![0u8; bs];
    for i in 0..header.part_size(Part::Label)? {
        disk.write(Part::Label, i, &zero)?;
    }
    let mut labels = vec![0u8; bs];
    Label::new_active(BlockType::dir(0), ROOT_TAG, 1).pack(&mut labels[..LABEL_SIZE]);
    disk.write(Part::Label, 0, &labels)?;

    // Root block: entry 0 is the empty root source.
    let mut root = vec![0u8; bs];
    // a zero score marks the (empty) tree as unallocated
    let entry = Entry {
        gen: 1,
        psize: header.block_size,
        dsize: header.block_size,
        flags: ENTRY_ACTIVE | ENTRY_DIR | ENTRY_LOCAL,
        depth: 0,
        size: 0,
        score: Score::ZERO,
        tag: ROOT_TAG,
        snap: 0,
        archive: false,
    };
    entry.pack(&mut root, 0);
    disk.write(Part::Data, 0, &root)?;

    // Super-block last, naming the root.
    let mut sb = vec![0u8; bs];
    Super::new(&opts.name).pack(&mut sb);
    disk.write(Part::Super, 0, &sb)?;
    disk.sync()?;
    debug!(
        name = %opts.name,
        block_size = header.block_size,
        data_blocks = header.end - header.data,
        "formatted device"
    );
    Ok(())
}
