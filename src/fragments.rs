//! Fragment table: entries addressing tail-packing blocks.
//!
//! Layout matches the real SquashFS `squashfs_fragment_entry`: a 64-bit
//! start offset, a 32-bit size (high bit = block stored uncompressed), and
//! a reserved 32-bit field always written as zero.

use crate::error::Result;
use crate::metadata::{MetaCursor, MetadataReader, MetadataWriter};
use crate::{compressors::Compressor, io_file::BlockFile};

pub const FRAGMENT_ENTRY_SIZE: usize = 16;
pub const BLOCK_UNCOMPRESSED_BIT: u32 = 1 << 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentEntry {
    pub start_block: u64,
    pub size: u32,
}

impl FragmentEntry {
    pub fn to_bytes(self) -> [u8; FRAGMENT_ENTRY_SIZE] {
        let mut buf = [0u8; FRAGMENT_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.start_block.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        // buf[12..16] stays zero — reserved.
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let start_block = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        Self { start_block, size }
    }

    pub fn stored_size(self) -> u32 {
        self.size & !BLOCK_UNCOMPRESSED_BIT
    }

    pub fn is_uncompressed(self) -> bool {
        self.size & BLOCK_UNCOMPRESSED_BIT != 0
    }
}

/// Appends fragment-table entries through the metadata stream layer.
pub struct FragmentTableWriter {
    meta: MetadataWriter,
    count: u32,
}

impl FragmentTableWriter {
    pub fn new() -> Self {
        Self {
            meta: MetadataWriter::new(),
            count: 0,
        }
    }

    pub fn push(&mut self, compressor: &dyn Compressor, entry: FragmentEntry) -> Result<u32> {
        let idx = self.count;
        self.meta.append(compressor, &entry.to_bytes())?;
        self.count += 1;
        Ok(idx)
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn finish(self, compressor: &dyn Compressor) -> Result<Vec<u8>> {
        self.meta.finish(compressor)
    }
}

impl Default for FragmentTableWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads every fragment entry from a previously-written table.
pub fn read_fragment_table<F: BlockFile>(
    reader: &MetadataReader<'_, F>,
    count: u32,
) -> Result<Vec<FragmentEntry>> {
    let mut cursor = MetaCursor::from_ref(0);
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let buf = reader.read_vec(&mut cursor, FRAGMENT_ENTRY_SIZE)?;
        out.push(FragmentEntry::from_bytes(&buf));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrips_through_bytes() {
        let entry = FragmentEntry {
            start_block: 0x1234_5678_9abc,
            size: 4096 | BLOCK_UNCOMPRESSED_BIT,
        };
        let bytes = entry.to_bytes();
        let back = FragmentEntry::from_bytes(&bytes);
        assert_eq!(entry, back);
        assert!(back.is_uncompressed());
        assert_eq!(back.stored_size(), 4096);
    }

    #[test]
    fn compressed_entry_has_no_uncompressed_bit() {
        let entry = FragmentEntry {
            start_block: 0,
            size: 1024,
        };
        assert!(!entry.is_uncompressed());
        assert_eq!(entry.stored_size(), 1024);
    }
}
