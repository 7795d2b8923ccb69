//! Export table: maps 1-based inode numbers to the metadata reference of
//! their inode, so an NFS server can turn a file handle back into an inode
//! without walking the directory tree.

use crate::compressors::Compressor;
use crate::error::{Result, SquashfsError};
use crate::io_file::BlockFile;
use crate::metadata::{MetaCursor, MetadataReader, MetadataWriter};

pub struct ExportTableWriter {
    meta: MetadataWriter,
    count: u32,
}

impl ExportTableWriter {
    pub fn new() -> Self {
        Self {
            meta: MetadataWriter::new(),
            count: 0,
        }
    }

    /// Inode numbers must be appended in order, 1 first; the table is a
    /// flat array indexed by `inode_number - 1`.
    pub fn push(&mut self, compressor: &dyn Compressor, inode_ref: u64) -> Result<()> {
        self.meta.append(compressor, &inode_ref.to_le_bytes())?;
        self.count += 1;
        Ok(())
    }

    pub fn finish(self, compressor: &dyn Compressor) -> Result<Vec<u8>> {
        self.meta.finish(compressor)
    }
}

impl Default for ExportTableWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ExportTableReader<'a, F: BlockFile> {
    meta: MetadataReader<'a, F>,
    count: u32,
}

impl<'a, F: BlockFile> ExportTableReader<'a, F> {
    pub fn new(meta: MetadataReader<'a, F>, count: u32) -> Self {
        Self { meta, count }
    }

    pub fn lookup(&self, inode_number: u32) -> Result<u64> {
        if inode_number == 0 || inode_number > self.count {
            return Err(SquashfsError::NotFound(format!(
                "inode {inode_number} not in export table"
            )));
        }
        let mut cursor = MetaCursor {
            block_rel_offset: 0,
            intra: 0,
        };
        for _ in 0..(inode_number - 1) {
            let mut buf = [0u8; 8];
            self.meta.read(&mut cursor, &mut buf)?;
        }
        self.meta.read_u64(&mut cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressors::{CompressorConfig, CompressorId};
    use crate::io_file::MemFile;

    #[test]
    fn lookup_returns_the_right_reference() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let compressor = cfg.build();
        let mut writer = ExportTableWriter::new();
        writer.push(compressor.as_ref(), 100).unwrap();
        writer.push(compressor.as_ref(), 200).unwrap();
        writer.push(compressor.as_ref(), 300).unwrap();
        let table = writer.finish(compressor.as_ref()).unwrap();

        let mut file = MemFile::new();
        file.write_at(0, &table).unwrap();
        let reader = ExportTableReader::new(
            MetadataReader::new(&file, cfg.build(), 0, table.len() as u64),
            3,
        );
        assert_eq!(reader.lookup(1).unwrap(), 100);
        assert_eq!(reader.lookup(3).unwrap(), 300);
        assert!(reader.lookup(4).is_err());
    }
}
