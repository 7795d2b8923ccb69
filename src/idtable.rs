//! Id table: deduplicated uid/gid values referenced by index from inode
//! headers, so a filesystem with few distinct owners pays for them once.

use crate::compressors::Compressor;
use crate::error::Result;
use crate::io_file::BlockFile;
use crate::metadata::{MetaCursor, MetadataReader, MetadataWriter};
use std::collections::HashMap;

pub struct IdTableWriter {
    meta: MetadataWriter,
    ids: Vec<u32>,
    index: HashMap<u32, u16>,
}

impl IdTableWriter {
    pub fn new() -> Self {
        Self {
            meta: MetadataWriter::new(),
            ids: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Returns the 16-bit index to store in an inode's `uid_idx`/`gid_idx`
    /// field for `id`, deduplicating against ids already added.
    pub fn intern(&mut self, compressor: &dyn Compressor, id: u32) -> Result<u16> {
        if let Some(&idx) = self.index.get(&id) {
            return Ok(idx);
        }
        let idx = self.ids.len() as u16;
        self.meta.append(compressor, &id.to_le_bytes())?;
        self.ids.push(id);
        self.index.insert(id, idx);
        Ok(idx)
    }

    pub fn count(&self) -> u16 {
        self.ids.len() as u16
    }

    pub fn finish(self, compressor: &dyn Compressor) -> Result<Vec<u8>> {
        self.meta.finish(compressor)
    }
}

impl Default for IdTableWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct IdTableReader<'a, F: BlockFile> {
    meta: MetadataReader<'a, F>,
}

impl<'a, F: BlockFile> IdTableReader<'a, F> {
    pub fn new(meta: MetadataReader<'a, F>) -> Self {
        Self { meta }
    }

    pub fn get(&self, index: u16) -> Result<u32> {
        let mut cursor = MetaCursor {
            block_rel_offset: 0,
            intra: 0,
        };
        for _ in 0..index {
            let mut buf = [0u8; 4];
            self.meta.read(&mut cursor, &mut buf)?;
        }
        self.meta.read_u32(&mut cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressors::{CompressorConfig, CompressorId};
    use crate::io_file::MemFile;

    #[test]
    fn interning_dedupes_repeated_ids() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let compressor = cfg.build();
        let mut writer = IdTableWriter::new();

        let a = writer.intern(compressor.as_ref(), 1000).unwrap();
        let b = writer.intern(compressor.as_ref(), 2000).unwrap();
        let a2 = writer.intern(compressor.as_ref(), 1000).unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(writer.count(), 2);

        let table = writer.finish(compressor.as_ref()).unwrap();
        let mut file = MemFile::new();
        file.write_at(0, &table).unwrap();
        let reader = IdTableReader::new(MetadataReader::new(&file, cfg.build(), 0, table.len() as u64));
        assert_eq!(reader.get(a).unwrap(), 1000);
        assert_eq!(reader.get(b).unwrap(), 2000);
    }
}
