//! L3: 8 KiB framed, compressed, random-access metadata streams.
//!
//! A metadata reference is relative to the start of the table it addresses:
//! the upper 48 bits are the byte offset of a metadata block *within the
//! table*, the lower 16 bits are the intra-block offset after decompression.
//! Resolving a reference to an absolute file position is the caller's job
//! (add the table's start offset from the super block).

use crate::compressors::Compressor;
use crate::error::{Result, SquashfsError};
use crate::io_file::BlockFile;
use crate::METADATA_SIZE;
use std::cell::RefCell;
use std::collections::HashMap;

const COMPRESSED_BIT: u16 = 0x8000;
const DEFAULT_CACHE_BLOCKS: usize = 128;

pub fn pack_meta_ref(block_offset: u64, intra_offset: u16) -> u64 {
    (block_offset << 16) | intra_offset as u64
}

pub fn unpack_meta_ref(meta_ref: u64) -> (u64, u16) {
    (meta_ref >> 16, (meta_ref & 0xffff) as u16)
}

/// Accumulates appended bytes into 8 KiB blocks, compressing each as it
/// fills. `append` may split a single logical write across a block
/// boundary; readers tolerate this transparently.
pub struct MetadataWriter {
    buffer: Vec<u8>,
    data: Vec<u8>,
}

impl MetadataWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(METADATA_SIZE),
            data: Vec::new(),
        }
    }

    /// The reference a caller would use to find the byte about to be
    /// written next, relative to this stream's (eventual) table start.
    pub fn current_ref(&self) -> u64 {
        pack_meta_ref(self.data.len() as u64, self.buffer.len() as u16)
    }

    pub fn append(&mut self, compressor: &dyn Compressor, bytes: &[u8]) -> Result<()> {
        let mut rem = bytes;
        while !rem.is_empty() {
            let space = METADATA_SIZE - self.buffer.len();
            let take = space.min(rem.len());
            self.buffer.extend_from_slice(&rem[..take]);
            rem = &rem[take..];
            if self.buffer.len() == METADATA_SIZE {
                self.flush_block(compressor)?;
            }
        }
        Ok(())
    }

    fn flush_block(&mut self, compressor: &dyn Compressor) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut compressed = Vec::new();
        let outcome = compressor.compress(&self.buffer, &mut compressed)?;
        match outcome {
            Some(len) if len < self.buffer.len() => {
                let header = len as u16;
                self.data.extend_from_slice(&header.to_le_bytes());
                self.data.extend_from_slice(&compressed[..len]);
            }
            _ => {
                let header = self.buffer.len() as u16 | COMPRESSED_BIT;
                self.data.extend_from_slice(&header.to_le_bytes());
                self.data.extend_from_slice(&self.buffer);
            }
        }
        self.buffer.clear();
        Ok(())
    }

    /// Force out any partially-filled block (used at end-of-table).
    pub fn flush(&mut self, compressor: &dyn Compressor) -> Result<()> {
        self.flush_block(compressor)
    }

    /// Total bytes of the finished (already-flushed) on-disk table so far.
    pub fn table_len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn finish(mut self, compressor: &dyn Compressor) -> Result<Vec<u8>> {
        self.flush(compressor)?;
        Ok(self.data)
    }
}

impl Default for MetadataWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor into a metadata stream: the block currently being read from
/// (relative offset) and the intra-block byte offset.
#[derive(Clone, Copy, Debug)]
pub struct MetaCursor {
    pub block_rel_offset: u64,
    pub intra: usize,
}

impl MetaCursor {
    pub fn from_ref(meta_ref: u64) -> Self {
        let (block, intra) = unpack_meta_ref(meta_ref);
        Self {
            block_rel_offset: block,
            intra: intra as usize,
        }
    }

    pub fn to_ref(self) -> u64 {
        pack_meta_ref(self.block_rel_offset, self.intra as u16)
    }
}

struct CachedBlock {
    data: Vec<u8>,
    /// bytes consumed on disk by the block header + payload, i.e. the
    /// relative offset of the next block.
    consumed: u64,
}

/// Lazily loads and caches decompressed metadata blocks (LRU, default 128
/// blocks). Sequential reads cross block boundaries transparently.
pub struct MetadataReader<'a, F: BlockFile> {
    file: &'a F,
    compressor: Box<dyn Compressor>,
    table_start: u64,
    table_end: u64,
    cache: RefCell<HashMap<u64, CachedBlock>>,
    recency: RefCell<Vec<u64>>,
    capacity: usize,
}

impl<'a, F: BlockFile> MetadataReader<'a, F> {
    pub fn new(
        file: &'a F,
        compressor: Box<dyn Compressor>,
        table_start: u64,
        table_end: u64,
    ) -> Self {
        Self {
            file,
            compressor,
            table_start,
            table_end,
            cache: RefCell::new(HashMap::new()),
            recency: RefCell::new(Vec::new()),
            capacity: DEFAULT_CACHE_BLOCKS,
        }
    }

    pub fn cursor_at(&self, meta_ref: u64) -> MetaCursor {
        MetaCursor::from_ref(meta_ref)
    }

    fn touch(&self, block_rel_offset: u64) {
        let mut recency = self.recency.borrow_mut();
        recency.retain(|&o| o != block_rel_offset);
        recency.push(block_rel_offset);
        if recency.len() > self.capacity {
            let evict = recency.remove(0);
            self.cache.borrow_mut().remove(&evict);
        }
    }

    fn load_block(&self, block_rel_offset: u64) -> Result<(Vec<u8>, u64)> {
        if let Some(block) = self.cache.borrow().get(&block_rel_offset) {
            self.touch(block_rel_offset);
            return Ok((block.data.clone(), block.consumed));
        }

        let abs = self.table_start + block_rel_offset;
        if abs >= self.table_end {
            return Err(SquashfsError::corrupt(
                "metadata reference out of file bounds",
            ));
        }

        let mut header = [0u8; 2];
        self.file.read_at(abs, &mut header)?;
        let header = u16::from_le_bytes(header);
        let uncompressed = header & COMPRESSED_BIT != 0;
        let len = (header & !COMPRESSED_BIT) as usize;
        if len > METADATA_SIZE {
            return Err(SquashfsError::corrupt(format!(
                "malformed metadata header length {len}"
            )));
        }
        if abs + 2 + len as u64 > self.table_end {
            return Err(SquashfsError::corrupt(
                "truncated physical metadata block",
            ));
        }

        let mut raw = vec![0u8; len];
        self.file.read_at(abs + 2, &mut raw)?;

        let data = if uncompressed {
            raw
        } else {
            let mut out = Vec::with_capacity(METADATA_SIZE);
            self.compressor.decompress(&raw, &mut out)?;
            out
        };

        let consumed = 2 + len as u64;
        self.cache.borrow_mut().insert(
            block_rel_offset,
            CachedBlock {
                data: data.clone(),
                consumed,
            },
        );
        self.touch(block_rel_offset);
        Ok((data, consumed))
    }

    /// Sequentially read `buf.len()` bytes starting at `cursor`, advancing
    /// it, transparently crossing block boundaries.
    pub fn read(&self, cursor: &mut MetaCursor, buf: &mut [u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let (block, consumed) = self.load_block(cursor.block_rel_offset)?;
            if cursor.intra > block.len() {
                return Err(SquashfsError::corrupt("offset out of range in metadata block"));
            }
            let avail = block.len() - cursor.intra;
            if avail == 0 {
                cursor.block_rel_offset += consumed;
                cursor.intra = 0;
                continue;
            }
            let take = avail.min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&block[cursor.intra..cursor.intra + take]);
            written += take;
            cursor.intra += take;
        }
        Ok(())
    }

    pub fn read_u8(&self, cursor: &mut MetaCursor) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(cursor, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, cursor: &mut MetaCursor) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(cursor, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, cursor: &mut MetaCursor) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(cursor, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, cursor: &mut MetaCursor) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(cursor, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i16(&self, cursor: &mut MetaCursor) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.read(cursor, &mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    pub fn read_vec(&self, cursor: &mut MetaCursor, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(cursor, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressors::{CompressorConfig, CompressorId};
    use crate::io_file::MemFile;

    fn roundtrip_pattern(pattern: &[u8], reps: usize) {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let compressor = cfg.build();

        let mut writer = MetadataWriter::new();
        let mut expected = Vec::new();
        for _ in 0..reps {
            writer.append(compressor.as_ref(), pattern).unwrap();
            expected.extend_from_slice(pattern);
        }
        let table = writer.finish(compressor.as_ref()).unwrap();

        let mut file = MemFile::new();
        file.write_at(0, &table).unwrap();

        let reader = MetadataReader::new(&file, cfg.build(), 0, table.len() as u64);
        let mut cursor = reader.cursor_at(0);
        let mut got = vec![0u8; expected.len()];
        reader.read(&mut cursor, &mut got).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn small_write_roundtrips() {
        roundtrip_pattern(b"hello metadata", 3);
    }

    #[test]
    fn crosses_block_boundary() {
        // 300 repeats of a 37-byte pattern overflow one 8 KiB block.
        roundtrip_pattern(b"0123456789abcdef0123456789abcdefXYZ\n", 300);
    }

    #[test]
    fn bad_header_length_is_corrupt() {
        let mut file = MemFile::new();
        // length field with both the uncompressed bit and an over-long size.
        file.write_at(0, &[0xff, 0xff]).unwrap();
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let reader = MetadataReader::new(&file, cfg.build(), 0, 2);
        let mut cursor = reader.cursor_at(0);
        let mut buf = [0u8; 1];
        let err = reader.read(&mut cursor, &mut buf).unwrap_err();
        assert!(matches!(err, SquashfsError::Corrupt(_)));
    }
}
