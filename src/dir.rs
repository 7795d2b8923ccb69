//! Directory table: headers plus entries, written through the metadata
//! stream and capped the way the on-disk format requires.
//!
//! A header groups up to 256 entries that share both a directory-table
//! metadata block (so reads of one header never cross blocks) and an
//! inode-number delta window of ±32767 from the header's `inode_number`
//! (the per-entry delta is stored as an `i16`). A new header starts
//! whenever any of those limits would be exceeded.

use crate::compressors::Compressor;
use crate::error::{Result, SquashfsError};
use crate::inode::DirectoryIndex;
use crate::io_file::BlockFile;
use crate::metadata::{MetaCursor, MetadataReader, MetadataWriter};

pub const MAX_ENTRIES_PER_HEADER: usize = 256;

#[derive(Clone, Debug)]
pub struct DirEntryIn {
    pub name: Vec<u8>,
    pub inode_number: u32,
    /// Metadata reference (relative to the inode table) of this entry's inode.
    pub inode_ref: u64,
    /// Basic inode type (1..=7) even when the inode itself is an extended variant.
    pub basic_type: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub inode_number: u32,
    pub inode_ref: u64,
    pub basic_type: u16,
}

pub struct DirectoryWriter {
    meta: MetadataWriter,
}

/// Where a directory's listing begins, for storing into its parent inode.
pub struct DirLocation {
    pub meta_ref: u64,
    pub size: u32,
    /// One entry per header beyond the first: the byte offset into the
    /// listing at which that header starts, the directory-table metadata
    /// block (relative, intra-offset always zero) it lives in, and its
    /// first entry's name. A directory that fits in one header has no
    /// index entries at all, matching how a basic (non-`L`) directory
    /// inode has no index field to store them in.
    pub index: Vec<DirectoryIndex>,
}

impl DirectoryWriter {
    pub fn new() -> Self {
        Self {
            meta: MetadataWriter::new(),
        }
    }

    /// `entries` must already be sorted by name (directory order on disk).
    pub fn write_directory(
        &mut self,
        compressor: &dyn Compressor,
        entries: &[DirEntryIn],
    ) -> Result<DirLocation> {
        let start_ref = self.meta.current_ref();
        if entries.is_empty() {
            return Ok(DirLocation {
                meta_ref: start_ref,
                size: 0,
                index: Vec::new(),
            });
        }

        let mut size = 0u32;
        let mut index = Vec::new();
        let mut i = 0usize;
        while i < entries.len() {
            let (inode_block, _) = crate::metadata::unpack_meta_ref(entries[i].inode_ref);
            let header_inode_number = entries[i].inode_number;

            let mut j = i + 1;
            while j < entries.len()
                && j - i < MAX_ENTRIES_PER_HEADER
                && crate::metadata::unpack_meta_ref(entries[j].inode_ref).0 == inode_block
                && delta_fits(header_inode_number, entries[j].inode_number)
            {
                j += 1;
            }

            let group = &entries[i..j];
            if i > 0 {
                // Force this header to start at a fresh directory-table
                // metadata block, so its position is addressable by
                // start_block alone with no intra-block offset to track.
                self.meta.flush(compressor)?;
                index.push(DirectoryIndex {
                    index: size,
                    start_block: self.meta.table_len() as u32,
                    name: group[0].name.clone(),
                });
            }

            let count = (group.len() - 1) as u32;
            self.meta.append(compressor, &count.to_le_bytes())?;
            self.meta.append(compressor, &(inode_block as u32).to_le_bytes())?;
            self.meta.append(compressor, &header_inode_number.to_le_bytes())?;
            size += 12;

            for entry in group {
                let (_, intra) = crate::metadata::unpack_meta_ref(entry.inode_ref);
                let delta = entry.inode_number as i64 - header_inode_number as i64;
                let delta = delta as i16;
                let name_size = entry.name.len() as u16 - 1;
                self.meta.append(compressor, &intra.to_le_bytes())?;
                self.meta.append(compressor, &delta.to_le_bytes())?;
                self.meta.append(compressor, &entry.basic_type.to_le_bytes())?;
                self.meta.append(compressor, &name_size.to_le_bytes())?;
                self.meta.append(compressor, &entry.name)?;
                size += 8 + entry.name.len() as u32;
            }

            i = j;
        }

        Ok(DirLocation {
            meta_ref: start_ref,
            size,
            index,
        })
    }

    pub fn finish(self, compressor: &dyn Compressor) -> Result<Vec<u8>> {
        self.meta.finish(compressor)
    }
}

impl Default for DirectoryWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn delta_fits(header_inode_number: u32, candidate: u32) -> bool {
    let delta = candidate as i64 - header_inode_number as i64;
    delta >= i16::MIN as i64 && delta <= i16::MAX as i64
}

/// Reads back every entry of one directory's listing.
pub fn read_directory<F: BlockFile>(
    reader: &MetadataReader<'_, F>,
    meta_ref: u64,
    size: u32,
) -> Result<Vec<DirEntry>> {
    let mut cursor = MetaCursor::from_ref(meta_ref);
    let mut out = Vec::new();
    let mut remaining = size;

    while remaining > 0 {
        if remaining < 12 {
            return Err(SquashfsError::corrupt("truncated directory header"));
        }
        let count = reader.read_u32(&mut cursor)?;
        let start_block = reader.read_u32(&mut cursor)?;
        let header_inode_number = reader.read_u32(&mut cursor)?;
        remaining -= 12;

        for _ in 0..=count {
            if remaining < 8 {
                return Err(SquashfsError::corrupt("truncated directory entry"));
            }
            let offset = reader.read_u16(&mut cursor)?;
            let delta = reader.read_i16(&mut cursor)?;
            let basic_type = reader.read_u16(&mut cursor)?;
            let name_size = reader.read_u16(&mut cursor)? as u32 + 1;
            remaining -= 8;
            if remaining < name_size {
                return Err(SquashfsError::corrupt("truncated directory entry name"));
            }
            let name = reader.read_vec(&mut cursor, name_size as usize)?;
            remaining -= name_size;

            let inode_number = (header_inode_number as i64 + delta as i64) as u32;
            out.push(DirEntry {
                name,
                inode_number,
                inode_ref: crate::metadata::pack_meta_ref(start_block as u64, offset),
                basic_type,
            });
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressors::{CompressorConfig, CompressorId};
    use crate::io_file::MemFile;
    use crate::metadata::pack_meta_ref;

    #[test]
    fn roundtrips_a_small_directory() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let compressor = cfg.build();

        let entries = vec![
            DirEntryIn {
                name: b"alpha".to_vec(),
                inode_number: 10,
                inode_ref: pack_meta_ref(0, 0),
                basic_type: 2,
            },
            DirEntryIn {
                name: b"beta".to_vec(),
                inode_number: 11,
                inode_ref: pack_meta_ref(0, 32),
                basic_type: 2,
            },
        ];

        let mut writer = DirectoryWriter::new();
        let loc = writer.write_directory(compressor.as_ref(), &entries).unwrap();
        let table = writer.finish(compressor.as_ref()).unwrap();

        let mut file = MemFile::new();
        file.write_at(0, &table).unwrap();
        let reader = MetadataReader::new(&file, cfg.build(), 0, table.len() as u64);

        let back = read_directory(&reader, loc.meta_ref, loc.size).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].name, b"alpha");
        assert_eq!(back[0].inode_number, 10);
        assert_eq!(back[1].name, b"beta");
        assert_eq!(back[1].inode_number, 11);
    }

    #[test]
    fn splits_header_past_256_entries() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let compressor = cfg.build();

        let entries: Vec<DirEntryIn> = (0..300u32)
            .map(|i| DirEntryIn {
                name: format!("f{i:04}").into_bytes(),
                inode_number: i + 1,
                inode_ref: pack_meta_ref(0, 0),
                basic_type: 2,
            })
            .collect();

        let mut writer = DirectoryWriter::new();
        let loc = writer.write_directory(compressor.as_ref(), &entries).unwrap();
        let table = writer.finish(compressor.as_ref()).unwrap();

        let mut file = MemFile::new();
        file.write_at(0, &table).unwrap();
        let reader = MetadataReader::new(&file, cfg.build(), 0, table.len() as u64);

        let back = read_directory(&reader, loc.meta_ref, loc.size).unwrap();
        assert_eq!(back.len(), 300);
        assert_eq!(back[299].inode_number, 300);

        assert_eq!(loc.index.len(), 1);
        assert_eq!(loc.index[0].name, b"f0256");
    }
}
