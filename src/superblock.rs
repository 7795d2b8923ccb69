//! The 96-byte super block: magic, table offsets, and global flags.

use crate::error::{Result, SquashfsError};
use crate::io_file::BlockFile;
use crate::utils::get_set_field_tuple;
use crate::{INVALID_BLK, MAGIC, SUPERBLOCK_SIZE};
use bitflags::bitflags;
use std::fmt::{Debug, Display};

pub const VERSION_MAJOR: u16 = 4;
pub const VERSION_MINOR: u16 = 0;

/// Byte-array-backed super block. Field accessors read/write little-endian
/// values at their fixed offsets, matching the on-disk layout exactly.
#[derive(Clone, Copy)]
pub struct Superblock([u8; SUPERBLOCK_SIZE]);

impl Superblock {
    pub fn new() -> Self {
        let mut sb = Self([0u8; SUPERBLOCK_SIZE]);
        sb.set_magic(MAGIC);
        sb.set_version_major(VERSION_MAJOR);
        sb.set_version_minor(VERSION_MINOR);
        sb.set_root_inode(INVALID_BLK);
        sb.set_id_table_start(INVALID_BLK as u64);
        sb.set_xattr_id_table_start(INVALID_BLK);
        sb.set_inode_table_start(INVALID_BLK);
        sb.set_directory_table_start(INVALID_BLK);
        sb.set_fragment_table_start(INVALID_BLK as u64);
        sb.set_export_table_start(INVALID_BLK);
        sb
    }

    pub fn read<F: BlockFile>(file: &F) -> Result<Self> {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        file.read_at(0, &mut buf)?;
        let sb = Self(buf);
        if sb.magic() != MAGIC {
            return Err(SquashfsError::corrupt(format!(
                "invalid magic 0x{:08x}",
                sb.magic()
            )));
        }
        if sb.block_size() != 0 && (1u32 << sb.block_log()) != sb.block_size() {
            return Err(SquashfsError::corrupt(format!(
                "block_size {} does not match block_log {}",
                sb.block_size(),
                sb.block_log()
            )));
        }
        Ok(sb)
    }

    pub fn write<F: BlockFile>(&self, file: &mut F) -> Result<()> {
        file.write_at(0, &self.0)?;
        Ok(())
    }

    get_set_field_tuple!(magic, set_magic, u32, 0, 4);
    get_set_field_tuple!(inodes, set_inodes, u32, 4, 4);
    get_set_field_tuple!(mkfs_time, set_mkfs_time, u32, 8, 4);
    get_set_field_tuple!(block_size, set_block_size, u32, 12, 4);
    get_set_field_tuple!(fragments, set_fragments, u32, 16, 4);
    get_set_field_tuple!(compressor, set_compressor, u16, 20, 2);
    get_set_field_tuple!(block_log, set_block_log, u16, 22, 2);
    get_set_field_tuple!(flags_raw, set_flags_raw, u16, 24, 2);
    get_set_field_tuple!(no_ids, set_no_ids, u16, 26, 2);
    get_set_field_tuple!(version_major, set_version_major, u16, 28, 2);
    get_set_field_tuple!(version_minor, set_version_minor, u16, 30, 2);
    get_set_field_tuple!(root_inode, set_root_inode, i64, 32, 8);
    get_set_field_tuple!(bytes_used, set_bytes_used, u64, 40, 8);
    get_set_field_tuple!(id_table_start, set_id_table_start, u64, 48, 8);
    get_set_field_tuple!(xattr_id_table_start, set_xattr_id_table_start, i64, 56, 8);
    get_set_field_tuple!(inode_table_start, set_inode_table_start, i64, 64, 8);
    get_set_field_tuple!(directory_table_start, set_directory_table_start, i64, 72, 8);
    get_set_field_tuple!(fragment_table_start, set_fragment_table_start, u64, 80, 8);
    get_set_field_tuple!(export_table_start, set_export_table_start, i64, 88, 8);

    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.flags_raw())
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.set_flags_raw(flags.bits());
    }

    pub fn has_xattrs(&self) -> bool {
        self.xattr_id_table_start() != INVALID_BLK
    }

    pub fn has_export_table(&self) -> bool {
        self.export_table_start() != INVALID_BLK
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    #[derive(Default)]
    pub struct Flags: u16 {
        const INODES_STORED_UNCOMPRESSED = 0x0001;
        const DATA_BLOCKS_STORED_UNCOMPRESSED = 0x0002;
        const UNUSED = 0x0004;
        const FRAGMENTS_STORED_UNCOMPRESSED = 0x0008;
        const FRAGMENTS_ARE_NOT_USED = 0x0010;
        const FRAGMENTS_ALWAYS_GENERATED = 0x0020;
        const DATA_DEDUPLICATED = 0x0040;
        const NFSEXPORT_TABLE_EXISTS = 0x0080;
        const XATTRS_STORED_UNCOMPRESSED = 0x0100;
        const NO_XATTRS_IN_ARCHIVE = 0x0200;
        const COMPRESSOR_OPTIONS_PRESENT = 0x0400;
        const IDTABLE_UNCOMPRESSED = 0x0800;
    }
}

impl Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Display for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "inodes {} mkfs_time {} block_size {} fragments {} block_log {} \
compressor {} flags {} no_ids {} version {}.{} root_inode {} bytes_used {} \
id_table_start {} xattr_id_table_start {} inode_table_start {} \
directory_table_start {} fragment_table_start {} export_table_start {}",
            self.inodes(),
            self.mkfs_time(),
            self.block_size(),
            self.fragments(),
            self.block_log(),
            self.compressor(),
            self.flags(),
            self.no_ids(),
            self.version_major(),
            self.version_minor(),
            self.root_inode(),
            self.bytes_used(),
            self.id_table_start(),
            self.xattr_id_table_start(),
            self.inode_table_start(),
            self.directory_table_start(),
            self.fragment_table_start(),
            self.export_table_start()
        )
    }
}

impl Debug for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_file::MemFile;

    #[test]
    fn size_is_96_bytes() {
        assert_eq!(std::mem::size_of::<Superblock>(), SUPERBLOCK_SIZE);
    }

    #[test]
    fn roundtrips_through_a_file() {
        let mut sb = Superblock::new();
        sb.set_inodes(42);
        sb.set_block_size(131072);
        sb.set_block_log(17);
        sb.set_flags(Flags::DATA_DEDUPLICATED | Flags::NFSEXPORT_TABLE_EXISTS);

        let mut file = MemFile::new();
        sb.write(&mut file).unwrap();

        let back = Superblock::read(&file).unwrap();
        assert_eq!(back.inodes(), 42);
        assert_eq!(back.block_size(), 131072);
        assert_eq!(back.flags(), sb.flags());
    }

    #[test]
    fn rejects_bad_magic() {
        let file = MemFile::new();
        let mut padded = file;
        padded.write_at(0, &[0u8; SUPERBLOCK_SIZE]).unwrap();
        assert!(Superblock::read(&padded).is_err());
    }
}
