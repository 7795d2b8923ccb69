//! L5 (inodes): on-disk inode headers, read and written through the
//! metadata stream layer.
//!
//! Each inode type has a fixed-size "basic" header and most have an
//! "extended" (`L`-prefixed) counterpart carrying an xattr index and, for
//! directories and regular files, a 64-bit size/start_block. Regular and
//! extended-regular inodes are followed by a block list: one `u32` per
//! full data block (the trailing fragment, if any, lives in the fragment
//! table instead).

use crate::error::{Result, SquashfsError};
use crate::io_file::BlockFile;
use crate::metadata::{MetaCursor, MetadataReader, MetadataWriter};
use crate::utils::get_set_field_tuple;
use crate::{compressors::Compressor, superblock::Superblock, INVALID_FRAG, INVALID_XATTR};
use std::fmt::{Debug, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeType {
    Directory,
    LDirectory,
    File,
    LFile,
    Symlink,
    LSymlink,
    BlockDevice,
    LBlockDevice,
    CharacterDevice,
    LCharacterDevice,
    NamedPipe,
    LNamedPipe,
    Socket,
    LSocket,
}

impl InodeType {
    pub fn from_u16(value: u16) -> Result<Self> {
        Ok(match value {
            1 => Self::Directory,
            2 => Self::File,
            3 => Self::Symlink,
            4 => Self::BlockDevice,
            5 => Self::CharacterDevice,
            6 => Self::NamedPipe,
            7 => Self::Socket,
            8 => Self::LDirectory,
            9 => Self::LFile,
            10 => Self::LSymlink,
            11 => Self::LBlockDevice,
            12 => Self::LCharacterDevice,
            13 => Self::LNamedPipe,
            14 => Self::LSocket,
            other => return Err(SquashfsError::corrupt(format!("bad inode_type {other}"))),
        })
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Directory => 1,
            Self::File => 2,
            Self::Symlink => 3,
            Self::BlockDevice => 4,
            Self::CharacterDevice => 5,
            Self::NamedPipe => 6,
            Self::Socket => 7,
            Self::LDirectory => 8,
            Self::LFile => 9,
            Self::LSymlink => 10,
            Self::LBlockDevice => 11,
            Self::LCharacterDevice => 12,
            Self::LNamedPipe => 13,
            Self::LSocket => 14,
        }
    }

    pub fn is_extended(self) -> bool {
        self.to_u16() >= 8
    }
}

macro_rules! basic_header {
    ($name:ident, $size:expr) => {
        #[derive(Clone, Copy, Debug)]
        pub struct $name(pub [u8; $size]);

        impl $name {
            pub fn zeroed() -> Self {
                Self([0u8; $size])
            }

            get_set_field_tuple!(inode_type, set_inode_type, u16, 0, 2);
            get_set_field_tuple!(mode, set_mode, u16, 2, 2);
            get_set_field_tuple!(uid_idx, set_uid_idx, u16, 4, 2);
            get_set_field_tuple!(gid_idx, set_gid_idx, u16, 6, 2);
            get_set_field_tuple!(mtime, set_mtime, u32, 8, 4);
            get_set_field_tuple!(inode_number, set_inode_number, u32, 12, 4);
        }
    };
}

basic_header!(DirectoryInodeHeader, 32);
basic_header!(LDirectoryInodeHeader, 40);
basic_header!(RegularInodeHeader, 32);
basic_header!(LRegularInodeHeader, 56);
basic_header!(SymlinkInodeHeader, 24);
basic_header!(DevInodeHeader, 24);
basic_header!(LDevInodeHeader, 28);
basic_header!(IPCInodeHeader, 20);
basic_header!(LIPCInodeHeader, 24);

impl DirectoryInodeHeader {
    get_set_field_tuple!(start_block, set_start_block, u32, 16, 4);
    get_set_field_tuple!(nlink, set_nlink, u32, 20, 4);
    get_set_field_tuple!(file_size, set_file_size, u16, 24, 2);
    get_set_field_tuple!(offset, set_offset, u16, 26, 2);
    get_set_field_tuple!(parent_inode, set_parent_inode, u32, 28, 4);
}

impl LDirectoryInodeHeader {
    get_set_field_tuple!(nlink, set_nlink, u32, 16, 4);
    get_set_field_tuple!(file_size, set_file_size, u32, 20, 4);
    get_set_field_tuple!(start_block, set_start_block, u32, 24, 4);
    get_set_field_tuple!(parent_inode, set_parent_inode, u32, 28, 4);
    get_set_field_tuple!(i_count, set_i_count, u16, 32, 2);
    get_set_field_tuple!(offset, set_offset, u16, 34, 2);
    get_set_field_tuple!(xattr, set_xattr, u32, 36, 4);
}

impl RegularInodeHeader {
    get_set_field_tuple!(start_block, set_start_block, u32, 16, 4);
    get_set_field_tuple!(fragment, set_fragment, u32, 20, 4);
    get_set_field_tuple!(fragment_offset, set_fragment_offset, u32, 24, 4);
    get_set_field_tuple!(file_size, set_file_size, u32, 28, 4);
}

impl LRegularInodeHeader {
    get_set_field_tuple!(start_block, set_start_block, u64, 16, 8);
    get_set_field_tuple!(file_size, set_file_size, u64, 24, 8);
    get_set_field_tuple!(sparse, set_sparse, u64, 32, 8);
    get_set_field_tuple!(nlink, set_nlink, u32, 40, 4);
    get_set_field_tuple!(fragment, set_fragment, u32, 44, 4);
    get_set_field_tuple!(fragment_offset, set_fragment_offset, u32, 48, 4);
    get_set_field_tuple!(xattr, set_xattr, u32, 52, 4);
}

impl SymlinkInodeHeader {
    get_set_field_tuple!(nlink, set_nlink, u32, 16, 4);
    get_set_field_tuple!(symlink_size, set_symlink_size, u32, 20, 4);
}

impl DevInodeHeader {
    get_set_field_tuple!(nlink, set_nlink, u32, 16, 4);
    get_set_field_tuple!(rdev, set_rdev, u32, 20, 4);
}

impl LDevInodeHeader {
    get_set_field_tuple!(nlink, set_nlink, u32, 16, 4);
    get_set_field_tuple!(rdev, set_rdev, u32, 20, 4);
    get_set_field_tuple!(xattr, set_xattr, u32, 24, 4);
}

impl IPCInodeHeader {
    get_set_field_tuple!(nlink, set_nlink, u32, 16, 4);
}

impl LIPCInodeHeader {
    get_set_field_tuple!(nlink, set_nlink, u32, 16, 4);
    get_set_field_tuple!(xattr, set_xattr, u32, 20, 4);
}

pub const DIRECTORY_INDEX_SIZE: usize = 12;

/// One entry of a large directory's index: records where a header beyond
/// the first begins. `index` is the byte offset into the directory's
/// listing at which that header starts (listing size minus this gives how
/// many bytes remain from that header onward), `start_block` is the
/// directory-table metadata block (relative to the table start, always at
/// intra-block offset zero) it lives in, and `name` is its first entry's
/// name, the key a binary search compares a lookup name against.
#[derive(Clone, Debug)]
pub struct DirectoryIndex {
    pub index: u32,
    pub start_block: u32,
    pub name: Vec<u8>,
}

#[derive(Clone, Debug)]
pub enum Inode {
    Directory(DirectoryInodeHeader),
    LDirectory(LDirectoryInodeHeader, Vec<DirectoryIndex>),
    Regular(RegularInodeHeader, Vec<u32>),
    LRegular(LRegularInodeHeader, Vec<u32>),
    Symlink(SymlinkInodeHeader, Vec<u8>),
    LSymlink(SymlinkInodeHeader, Vec<u8>, u32),
    Dev(DevInodeHeader),
    LDev(LDevInodeHeader),
    IPC(IPCInodeHeader),
    LIPC(LIPCInodeHeader),
}

impl Inode {
    pub fn inode_type(&self) -> InodeType {
        match self {
            Inode::Directory(_) => InodeType::Directory,
            Inode::LDirectory(..) => InodeType::LDirectory,
            Inode::Regular(..) => InodeType::File,
            Inode::LRegular(..) => InodeType::LFile,
            Inode::Symlink(..) => InodeType::Symlink,
            Inode::LSymlink(..) => InodeType::LSymlink,
            Inode::Dev(_) => InodeType::BlockDevice,
            Inode::LDev(_) => InodeType::LBlockDevice,
            Inode::IPC(_) => InodeType::NamedPipe,
            Inode::LIPC(_) => InodeType::LSocket,
        }
    }

    pub fn mode(&self) -> u16 {
        match self {
            Inode::Directory(h) => h.mode(),
            Inode::LDirectory(h, _) => h.mode(),
            Inode::Regular(h, _) => h.mode(),
            Inode::LRegular(h, _) => h.mode(),
            Inode::Symlink(h, _) => h.mode(),
            Inode::LSymlink(h, _, _) => h.mode(),
            Inode::Dev(h) => h.mode(),
            Inode::LDev(h) => h.mode(),
            Inode::IPC(h) => h.mode(),
            Inode::LIPC(h) => h.mode(),
        }
    }

    pub fn inode_number(&self) -> u32 {
        match self {
            Inode::Directory(h) => h.inode_number(),
            Inode::LDirectory(h, _) => h.inode_number(),
            Inode::Regular(h, _) => h.inode_number(),
            Inode::LRegular(h, _) => h.inode_number(),
            Inode::Symlink(h, _) => h.inode_number(),
            Inode::LSymlink(h, _, _) => h.inode_number(),
            Inode::Dev(h) => h.inode_number(),
            Inode::LDev(h) => h.inode_number(),
            Inode::IPC(h) => h.inode_number(),
            Inode::LIPC(h) => h.inode_number(),
        }
    }

    pub fn uid_idx(&self) -> u16 {
        match self {
            Inode::Directory(h) => h.uid_idx(),
            Inode::LDirectory(h, _) => h.uid_idx(),
            Inode::Regular(h, _) => h.uid_idx(),
            Inode::LRegular(h, _) => h.uid_idx(),
            Inode::Symlink(h, _) => h.uid_idx(),
            Inode::LSymlink(h, _, _) => h.uid_idx(),
            Inode::Dev(h) => h.uid_idx(),
            Inode::LDev(h) => h.uid_idx(),
            Inode::IPC(h) => h.uid_idx(),
            Inode::LIPC(h) => h.uid_idx(),
        }
    }

    pub fn gid_idx(&self) -> u16 {
        match self {
            Inode::Directory(h) => h.gid_idx(),
            Inode::LDirectory(h, _) => h.gid_idx(),
            Inode::Regular(h, _) => h.gid_idx(),
            Inode::LRegular(h, _) => h.gid_idx(),
            Inode::Symlink(h, _) => h.gid_idx(),
            Inode::LSymlink(h, _, _) => h.gid_idx(),
            Inode::Dev(h) => h.gid_idx(),
            Inode::LDev(h) => h.gid_idx(),
            Inode::IPC(h) => h.gid_idx(),
            Inode::LIPC(h) => h.gid_idx(),
        }
    }

    pub fn xattr_index(&self) -> u32 {
        match self {
            Inode::LDirectory(h, _) => h.xattr(),
            Inode::LRegular(h, _) => h.xattr(),
            Inode::LSymlink(_, _, x) => *x,
            Inode::LDev(h) => h.xattr(),
            Inode::LIPC(h) => h.xattr(),
            _ => INVALID_XATTR,
        }
    }

    pub fn file_size(&self) -> u64 {
        match self {
            Inode::Directory(h) => h.file_size() as u64,
            Inode::LDirectory(h, _) => h.file_size() as u64,
            Inode::Regular(h, _) => h.file_size() as u64,
            Inode::LRegular(h, _) => h.file_size(),
            Inode::Symlink(h, _) => h.symlink_size() as u64,
            Inode::LSymlink(h, _, _) => h.symlink_size() as u64,
            _ => 0,
        }
    }
}

impl Display for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} mode {:o} inode_number {}",
            self.inode_type(),
            self.mode(),
            self.inode_number()
        )
    }
}

fn fragment_blocks(fragment: u32, file_size: u64, superblock: &Superblock) -> u64 {
    if fragment == INVALID_FRAG {
        (file_size + superblock.block_size() as u64 - 1) >> superblock.block_log()
    } else {
        file_size >> superblock.block_log()
    }
}

/// Reads one inode at `cursor`, dispatching on the leading type tag.
pub fn read_inode<F: BlockFile>(
    reader: &MetadataReader<'_, F>,
    cursor: &mut MetaCursor,
    superblock: &Superblock,
) -> Result<Inode> {
    let inode_type = InodeType::from_u16(reader.read_u16(cursor)?)?;
    match inode_type {
        InodeType::Directory => {
            let mut buf = DirectoryInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            Ok(Inode::Directory(buf))
        }
        InodeType::LDirectory => {
            let mut buf = LDirectoryInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            let mut index = Vec::with_capacity(buf.i_count() as usize);
            for _ in 0..buf.i_count() {
                let idx = reader.read_u32(cursor)?;
                let start_block = reader.read_u32(cursor)?;
                let name_size = reader.read_u32(cursor)? + 1;
                let name = reader.read_vec(cursor, name_size as usize)?;
                index.push(DirectoryIndex {
                    index: idx,
                    start_block,
                    name,
                });
            }
            Ok(Inode::LDirectory(buf, index))
        }
        InodeType::File => {
            let mut buf = RegularInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            if buf.fragment() != INVALID_FRAG && buf.fragment() > superblock.fragments() {
                return Err(SquashfsError::corrupt("fragment index out of range"));
            }
            let blocks = fragment_blocks(buf.fragment(), buf.file_size() as u64, superblock);
            let block_list = read_block_list(reader, cursor, blocks)?;
            Ok(Inode::Regular(buf, block_list))
        }
        InodeType::LFile => {
            let mut buf = LRegularInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            let blocks = fragment_blocks(buf.fragment(), buf.file_size(), superblock);
            let block_list = read_block_list(reader, cursor, blocks)?;
            Ok(Inode::LRegular(buf, block_list))
        }
        InodeType::Symlink => {
            let mut buf = SymlinkInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            let target = reader.read_vec(cursor, buf.symlink_size() as usize)?;
            Ok(Inode::Symlink(buf, target))
        }
        InodeType::LSymlink => {
            let mut buf = SymlinkInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            let target = reader.read_vec(cursor, buf.symlink_size() as usize)?;
            let xattr = reader.read_u32(cursor)?;
            Ok(Inode::LSymlink(buf, target, xattr))
        }
        InodeType::BlockDevice | InodeType::CharacterDevice => {
            let mut buf = DevInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            Ok(Inode::Dev(buf))
        }
        InodeType::LBlockDevice | InodeType::LCharacterDevice => {
            let mut buf = LDevInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            Ok(Inode::LDev(buf))
        }
        InodeType::NamedPipe | InodeType::Socket => {
            let mut buf = IPCInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            Ok(Inode::IPC(buf))
        }
        InodeType::LNamedPipe | InodeType::LSocket => {
            let mut buf = LIPCInodeHeader::zeroed();
            buf.0[0..2].copy_from_slice(&inode_type.to_u16().to_le_bytes());
            reader.read(cursor, &mut buf.0[2..])?;
            Ok(Inode::LIPC(buf))
        }
    }
}

fn read_block_list<F: BlockFile>(
    reader: &MetadataReader<'_, F>,
    cursor: &mut MetaCursor,
    blocks: u64,
) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(blocks as usize);
    for _ in 0..blocks {
        out.push(reader.read_u32(cursor)?);
    }
    Ok(out)
}

/// Writes one inode to the metadata stream and returns the reference
/// (relative to the inode table's start) at which it begins.
pub fn write_inode(
    writer: &mut MetadataWriter,
    compressor: &dyn Compressor,
    inode: &Inode,
) -> Result<u64> {
    let start_ref = writer.current_ref();
    match inode {
        Inode::Directory(h) => writer.append(compressor, &h.0)?,
        Inode::LDirectory(h, index) => {
            writer.append(compressor, &h.0)?;
            for entry in index {
                writer.append(compressor, &entry.index.to_le_bytes())?;
                writer.append(compressor, &entry.start_block.to_le_bytes())?;
                let name_size = entry.name.len() as u32 - 1;
                writer.append(compressor, &name_size.to_le_bytes())?;
                writer.append(compressor, &entry.name)?;
            }
        }
        Inode::Regular(h, blocks) => {
            writer.append(compressor, &h.0)?;
            for b in blocks {
                writer.append(compressor, &b.to_le_bytes())?;
            }
        }
        Inode::LRegular(h, blocks) => {
            writer.append(compressor, &h.0)?;
            for b in blocks {
                writer.append(compressor, &b.to_le_bytes())?;
            }
        }
        Inode::Symlink(h, target) => {
            writer.append(compressor, &h.0)?;
            writer.append(compressor, target)?;
        }
        Inode::LSymlink(h, target, xattr) => {
            writer.append(compressor, &h.0)?;
            writer.append(compressor, target)?;
            writer.append(compressor, &xattr.to_le_bytes())?;
        }
        Inode::Dev(h) => writer.append(compressor, &h.0)?,
        Inode::LDev(h) => writer.append(compressor, &h.0)?,
        Inode::IPC(h) => writer.append(compressor, &h.0)?,
        Inode::LIPC(h) => writer.append(compressor, &h.0)?,
    }
    Ok(start_ref)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressors::{CompressorConfig, CompressorId};
    use crate::io_file::MemFile;

    #[test]
    fn regular_inode_roundtrips() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let compressor = cfg.build();

        let mut header = RegularInodeHeader::zeroed();
        header.set_inode_type(InodeType::File.to_u16());
        header.set_mode(0o100644);
        header.set_inode_number(7);
        header.set_fragment(INVALID_FRAG);
        header.set_file_size(262144);
        let inode = Inode::Regular(header, vec![111, 222]);

        let mut writer = MetadataWriter::new();
        write_inode(&mut writer, compressor.as_ref(), &inode).unwrap();
        let table = writer.finish(compressor.as_ref()).unwrap();

        let mut file = MemFile::new();
        file.write_at(0, &table).unwrap();
        let reader = MetadataReader::new(&file, cfg.build(), 0, table.len() as u64);
        let mut cursor = reader.cursor_at(0);

        let mut sb = Superblock::new();
        sb.set_block_size(131072);
        sb.set_block_log(17);
        sb.set_fragments(4);

        let back = read_inode(&reader, &mut cursor, &sb).unwrap();
        match back {
            Inode::Regular(h, blocks) => {
                assert_eq!(h.mode(), 0o100644);
                assert_eq!(h.inode_number(), 7);
                assert_eq!(blocks, vec![111, 222]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn symlink_inode_roundtrips() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let compressor = cfg.build();

        let mut header = SymlinkInodeHeader::zeroed();
        header.set_inode_type(InodeType::Symlink.to_u16());
        header.set_symlink_size(11);
        let inode = Inode::Symlink(header, b"target/path".to_vec());

        let mut writer = MetadataWriter::new();
        write_inode(&mut writer, compressor.as_ref(), &inode).unwrap();
        let table = writer.finish(compressor.as_ref()).unwrap();

        let mut file = MemFile::new();
        file.write_at(0, &table).unwrap();
        let reader = MetadataReader::new(&file, cfg.build(), 0, table.len() as u64);
        let mut cursor = reader.cursor_at(0);
        let sb = Superblock::new();

        let back = read_inode(&reader, &mut cursor, &sb).unwrap();
        match back {
            Inode::Symlink(_, target) => assert_eq!(target, b"target/path"),
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
