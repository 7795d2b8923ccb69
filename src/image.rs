//! Reader-side facade: resolves inodes, directories and the auxiliary
//! tables (fragment, id, export) out of an on-disk image.
//!
//! Resolved inodes and directory listings are cached by their metadata
//! reference so a caller walking the same directory twice (e.g. `ls` then
//! `cat` against a path just listed) doesn't re-touch the metadata layer.
//! The fragment table is small and read in full on first use.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::compressors::{Compressor, CompressorConfig, CompressorId};
use crate::datablock::SPARSE_BLOCK;
use crate::dir::{read_directory, DirEntry};
use crate::error::{Result, SquashfsError};
use crate::export::ExportTableReader;
use crate::fragments::{read_fragment_table, FragmentEntry, BLOCK_UNCOMPRESSED_BIT};
use crate::idtable::IdTableReader;
use crate::inode::{read_inode, Inode, InodeType};
use crate::io_file::BlockFile;
use crate::metadata::{pack_meta_ref, MetadataReader};
use crate::superblock::{Flags, Superblock};
use crate::xattr::{XattrPrefix, XattrReader};
use crate::{INVALID_FRAG, SUPERBLOCK_SIZE};

pub struct Image<F: BlockFile> {
    file: F,
    superblock: Superblock,
    compressor_cfg: CompressorConfig,
    inode_cache: RefCell<HashMap<u64, Inode>>,
    dir_cache: RefCell<HashMap<(u64, u32), Vec<DirEntry>>>,
    fragments: RefCell<Option<Vec<FragmentEntry>>>,
}

impl<F: BlockFile> Image<F> {
    pub fn open(file: F) -> Result<Self> {
        let superblock = Superblock::read(&file)?;
        let compressor_id = CompressorId::from_u16(superblock.compressor())?;

        let options = if superblock.flags().contains(Flags::COMPRESSOR_OPTIONS_PRESENT) {
            let mut buf = [0u8; 8];
            file.read_at(SUPERBLOCK_SIZE as u64, &mut buf)?;
            Some(buf)
        } else {
            None
        };
        let compressor_cfg = CompressorConfig::read_options(
            compressor_id,
            superblock.block_size(),
            options.as_ref().map(|b| b.as_slice()),
        )?;

        Ok(Self {
            file,
            superblock,
            compressor_cfg,
            inode_cache: RefCell::new(HashMap::new()),
            dir_cache: RefCell::new(HashMap::new()),
            fragments: RefCell::new(None),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn compressor(&self) -> Box<dyn Compressor> {
        self.compressor_cfg.build()
    }

    fn inode_table_reader(&self) -> MetadataReader<'_, F> {
        MetadataReader::new(
            &self.file,
            self.compressor(),
            self.superblock.inode_table_start() as u64,
            self.superblock.directory_table_start() as u64,
        )
    }

    fn directory_table_reader(&self) -> MetadataReader<'_, F> {
        MetadataReader::new(
            &self.file,
            self.compressor(),
            self.superblock.directory_table_start() as u64,
            self.superblock.fragment_table_start(),
        )
    }

    fn fragment_table_end(&self) -> u64 {
        if self.superblock.has_export_table() {
            self.superblock.export_table_start() as u64
        } else {
            self.superblock.id_table_start()
        }
    }

    fn fragment_table_reader(&self) -> MetadataReader<'_, F> {
        MetadataReader::new(
            &self.file,
            self.compressor(),
            self.superblock.fragment_table_start(),
            self.fragment_table_end(),
        )
    }

    fn export_table_reader(&self) -> MetadataReader<'_, F> {
        MetadataReader::new(
            &self.file,
            self.compressor(),
            self.superblock.export_table_start() as u64,
            self.superblock.id_table_start(),
        )
    }

    fn id_table_reader(&self) -> MetadataReader<'_, F> {
        MetadataReader::new(
            &self.file,
            self.compressor(),
            self.superblock.id_table_start(),
            self.superblock.bytes_used(),
        )
    }

    /// Reads the 16-byte `(kv_start, ids_start)` header the xattr table
    /// begins with, both offsets relative to the start of the file.
    fn xattr_header(&self) -> Result<(u64, u64)> {
        let start = self.superblock.xattr_id_table_start();
        if start < 0 {
            return Err(SquashfsError::unsupported("image carries no xattr table"));
        }
        let mut buf = [0u8; 16];
        self.file.read_at(start as u64, &mut buf)?;
        let kv_start = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let ids_start = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok((kv_start, ids_start))
    }

    fn xattr_reader(&self) -> Result<XattrReader<'_, F>> {
        let (kv_start, ids_start) = self.xattr_header()?;
        let xattr_table_start = self.superblock.xattr_id_table_start() as u64;
        let kv_reader = MetadataReader::new(&self.file, self.compressor(), kv_start, ids_start);
        let ids_reader = MetadataReader::new(&self.file, self.compressor(), ids_start, xattr_table_start);
        Ok(XattrReader::new(kv_reader, ids_reader))
    }

    /// Reads back one inode's xattrs as full-name/value pairs (e.g.
    /// `user.comment` -> value). Empty if the inode has none or the image
    /// carries no xattr table at all.
    pub fn read_xattrs(&self, inode: &Inode) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let xattr_id = inode.xattr_index();
        if xattr_id == crate::INVALID_XATTR || !self.superblock.has_xattrs() {
            return Ok(Vec::new());
        }
        let reader = self.xattr_reader()?;
        let entries = reader.read_list(xattr_id)?;
        Ok(entries
            .into_iter()
            .map(|e| (XattrPrefix::from_u16(e.prefix).full_name(&e.name), e.value))
            .collect())
    }

    /// Resolves and caches the inode at `inode_ref` (relative to the inode
    /// table's start, as stored in a directory entry or the super block's
    /// `root_inode`).
    pub fn read_inode(&self, inode_ref: u64) -> Result<Inode> {
        if let Some(inode) = self.inode_cache.borrow().get(&inode_ref) {
            return Ok(inode.clone());
        }
        let reader = self.inode_table_reader();
        let mut cursor = reader.cursor_at(inode_ref);
        let inode = read_inode(&reader, &mut cursor, &self.superblock)?;
        self.inode_cache.borrow_mut().insert(inode_ref, inode.clone());
        Ok(inode)
    }

    pub fn root_inode(&self) -> Result<Inode> {
        self.read_inode(self.superblock.root_inode() as u64)
    }

    /// Resolves and caches one directory's full entry list.
    pub fn read_directory(&self, meta_ref: u64, size: u32) -> Result<Vec<DirEntry>> {
        let key = (meta_ref, size);
        if let Some(entries) = self.dir_cache.borrow().get(&key) {
            return Ok(entries.clone());
        }
        let reader = self.directory_table_reader();
        let entries = read_directory(&reader, meta_ref, size)?;
        self.dir_cache.borrow_mut().insert(key, entries.clone());
        Ok(entries)
    }

    /// Convenience wrapper taking a directory's own inode.
    pub fn list_directory(&self, inode: &Inode) -> Result<Vec<DirEntry>> {
        let (block_rel, offset, size) = match inode {
            Inode::Directory(h) => (h.start_block() as u64, h.offset(), h.file_size() as u32),
            Inode::LDirectory(h, _) => (h.start_block() as u64, h.offset(), h.file_size()),
            _ => return Err(SquashfsError::unsupported("not a directory inode")),
        };
        if size == 0 {
            return Ok(Vec::new());
        }
        self.read_directory(pack_meta_ref(block_rel, offset), size)
    }

    /// Walks `path` (`/`-separated, relative to the root) down to its inode.
    pub fn lookup_path(&self, path: &str) -> Result<Inode> {
        let mut current = self.root_inode()?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let entry = self
                .find_entry(&current, component.as_bytes())?
                .ok_or_else(|| SquashfsError::NotFound(format!("no such entry: {component}")))?;
            current = self.read_inode(entry.inode_ref)?;
        }
        Ok(current)
    }

    /// Looks up one named entry in a directory. When the directory carries
    /// an index (an `LDirectory` large enough to have split into more than
    /// one header), binary searches it for the last header whose first
    /// name sorts at or before `name` and reads forward from there instead
    /// of the whole listing.
    pub fn find_entry(&self, inode: &Inode, name: &[u8]) -> Result<Option<DirEntry>> {
        let (block_rel, offset, size, index): (u64, u16, u32, &[crate::inode::DirectoryIndex]) = match inode {
            Inode::Directory(h) => (h.start_block() as u64, h.offset(), h.file_size() as u32, &[]),
            Inode::LDirectory(h, index) => (h.start_block() as u64, h.offset(), h.file_size(), index.as_slice()),
            _ => return Err(SquashfsError::unsupported("not a directory inode")),
        };
        if size == 0 {
            return Ok(None);
        }

        let (meta_ref, remaining) = if index.is_empty() {
            (pack_meta_ref(block_rel, offset), size)
        } else {
            let pos = index.partition_point(|e| e.name.as_slice() <= name);
            if pos == 0 {
                (pack_meta_ref(block_rel, offset), size)
            } else {
                let e = &index[pos - 1];
                (pack_meta_ref(e.start_block as u64, 0), size - e.index)
            }
        };

        let entries = self.read_directory(meta_ref, remaining)?;
        Ok(entries.into_iter().find(|e| e.name == name))
    }

    fn fragment_table(&self) -> Result<Vec<FragmentEntry>> {
        if let Some(table) = self.fragments.borrow().as_ref() {
            return Ok(table.clone());
        }
        let reader = self.fragment_table_reader();
        let table = read_fragment_table(&reader, self.superblock.fragments())?;
        *self.fragments.borrow_mut() = Some(table.clone());
        Ok(table)
    }

    fn fragment_entry(&self, index: u32) -> Result<FragmentEntry> {
        let table = self.fragment_table()?;
        table
            .get(index as usize)
            .copied()
            .ok_or_else(|| SquashfsError::corrupt(format!("fragment index {index} out of range")))
    }

    /// Resolves a 16-bit id-table index (an inode's `uid_idx`/`gid_idx`)
    /// into the real numeric uid/gid.
    pub fn resolve_id(&self, index: u16) -> Result<u32> {
        IdTableReader::new(self.id_table_reader()).get(index)
    }

    /// Maps an NFS-exported inode number back to its metadata reference.
    pub fn export_lookup(&self, inode_number: u32) -> Result<u64> {
        if !self.superblock.has_export_table() {
            return Err(SquashfsError::unsupported("image carries no export table"));
        }
        ExportTableReader::new(self.export_table_reader(), self.superblock.inodes()).lookup(inode_number)
    }

    /// Reassembles a regular file's full content: every full data block
    /// (decompressed in order) followed by its tail fragment, if any.
    pub fn read_file_data(&self, inode: &Inode) -> Result<Vec<u8>> {
        let (blocks, mut cursor, fragment, fragment_offset, file_size) = match inode {
            Inode::Regular(h, blocks) => (
                blocks.clone(),
                h.start_block() as u64,
                h.fragment(),
                h.fragment_offset(),
                h.file_size(),
            ),
            Inode::LRegular(h, blocks) => (
                blocks.clone(),
                h.start_block(),
                h.fragment(),
                h.fragment_offset(),
                h.file_size(),
            ),
            _ => return Err(SquashfsError::unsupported("not a regular file inode")),
        };

        let compressor = self.compressor();
        let block_size = self.superblock.block_size() as usize;
        let mut out = Vec::with_capacity(file_size as usize);

        for stored in blocks {
            if stored == SPARSE_BLOCK {
                out.resize(out.len() + block_size, 0);
                continue;
            }
            let len = (stored & !BLOCK_UNCOMPRESSED_BIT) as u64;
            let uncompressed = stored & BLOCK_UNCOMPRESSED_BIT != 0;
            let mut raw = vec![0u8; len as usize];
            self.file.read_at(cursor, &mut raw)?;
            if uncompressed {
                out.extend_from_slice(&raw);
            } else {
                let mut dec = Vec::with_capacity(block_size);
                compressor.decompress(&raw, &mut dec)?;
                out.extend_from_slice(&dec);
            }
            cursor += len;
        }

        if fragment != INVALID_FRAG {
            let entry = self.fragment_entry(fragment)?;
            let mut raw = vec![0u8; entry.stored_size() as usize];
            self.file.read_at(entry.start_block, &mut raw)?;
            let block = if entry.is_uncompressed() {
                raw
            } else {
                let mut dec = Vec::with_capacity(block_size);
                compressor.decompress(&raw, &mut dec)?;
                dec
            };
            let tail_len = (file_size as usize).saturating_sub(out.len());
            let start = fragment_offset as usize;
            out.extend_from_slice(&block[start..start + tail_len]);
        }

        out.truncate(file_size as usize);
        Ok(out)
    }

    pub fn symlink_target(&self, inode: &Inode) -> Result<Vec<u8>> {
        match inode {
            Inode::Symlink(_, target) | Inode::LSymlink(_, target, _) => Ok(target.clone()),
            _ => Err(SquashfsError::unsupported("not a symlink inode")),
        }
    }

    /// Extracts the whole image under `dest`, restoring mode, ownership and
    /// device nodes. Ownership restoration is best-effort: `EPERM` from
    /// `lchown` (not running as root) is swallowed rather than failing the
    /// whole extraction.
    pub fn extract(&self, dest: &std::path::Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        let root = self.root_inode()?;
        self.extract_dir(&root, dest)
    }

    fn extract_dir(&self, inode: &Inode, dest: &std::path::Path) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;
        for entry in self.list_directory(inode)? {
            let child_inode = self.read_inode(entry.inode_ref)?;
            let child_path = dest.join(std::ffi::OsStr::from_bytes(&entry.name));
            self.extract_entry(&child_inode, &child_path)?;
        }
        Ok(())
    }

    fn extract_entry(&self, inode: &Inode, path: &std::path::Path) -> Result<()> {
        match inode.inode_type() {
            InodeType::Directory | InodeType::LDirectory => {
                std::fs::create_dir_all(path)?;
                self.extract_dir(inode, path)?;
            }
            InodeType::File | InodeType::LFile => {
                std::fs::write(path, self.read_file_data(inode)?)?;
            }
            InodeType::Symlink | InodeType::LSymlink => {
                use std::os::unix::ffi::OsStrExt;
                let target = self.symlink_target(inode)?;
                let _ = std::fs::remove_file(path);
                std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(&target), path)?;
            }
            InodeType::BlockDevice
            | InodeType::LBlockDevice
            | InodeType::CharacterDevice
            | InodeType::LCharacterDevice => self.mknod(inode, path)?,
            InodeType::NamedPipe | InodeType::LNamedPipe => self.mkfifo(path)?,
            InodeType::Socket | InodeType::LSocket => return Ok(()),
        }
        self.restore_owner(inode, path)?;
        self.restore_mode(inode, path)?;
        Ok(())
    }

    fn restore_owner(&self, inode: &Inode, path: &std::path::Path) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;
        let uid = self.resolve_id(inode.uid_idx())?;
        let gid = self.resolve_id(inode.gid_idx())?;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| SquashfsError::corrupt(e.to_string()))?;
        let ret = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn restore_mode(&self, inode: &Inode, path: &std::path::Path) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;
        if matches!(inode.inode_type(), InodeType::Symlink | InodeType::LSymlink) {
            return Ok(());
        }
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| SquashfsError::corrupt(e.to_string()))?;
        let ret = unsafe { libc::chmod(c_path.as_ptr(), (inode.mode() & 0o7777) as libc::mode_t) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn mknod(&self, inode: &Inode, path: &std::path::Path) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;
        let (raw_type, rdev) = match inode {
            Inode::Dev(h) => (h.inode_type(), h.rdev()),
            Inode::LDev(h) => (h.inode_type(), h.rdev()),
            _ => return Err(SquashfsError::unsupported("not a device inode")),
        };
        let kind = InodeType::from_u16(raw_type)?;
        let (major, minor) = crate::tree::scan::split_rdev(rdev as u64);
        let mode_bits = match kind {
            InodeType::BlockDevice | InodeType::LBlockDevice => libc::S_IFBLK,
            _ => libc::S_IFCHR,
        };
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| SquashfsError::corrupt(e.to_string()))?;
        let dev = unsafe { libc::makedev(major, minor) };
        let ret = unsafe { libc::mknod(c_path.as_ptr(), mode_bits as libc::mode_t, dev) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn mkfifo(&self, path: &std::path::Path) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| SquashfsError::corrupt(e.to_string()))?;
        let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

pub fn inode_type_name(inode: &Inode) -> &'static str {
    match inode.inode_type() {
        InodeType::Directory | InodeType::LDirectory => "directory",
        InodeType::File | InodeType::LFile => "file",
        InodeType::Symlink | InodeType::LSymlink => "symlink",
        InodeType::BlockDevice | InodeType::LBlockDevice => "block device",
        InodeType::CharacterDevice | InodeType::LCharacterDevice => "character device",
        InodeType::NamedPipe | InodeType::LNamedPipe => "fifo",
        InodeType::Socket | InodeType::LSocket => "socket",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressors::CompressorId;
    use crate::io_file::MemFile;
    use crate::tree::{Tree, ROOT};
    use crate::writer::{write_image, WriterConfig};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn build_image(tree: &Tree) -> Image<MemFile> {
        let cfg = WriterConfig::new(CompressorConfig::new(CompressorId::Gzip, 131072));
        let out = write_image(tree, MemFile::new(), cfg, Arc::new(AtomicBool::new(false))).unwrap();
        Image::open(out).unwrap()
    }

    #[test]
    fn lists_root_and_reads_file_content() {
        let mut tree = Tree::new(0o40755, 0, 0, 0);
        tree.insert_child(
            ROOT,
            crate::tree::Node {
                name: b"hello.txt".to_vec(),
                kind: crate::tree::NodeKind::Regular {
                    source: None,
                    data: Some(b"hello squashfs".to_vec()),
                    size: 14,
                },
                mode: 0o100644,
                uid: 1000,
                gid: 1000,
                mtime: 0,
                xattrs: std::collections::HashMap::new(),
                parent: None,
                first_child: None,
                next_sibling: None,
            },
        );

        let image = build_image(&tree);
        let root = image.root_inode().unwrap();
        let entries = image.list_directory(&root).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"hello.txt");

        let file_inode = image.read_inode(entries[0].inode_ref).unwrap();
        let content = image.read_file_data(&file_inode).unwrap();
        assert_eq!(content, b"hello squashfs");
    }

    #[test]
    fn resolves_a_nested_path() {
        let mut tree = Tree::new(0o40755, 0, 0, 0);
        let sub = tree.insert_child(
            ROOT,
            crate::tree::Node {
                name: b"sub".to_vec(),
                kind: crate::tree::NodeKind::Directory,
                mode: 0o40755,
                uid: 0,
                gid: 0,
                mtime: 0,
                xattrs: std::collections::HashMap::new(),
                parent: None,
                first_child: None,
                next_sibling: None,
            },
        );
        tree.insert_child(
            sub,
            crate::tree::Node {
                name: b"a.txt".to_vec(),
                kind: crate::tree::NodeKind::Regular {
                    source: None,
                    data: Some(b"aaa".to_vec()),
                    size: 3,
                },
                mode: 0o100644,
                uid: 0,
                gid: 0,
                mtime: 0,
                xattrs: std::collections::HashMap::new(),
                parent: None,
                first_child: None,
                next_sibling: None,
            },
        );

        let image = build_image(&tree);
        let inode = image.lookup_path("sub/a.txt").unwrap();
        assert_eq!(image.read_file_data(&inode).unwrap(), b"aaa");
    }

    #[test]
    fn export_table_round_trips_inode_numbers() {
        let mut tree = Tree::new(0o40755, 0, 0, 0);
        tree.insert_child(
            ROOT,
            crate::tree::Node {
                name: b"f".to_vec(),
                kind: crate::tree::NodeKind::Regular {
                    source: None,
                    data: Some(b"x".to_vec()),
                    size: 1,
                },
                mode: 0o100644,
                uid: 0,
                gid: 0,
                mtime: 0,
                xattrs: std::collections::HashMap::new(),
                parent: None,
                first_child: None,
                next_sibling: None,
            },
        );

        let image = build_image(&tree);
        assert!(image.superblock().has_export_table());
        let inode_ref = image.export_lookup(1).unwrap();
        let root = image.read_inode(inode_ref).unwrap();
        assert!(matches!(root, Inode::Directory(_) | Inode::LDirectory(..)));
    }
}
