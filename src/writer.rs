//! L5/L6 front-end: turns an in-memory [`Tree`] into a complete image.
//!
//! Inode numbers are assigned up front by [`Tree::depth_first_order`] (every
//! non-directory before the subdirectories of its level are recursed into),
//! matching how a reader expects numbering to work. Inodes are then written
//! bottom-up: a directory's own inode can only be written once every child's
//! inode (and therefore its metadata reference) is known, which is the
//! opposite order from numbering. The two passes share the same
//! `NodeId -> inode_number` map computed once at the start.

use crate::compressors::{Compressor, CompressorConfig};
use crate::datablock::{CompressionPool, DataAppender, FilePipeline, FragmentPacker};
use crate::dir::{DirEntryIn, DirectoryWriter};
use crate::error::{Result, SquashfsError};
use crate::export::ExportTableWriter;
use crate::idtable::IdTableWriter;
use crate::inode::{
    DevInodeHeader, DirectoryInodeHeader, IPCInodeHeader, Inode, InodeType, LDevInodeHeader,
    LDirectoryInodeHeader, LIPCInodeHeader, LRegularInodeHeader, RegularInodeHeader,
    SymlinkInodeHeader,
};
use crate::io_file::BlockFile;
use crate::metadata::{pack_meta_ref, unpack_meta_ref, MetadataWriter};
use crate::superblock::{Flags, Superblock};
use crate::tree::{Node, NodeId, NodeKind, Tree, ROOT};
use crate::xattr::{XattrEntry, XattrWriter};
use crate::{INVALID_BLK, INVALID_FRAG, INVALID_XATTR, SUPERBLOCK_SIZE};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Knobs for [`write_image`]. Everything besides the compressor has a
/// sensible default.
#[derive(Clone)]
pub struct WriterConfig {
    pub compressor: CompressorConfig,
    pub workers: usize,
    /// Pad a file's final short block up to `block_size` and write it as a
    /// regular block instead of tail-packing it into a fragment.
    pub no_fragments: bool,
    /// Build an NFS export table.
    pub export: bool,
    pub mkfs_time: u32,
}

impl WriterConfig {
    pub fn new(compressor: CompressorConfig) -> Self {
        Self {
            compressor,
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            no_fragments: false,
            export: true,
            mkfs_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0),
        }
    }
}

/// Builds a complete image from `tree` into `file`, returning it on success.
/// On any error (including cancellation) the output is truncated to zero
/// bytes before the error is returned, so a caller never ships a half
/// written image under the requested name.
pub fn write_image<F: BlockFile>(
    tree: &Tree,
    mut file: F,
    cfg: WriterConfig,
    cancel: Arc<AtomicBool>,
) -> Result<F> {
    tracing::info!(
        compressor = ?cfg.compressor.id,
        block_size = cfg.compressor.block_size,
        "building image",
    );
    match build(tree, &mut file, &cfg, &cancel) {
        Ok(()) => {
            tracing::info!("image complete");
            Ok(file)
        }
        Err(e) => {
            tracing::error!(error = %e, "build failed, discarding output");
            let _ = file.truncate(0);
            Err(e)
        }
    }
}

struct BuiltNode {
    inode_number: u32,
    inode_ref: u64,
    /// Basic (1..=7) inode type tag, even when the inode itself is extended.
    basic_type: u16,
}

struct BuildCtx<'a, F: BlockFile> {
    compressor: &'a dyn Compressor,
    pool: &'a CompressionPool,
    appender: DataAppender<&'a mut F>,
    fragments: FragmentPacker,
    inode_meta: MetadataWriter,
    dir_writer: DirectoryWriter,
    ids: IdTableWriter,
    xattrs: XattrWriter,
    block_size: usize,
    no_fragments: bool,
    cancel: Arc<AtomicBool>,
    inode_refs: HashMap<u32, u64>,
}

fn build<F: BlockFile>(
    tree: &Tree,
    file: &mut F,
    cfg: &WriterConfig,
    cancel: &Arc<AtomicBool>,
) -> Result<()> {
    let compressor = cfg.compressor.build();
    file.write_at(0, &[0u8; SUPERBLOCK_SIZE])?;

    let block_size = cfg.compressor.block_size as usize;
    let pool = CompressionPool::new(cfg.compressor.clone(), cfg.workers.max(1));

    let order = tree.depth_first_order();
    let mut inode_numbers: HashMap<NodeId, u32> = HashMap::with_capacity(order.len());
    for (i, &id) in order.iter().enumerate() {
        inode_numbers.insert(id, i as u32 + 1);
    }

    let mut ctx = BuildCtx {
        compressor: compressor.as_ref(),
        pool: &pool,
        appender: DataAppender::new(&mut *file, SUPERBLOCK_SIZE as u64),
        fragments: FragmentPacker::new(block_size),
        inode_meta: MetadataWriter::new(),
        dir_writer: DirectoryWriter::new(),
        ids: IdTableWriter::new(),
        xattrs: XattrWriter::new(),
        block_size,
        no_fragments: cfg.no_fragments,
        cancel: cancel.clone(),
        inode_refs: HashMap::new(),
    };

    let root = ctx.build_node(tree, ROOT, &inode_numbers)?;

    let BuildCtx {
        compressor: _,
        pool: _,
        mut appender,
        fragments,
        inode_meta,
        dir_writer,
        ids,
        xattrs,
        inode_refs,
        ..
    } = ctx;
    pool.shutdown();

    let ids_count = ids.count();
    let has_xattrs = !xattrs.is_empty();
    let frag_table_writer = fragments.finish(&mut appender, compressor.as_ref())?;
    let frag_count = frag_table_writer.count();
    let data_end = appender.offset();
    let file_ref = appender.into_file();

    let inode_table = inode_meta.finish(compressor.as_ref())?;
    let dir_table = dir_writer.finish(compressor.as_ref())?;
    let ids_table = ids.finish(compressor.as_ref())?;
    let fragment_table = frag_table_writer.finish(compressor.as_ref())?;
    let (xattr_kv, xattr_ids) = xattrs.finish(compressor.as_ref())?;

    let mut cursor = data_end;
    let inode_table_start = cursor;
    file_ref.write_at(cursor, &inode_table)?;
    cursor += inode_table.len() as u64;

    let directory_table_start = cursor;
    file_ref.write_at(cursor, &dir_table)?;
    cursor += dir_table.len() as u64;

    let fragment_table_start = cursor;
    file_ref.write_at(cursor, &fragment_table)?;
    cursor += fragment_table.len() as u64;

    let mut export_table_start = INVALID_BLK;
    if cfg.export {
        let mut export_writer = ExportTableWriter::new();
        for i in 1..=(order.len() as u32) {
            let inode_ref = inode_refs.get(&i).copied().ok_or_else(|| {
                SquashfsError::corrupt(format!("inode {i} was numbered but never written"))
            })?;
            export_writer.push(compressor.as_ref(), inode_ref)?;
        }
        let export_bytes = export_writer.finish(compressor.as_ref())?;
        export_table_start = cursor as i64;
        file_ref.write_at(cursor, &export_bytes)?;
        cursor += export_bytes.len() as u64;
    }

    let id_table_start = cursor;
    file_ref.write_at(cursor, &ids_table)?;
    cursor += ids_table.len() as u64;

    let mut xattr_table_start = INVALID_BLK;
    if has_xattrs {
        let kv_start = cursor;
        file_ref.write_at(cursor, &xattr_kv)?;
        cursor += xattr_kv.len() as u64;

        let ids_start = cursor;
        file_ref.write_at(cursor, &xattr_ids)?;
        cursor += xattr_ids.len() as u64;

        xattr_table_start = cursor as i64;
        file_ref.write_at(cursor, &kv_start.to_le_bytes())?;
        cursor += 8;
        file_ref.write_at(cursor, &ids_start.to_le_bytes())?;
        cursor += 8;
    }

    let mut sb = Superblock::new();
    sb.set_inodes(order.len() as u32);
    sb.set_mkfs_time(cfg.mkfs_time);
    sb.set_block_size(cfg.compressor.block_size);
    sb.set_block_log(cfg.compressor.block_size.trailing_zeros() as u16);
    sb.set_fragments(frag_count);
    sb.set_compressor(cfg.compressor.id.to_u16());
    sb.set_no_ids(ids_count);
    sb.set_root_inode(root.inode_ref as i64);
    sb.set_bytes_used(cursor);
    sb.set_id_table_start(id_table_start);
    sb.set_inode_table_start(inode_table_start as i64);
    sb.set_directory_table_start(directory_table_start as i64);
    sb.set_fragment_table_start(fragment_table_start);
    sb.set_export_table_start(export_table_start);
    sb.set_xattr_id_table_start(xattr_table_start);

    let mut flags = Flags::empty();
    flags.set(Flags::DATA_DEDUPLICATED, true);
    flags.set(Flags::NO_XATTRS_IN_ARCHIVE, !has_xattrs);
    flags.set(Flags::FRAGMENTS_ARE_NOT_USED, frag_count == 0);
    flags.set(Flags::NFSEXPORT_TABLE_EXISTS, cfg.export);
    sb.set_flags(flags);

    sb.write(file_ref)?;
    Ok(())
}

impl<'a, F: BlockFile> BuildCtx<'a, F> {
    /// Returns `INVALID_XATTR` for a node with no attached xattrs, or the id
    /// of its (deduplicated) xattr list otherwise.
    fn xattr_id_for(&mut self, node: &Node) -> Result<u32> {
        if node.xattrs.is_empty() {
            return Ok(INVALID_XATTR);
        }
        let entries = node
            .xattrs
            .iter()
            .map(|(full_name, value)| {
                let (prefix, name) = crate::xattr::split_name(full_name);
                XattrEntry {
                    prefix: prefix.to_u16(),
                    name,
                    value: value.clone(),
                }
            })
            .collect();
        self.xattrs.add_list(self.compressor, entries)
    }

    fn build_node(&mut self, tree: &Tree, id: NodeId, numbers: &HashMap<NodeId, u32>) -> Result<BuiltNode> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SquashfsError::Cancelled);
        }
        let node = tree.node(id).clone();
        match &node.kind {
            NodeKind::Directory => self.build_directory(tree, id, &node, numbers),
            NodeKind::Regular { source, data, size } => {
                self.build_regular(&node, numbers[&id], source.as_deref(), data.as_deref(), *size)
            }
            NodeKind::Symlink { target } => self.build_symlink(&node, numbers[&id], target),
            NodeKind::BlockDevice { major, minor } => {
                self.build_dev(&node, numbers[&id], InodeType::BlockDevice, *major, *minor)
            }
            NodeKind::CharDevice { major, minor } => {
                self.build_dev(&node, numbers[&id], InodeType::CharacterDevice, *major, *minor)
            }
            NodeKind::Fifo => self.build_ipc(&node, numbers[&id], InodeType::NamedPipe),
            NodeKind::Socket => self.build_ipc(&node, numbers[&id], InodeType::Socket),
        }
    }

    fn build_directory(
        &mut self,
        tree: &Tree,
        id: NodeId,
        node: &Node,
        numbers: &HashMap<NodeId, u32>,
    ) -> Result<BuiltNode> {
        let children = tree.children(id);
        let mut entries = Vec::with_capacity(children.len());
        let mut subdirs = 0u32;
        for &child_id in &children {
            let built = self.build_node(tree, child_id, numbers)?;
            let child_node = tree.node(child_id);
            if matches!(child_node.kind, NodeKind::Directory) {
                subdirs += 1;
            }
            entries.push(DirEntryIn {
                name: child_node.name.clone(),
                inode_number: built.inode_number,
                inode_ref: built.inode_ref,
                basic_type: built.basic_type,
            });
        }

        let loc = self.dir_writer.write_directory(self.compressor, &entries)?;
        let (block_rel, offset) = unpack_meta_ref(loc.meta_ref);
        let file_size = loc.size as u64;

        let inode_number = numbers[&id];
        let parent_inode_number = node.parent.and_then(|p| numbers.get(&p).copied()).unwrap_or(inode_number);
        let uid = self.ids.intern(self.compressor, node.uid)?;
        let gid = self.ids.intern(self.compressor, node.gid)?;
        let nlink = 2 + subdirs;
        let xattr_id = self.xattr_id_for(node)?;

        let extended =
            block_rel > u32::MAX as u64 || file_size > u16::MAX as u64 || !loc.index.is_empty() || xattr_id != INVALID_XATTR;
        let inode = if extended {
            let mut h = LDirectoryInodeHeader::zeroed();
            h.set_inode_type(InodeType::LDirectory.to_u16());
            h.set_mode(node.mode);
            h.set_uid_idx(uid);
            h.set_gid_idx(gid);
            h.set_mtime(node.mtime);
            h.set_inode_number(inode_number);
            h.set_nlink(nlink);
            h.set_file_size(file_size as u32);
            h.set_start_block(block_rel as u32);
            h.set_offset(offset);
            h.set_parent_inode(parent_inode_number);
            h.set_i_count(loc.index.len() as u16);
            h.set_xattr(xattr_id);
            Inode::LDirectory(h, loc.index)
        } else {
            let mut h = DirectoryInodeHeader::zeroed();
            h.set_inode_type(InodeType::Directory.to_u16());
            h.set_mode(node.mode);
            h.set_uid_idx(uid);
            h.set_gid_idx(gid);
            h.set_mtime(node.mtime);
            h.set_inode_number(inode_number);
            h.set_start_block(block_rel as u32);
            h.set_nlink(nlink);
            h.set_file_size(file_size as u16);
            h.set_offset(offset);
            h.set_parent_inode(parent_inode_number);
            Inode::Directory(h)
        };

        self.finish_inode(inode_number, inode, InodeType::Directory.to_u16())
    }

    fn build_regular(
        &mut self,
        node: &Node,
        inode_number: u32,
        source: Option<&Path>,
        data: Option<&[u8]>,
        _declared_size: u64,
    ) -> Result<BuiltNode> {
        let (blocks, tail, total_len) = if let Some(d) = data {
            split_into_blocks(&mut std::io::Cursor::new(d), self.block_size)?
        } else if let Some(path) = source {
            let f = File::open(path)?;
            split_into_blocks(&mut BufReader::new(f), self.block_size)?
        } else {
            (Vec::new(), None, 0)
        };

        let mut blocks = blocks;
        let mut fragment_index = INVALID_FRAG;
        let mut fragment_offset = 0u32;
        if let Some(tail) = tail {
            if self.no_fragments {
                let mut padded = tail;
                padded.resize(self.block_size, 0);
                blocks.push(padded);
            } else {
                let (idx, off) = self.fragments.add_tail(&tail, &mut self.appender, self.compressor)?;
                fragment_index = idx;
                fragment_offset = off;
            }
        }

        let start_block = self.appender.offset();
        let block_sizes = {
            let mut pipeline =
                FilePipeline::new(&mut self.appender, self.pool, self.block_size, self.cancel.clone());
            pipeline.run(blocks)?
        };

        let uid = self.ids.intern(self.compressor, node.uid)?;
        let gid = self.ids.intern(self.compressor, node.gid)?;
        let xattr_id = self.xattr_id_for(node)?;

        let extended = start_block > u32::MAX as u64 || total_len > u32::MAX as u64 || xattr_id != INVALID_XATTR;
        let inode = if extended {
            let mut h = LRegularInodeHeader::zeroed();
            h.set_inode_type(InodeType::LFile.to_u16());
            h.set_mode(node.mode);
            h.set_uid_idx(uid);
            h.set_gid_idx(gid);
            h.set_mtime(node.mtime);
            h.set_inode_number(inode_number);
            h.set_start_block(start_block);
            h.set_file_size(total_len);
            h.set_sparse(0);
            h.set_nlink(1);
            h.set_fragment(fragment_index);
            h.set_fragment_offset(fragment_offset);
            h.set_xattr(xattr_id);
            Inode::LRegular(h, block_sizes)
        } else {
            let mut h = RegularInodeHeader::zeroed();
            h.set_inode_type(InodeType::File.to_u16());
            h.set_mode(node.mode);
            h.set_uid_idx(uid);
            h.set_gid_idx(gid);
            h.set_mtime(node.mtime);
            h.set_inode_number(inode_number);
            h.set_start_block(start_block as u32);
            h.set_fragment(fragment_index);
            h.set_fragment_offset(fragment_offset);
            h.set_file_size(total_len as u32);
            Inode::Regular(h, block_sizes)
        };

        self.finish_inode(inode_number, inode, InodeType::File.to_u16())
    }

    fn build_symlink(&mut self, node: &Node, inode_number: u32, target: &[u8]) -> Result<BuiltNode> {
        let uid = self.ids.intern(self.compressor, node.uid)?;
        let gid = self.ids.intern(self.compressor, node.gid)?;
        let xattr_id = self.xattr_id_for(node)?;

        let mut h = SymlinkInodeHeader::zeroed();
        h.set_mode(node.mode);
        h.set_uid_idx(uid);
        h.set_gid_idx(gid);
        h.set_mtime(node.mtime);
        h.set_inode_number(inode_number);
        h.set_nlink(1);
        h.set_symlink_size(target.len() as u32);

        let inode = if xattr_id != INVALID_XATTR {
            h.set_inode_type(InodeType::LSymlink.to_u16());
            Inode::LSymlink(h, target.to_vec(), xattr_id)
        } else {
            h.set_inode_type(InodeType::Symlink.to_u16());
            Inode::Symlink(h, target.to_vec())
        };

        self.finish_inode(inode_number, inode, InodeType::Symlink.to_u16())
    }

    fn build_dev(
        &mut self,
        node: &Node,
        inode_number: u32,
        kind: InodeType,
        major: u32,
        minor: u32,
    ) -> Result<BuiltNode> {
        let uid = self.ids.intern(self.compressor, node.uid)?;
        let gid = self.ids.intern(self.compressor, node.gid)?;
        let xattr_id = self.xattr_id_for(node)?;

        let inode = if xattr_id != INVALID_XATTR {
            let ext_kind = match kind {
                InodeType::BlockDevice => InodeType::LBlockDevice,
                InodeType::CharacterDevice => InodeType::LCharacterDevice,
                other => other,
            };
            let mut h = LDevInodeHeader::zeroed();
            h.set_inode_type(ext_kind.to_u16());
            h.set_mode(node.mode);
            h.set_uid_idx(uid);
            h.set_gid_idx(gid);
            h.set_mtime(node.mtime);
            h.set_inode_number(inode_number);
            h.set_nlink(1);
            h.set_rdev(combine_rdev(major, minor));
            h.set_xattr(xattr_id);
            Inode::LDev(h)
        } else {
            let mut h = DevInodeHeader::zeroed();
            h.set_inode_type(kind.to_u16());
            h.set_mode(node.mode);
            h.set_uid_idx(uid);
            h.set_gid_idx(gid);
            h.set_mtime(node.mtime);
            h.set_inode_number(inode_number);
            h.set_nlink(1);
            h.set_rdev(combine_rdev(major, minor));
            Inode::Dev(h)
        };

        self.finish_inode(inode_number, inode, kind.to_u16())
    }

    fn build_ipc(&mut self, node: &Node, inode_number: u32, kind: InodeType) -> Result<BuiltNode> {
        let uid = self.ids.intern(self.compressor, node.uid)?;
        let gid = self.ids.intern(self.compressor, node.gid)?;
        let xattr_id = self.xattr_id_for(node)?;

        let inode = if xattr_id != INVALID_XATTR {
            let ext_kind = match kind {
                InodeType::NamedPipe => InodeType::LNamedPipe,
                InodeType::Socket => InodeType::LSocket,
                other => other,
            };
            let mut h = LIPCInodeHeader::zeroed();
            h.set_inode_type(ext_kind.to_u16());
            h.set_mode(node.mode);
            h.set_uid_idx(uid);
            h.set_gid_idx(gid);
            h.set_mtime(node.mtime);
            h.set_inode_number(inode_number);
            h.set_nlink(1);
            h.set_xattr(xattr_id);
            Inode::LIPC(h)
        } else {
            let mut h = IPCInodeHeader::zeroed();
            h.set_inode_type(kind.to_u16());
            h.set_mode(node.mode);
            h.set_uid_idx(uid);
            h.set_gid_idx(gid);
            h.set_mtime(node.mtime);
            h.set_inode_number(inode_number);
            h.set_nlink(1);
            Inode::IPC(h)
        };

        self.finish_inode(inode_number, inode, kind.to_u16())
    }

    fn finish_inode(&mut self, inode_number: u32, inode: Inode, basic_type: u16) -> Result<BuiltNode> {
        let inode_ref = crate::inode::write_inode(&mut self.inode_meta, self.compressor, &inode)?;
        self.inode_refs.insert(inode_number, inode_ref);
        Ok(BuiltNode {
            inode_number,
            inode_ref,
            basic_type,
        })
    }
}

/// Reads `r` in `block_size` chunks. Every full chunk is returned in
/// `blocks`; a final, shorter chunk (if any) is returned separately so the
/// caller can route it to the fragment writer instead. Also returns the
/// total byte count read, independent of whatever size a caller believed
/// the content to be.
fn split_into_blocks<R: Read>(r: &mut R, block_size: usize) -> Result<(Vec<Vec<u8>>, Option<Vec<u8>>, u64)> {
    let mut blocks = Vec::new();
    let mut total = 0u64;
    loop {
        let mut buf = vec![0u8; block_size];
        let n = read_fill(r, &mut buf)?;
        total += n as u64;
        if n == 0 {
            return Ok((blocks, None, total));
        }
        if n == block_size {
            blocks.push(buf);
        } else {
            buf.truncate(n);
            return Ok((blocks, Some(buf), total));
        }
    }
}

fn read_fill<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

/// Inverse of `tree::scan::split_rdev`.
fn combine_rdev(major: u32, minor: u32) -> u32 {
    ((major & 0xfff) << 8) | (minor & 0xff) | ((minor & !0xff) << 12)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressors::CompressorId;
    use crate::dir::read_directory;
    use crate::inode::read_inode;
    use crate::io_file::MemFile;
    use crate::metadata::MetadataReader;

    fn file_node(name: &[u8], content: &[u8]) -> Node {
        Node {
            name: name.to_vec(),
            kind: NodeKind::Regular {
                source: None,
                data: Some(content.to_vec()),
                size: content.len() as u64,
            },
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            mtime: 1_700_000_000,
            xattrs: HashMap::new(),
            parent: None,
            first_child: None,
            next_sibling: None,
        }
    }

    fn dir_node(name: &[u8]) -> Node {
        Node {
            name: name.to_vec(),
            kind: NodeKind::Directory,
            mode: 0o40755,
            uid: 0,
            gid: 0,
            mtime: 1_700_000_000,
            xattrs: HashMap::new(),
            parent: None,
            first_child: None,
            next_sibling: None,
        }
    }

    #[test]
    fn roundtrips_a_single_file() {
        let mut tree = Tree::new(0o40755, 0, 0, 0);
        tree.insert_child(ROOT, file_node(b"hello.txt", b"hello world"));

        let cfg = WriterConfig::new(CompressorConfig::new(CompressorId::Gzip, 131072));
        let out = write_image(&tree, MemFile::new(), cfg, Arc::new(AtomicBool::new(false))).unwrap();

        let sb = Superblock::read(&out).unwrap();
        assert_eq!(sb.inodes(), 2);
        assert!(sb.bytes_used() > SUPERBLOCK_SIZE as u64);

        let compressor = CompressorConfig::new(CompressorId::Gzip, sb.block_size());
        let inode_reader = MetadataReader::new(
            &out,
            compressor.build(),
            sb.inode_table_start() as u64,
            sb.directory_table_start() as u64,
        );
        let mut cursor = inode_reader.cursor_at(sb.root_inode() as u64);
        let root_inode = read_inode(&inode_reader, &mut cursor, &sb).unwrap();
        let (start_block, offset, size) = match root_inode {
            Inode::Directory(h) => (h.start_block() as u64, h.offset(), h.file_size() as u32),
            Inode::LDirectory(h, _) => (h.start_block() as u64, h.offset(), h.file_size()),
            other => panic!("root is not a directory: {other:?}"),
        };

        let dir_reader = MetadataReader::new(
            &out,
            compressor.build(),
            sb.directory_table_start() as u64,
            sb.fragment_table_start(),
        );
        let entries = read_directory(&dir_reader, pack_meta_ref(start_block, offset), size).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"hello.txt");
        assert_eq!(entries[0].basic_type, InodeType::File.to_u16());
    }

    #[test]
    fn nested_directories_count_every_inode() {
        let mut tree = Tree::new(0o40755, 0, 0, 0);
        let sub = tree.insert_child(ROOT, dir_node(b"sub"));
        tree.insert_child(sub, file_node(b"a.txt", b"aaa"));
        tree.insert_child(ROOT, file_node(b"b.txt", b"bbb"));

        let cfg = WriterConfig::new(CompressorConfig::new(CompressorId::Gzip, 131072));
        let out = write_image(&tree, MemFile::new(), cfg, Arc::new(AtomicBool::new(false))).unwrap();

        let sb = Superblock::read(&out).unwrap();
        assert_eq!(sb.inodes(), 4);
        assert!(sb.has_export_table());
    }

    #[test]
    fn cancellation_aborts_the_build() {
        let mut tree = Tree::new(0o40755, 0, 0, 0);
        tree.insert_child(ROOT, file_node(b"big.bin", &vec![0xabu8; 1 << 20]));

        let cfg = WriterConfig::new(CompressorConfig::new(CompressorId::Gzip, 131072));
        let cancel = Arc::new(AtomicBool::new(true));
        let err = write_image(&tree, MemFile::new(), cfg, cancel).unwrap_err();
        assert!(matches!(err, SquashfsError::Cancelled));
    }
}
