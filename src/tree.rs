//! In-memory filesystem tree: an arena of nodes linked by parent/first-child/
//! next-sibling indices (no `Rc`/`RefCell` graph), built either by walking a
//! real directory or by parsing a pseudo-file listing.

use crate::error::{Result, SquashfsError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub type NodeId = u32;
pub const ROOT: NodeId = 0;

#[derive(Clone, Debug)]
pub enum NodeKind {
    Directory,
    Regular {
        source: Option<PathBuf>,
        /// Set instead of `source` for content already in memory (tar
        /// entries, pseudo-files created empty by the listing parser).
        data: Option<Vec<u8>>,
        size: u64,
    },
    Symlink { target: Vec<u8> },
    BlockDevice { major: u32, minor: u32 },
    CharDevice { major: u32, minor: u32 },
    Fifo,
    Socket,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub name: Vec<u8>,
    pub kind: NodeKind,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    /// Full attribute name (e.g. `user.comment`) to value. Empty for the
    /// overwhelming majority of nodes.
    pub xattrs: HashMap<Vec<u8>, Vec<u8>>,
    pub parent: Option<NodeId>,
    pub first_child: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
}

/// Owns every node by index; traversal follows `first_child`/`next_sibling`
/// links instead of per-node owned collections.
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn new(root_mode: u16, root_uid: u32, root_gid: u32, root_mtime: u32) -> Self {
        Self {
            nodes: vec![Node {
                name: Vec::new(),
                kind: NodeKind::Directory,
                mode: root_mode,
                uid: root_uid,
                gid: root_gid,
                mtime: root_mtime,
                xattrs: HashMap::new(),
                parent: None,
                first_child: None,
                next_sibling: None,
            }],
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id as usize]
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.nodes[id as usize].first_child;
        while let Some(c) = cur {
            out.push(c);
            cur = self.nodes[c as usize].next_sibling;
        }
        out
    }

    /// Appends `node` as a child of `parent`, keeping siblings sorted by
    /// name (the order directories are written in).
    pub fn insert_child(&mut self, parent: NodeId, node: Node) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(node);
        self.nodes[id as usize].parent = Some(parent);

        let first = self.nodes[parent as usize].first_child;
        match first {
            None => self.nodes[parent as usize].first_child = Some(id),
            Some(first) => {
                if self.nodes[id as usize].name < self.nodes[first as usize].name {
                    self.nodes[id as usize].next_sibling = Some(first);
                    self.nodes[parent as usize].first_child = Some(id);
                } else {
                    let mut prev = first;
                    loop {
                        match self.nodes[prev as usize].next_sibling {
                            Some(next) if self.nodes[next as usize].name <= self.nodes[id as usize].name => {
                                prev = next;
                            }
                            other => {
                                self.nodes[id as usize].next_sibling = other;
                                self.nodes[prev as usize].next_sibling = Some(id);
                                break;
                            }
                        }
                    }
                }
            }
        }
        id
    }

    pub fn find_child(&self, parent: NodeId, name: &[u8]) -> Option<NodeId> {
        self.children(parent)
            .into_iter()
            .find(|&c| self.nodes[c as usize].name == name)
    }

    /// Depth-first order with every non-directory visited before the
    /// directories are recursed into, matching on-disk inode numbering.
    pub fn depth_first_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        self.visit(ROOT, &mut out);
        out
    }

    fn visit(&self, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        let children = self.children(id);
        let (dirs, files): (Vec<_>, Vec<_>) = children
            .into_iter()
            .partition(|&c| matches!(self.nodes[c as usize].kind, NodeKind::Directory));
        for f in files {
            out.push(f);
        }
        for d in dirs {
            self.visit(d, out);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Walks a real directory tree on disk, in filename order, skipping nothing
/// (exclusion rules live one layer up, in the CLI).
pub mod scan {
    use super::*;
    use std::fs;
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    use walkdir::WalkDir;
    use xattr as fsxattr;

    /// Reads every xattr a real filesystem has attached to `path`. Missing
    /// support (common on tmpfs, some overlay mounts) is silently treated
    /// as "no xattrs" rather than failing the whole scan.
    fn read_fs_xattrs(path: &Path) -> HashMap<Vec<u8>, Vec<u8>> {
        let mut out = HashMap::new();
        let Ok(names) = fsxattr::list(path) else {
            return out;
        };
        for name in names {
            if let Ok(Some(value)) = fsxattr::get(path, &name) {
                out.insert(name.to_string_lossy().into_owned().into_bytes(), value);
            }
        }
        out
    }

    pub fn scan(root: &Path) -> Result<Tree> {
        let root_meta = fs::symlink_metadata(root)
            .map_err(|e| SquashfsError::corrupt(format!("cannot stat {}: {e}", root.display())))?;
        let mut tree = Tree::new(
            (root_meta.mode() & 0xffff) as u16,
            root_meta.uid(),
            root_meta.gid(),
            root_meta.mtime() as u32,
        );

        // `sort_by_file_name` keeps each directory's children in the order
        // the directory writer expects; `min_depth(1)` skips the root itself
        // (already seeded above) and `into_iter()` never follows symlinks.
        let mut ids: HashMap<PathBuf, NodeId> = HashMap::new();
        ids.insert(root.to_path_buf(), ROOT);

        for entry in WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = entry
                .map_err(|e| SquashfsError::corrupt(format!("walking {}: {e}", root.display())))?;
            let child_path = entry.path();
            let parent_path = child_path.parent().unwrap_or(root);
            let parent_id = *ids.get(parent_path).ok_or_else(|| {
                SquashfsError::corrupt(format!("{} visited before its parent", child_path.display()))
            })?;

            let meta = fs::symlink_metadata(child_path)
                .map_err(|e| SquashfsError::corrupt(format!("cannot stat {}: {e}", child_path.display())))?;
            let file_type = meta.file_type();

            let kind = if file_type.is_dir() {
                NodeKind::Directory
            } else if file_type.is_symlink() {
                let target = fs::read_link(child_path).map_err(|e| {
                    SquashfsError::corrupt(format!("cannot readlink {}: {e}", child_path.display()))
                })?;
                NodeKind::Symlink {
                    target: target.to_string_lossy().into_owned().into_bytes(),
                }
            } else if file_type.is_file() {
                NodeKind::Regular {
                    source: Some(child_path.to_path_buf()),
                    data: None,
                    size: meta.size(),
                }
            } else if file_type.is_block_device() {
                let (major, minor) = split_rdev(meta.rdev());
                NodeKind::BlockDevice { major, minor }
            } else if file_type.is_char_device() {
                let (major, minor) = split_rdev(meta.rdev());
                NodeKind::CharDevice { major, minor }
            } else if file_type.is_fifo() {
                NodeKind::Fifo
            } else {
                NodeKind::Socket
            };

            let node = Node {
                name: entry.file_name().to_string_lossy().into_owned().into_bytes(),
                kind,
                mode: (meta.mode() & 0xffff) as u16,
                uid: meta.uid(),
                gid: meta.gid(),
                mtime: meta.mtime() as u32,
                xattrs: read_fs_xattrs(child_path),
                parent: None,
                first_child: None,
                next_sibling: None,
            };
            let id = tree.insert_child(parent_id, node);
            if file_type.is_dir() {
                ids.insert(child_path.to_path_buf(), id);
            }
        }

        Ok(tree)
    }

    pub(crate) fn split_rdev(rdev: u64) -> (u32, u32) {
        let major = (rdev >> 8) as u32 & 0xfff;
        let minor = (rdev & 0xff) as u32 | ((rdev >> 12) as u32 & !0xff);
        (major, minor)
    }
}

/// Parses a pseudo-file listing: one entry per line,
/// `path type mode uid gid [extra...]` where `extra` is a symlink target,
/// `major minor` for device nodes, or nothing for directories/fifos/sockets.
pub mod listing {
    use super::*;

    pub fn parse(text: &str) -> Result<Tree> {
        let mut tree = Tree::new(0o755, 0, 0, 0);
        let mut paths: HashMap<Vec<Vec<u8>>, NodeId> = HashMap::new();
        paths.insert(Vec::new(), ROOT);

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return Err(SquashfsError::corrupt(format!(
                    "listing line {}: expected at least 5 fields",
                    lineno + 1
                )));
            }
            let path = fields[0];
            let kind_tag = fields[1];
            let mode = u16::from_str_radix(fields[2], 8)
                .map_err(|_| SquashfsError::corrupt(format!("listing line {}: bad mode", lineno + 1)))?;
            let uid: u32 = fields[3]
                .parse()
                .map_err(|_| SquashfsError::corrupt(format!("listing line {}: bad uid", lineno + 1)))?;
            let gid: u32 = fields[4]
                .parse()
                .map_err(|_| SquashfsError::corrupt(format!("listing line {}: bad gid", lineno + 1)))?;

            let kind = match kind_tag {
                "d" => NodeKind::Directory,
                "f" => NodeKind::Regular {
                    source: None,
                    data: None,
                    size: 0,
                },
                "s" => {
                    let target = fields.get(5).ok_or_else(|| {
                        SquashfsError::corrupt(format!("listing line {}: symlink needs a target", lineno + 1))
                    })?;
                    NodeKind::Symlink {
                        target: target.as_bytes().to_vec(),
                    }
                }
                "b" | "c" => {
                    let major: u32 = fields
                        .get(5)
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| SquashfsError::corrupt(format!("listing line {}: bad major", lineno + 1)))?;
                    let minor: u32 = fields
                        .get(6)
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| SquashfsError::corrupt(format!("listing line {}: bad minor", lineno + 1)))?;
                    if kind_tag == "b" {
                        NodeKind::BlockDevice { major, minor }
                    } else {
                        NodeKind::CharDevice { major, minor }
                    }
                }
                "p" => NodeKind::Fifo,
                "o" => NodeKind::Socket,
                other => {
                    return Err(SquashfsError::corrupt(format!(
                        "listing line {}: unknown type tag '{other}'",
                        lineno + 1
                    )))
                }
            };

            let components: Vec<Vec<u8>> = Path::new(path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned().into_bytes())
                .collect();
            if components.is_empty() {
                continue;
            }
            let (name, parent_components) = components.split_last().unwrap();
            let parent_id = *paths.get(parent_components).ok_or_else(|| {
                SquashfsError::corrupt(format!(
                    "listing line {}: parent directory of {path} not yet defined",
                    lineno + 1
                ))
            })?;

            let node = Node {
                name: name.clone(),
                kind,
                mode,
                uid,
                gid,
                mtime: 0,
                xattrs: HashMap::new(),
                parent: None,
                first_child: None,
                next_sibling: None,
            };
            let id = tree.insert_child(parent_id, node);
            paths.insert(components, id);
        }

        Ok(tree)
    }
}
