//! L6: a tar front-end that turns a POSIX/GNU/PAX archive stream into a
//! sequence of entries a tree builder can insert directly, without staging
//! the archive to disk first.

use crate::error::{Result, SquashfsError};
use crate::tree::{Node, NodeKind, Tree, ROOT};
use std::collections::HashMap;
use std::io::Read;

const BLOCK_SIZE: usize = 512;
const MAGIC_USTAR: &[u8; 6] = b"ustar\0";
const MAGIC_GNU: &[u8; 6] = b"ustar ";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    HardLink,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
}

#[derive(Clone, Debug)]
pub struct TarEntry {
    pub path: Vec<u8>,
    pub link_target: Vec<u8>,
    pub entry_type: EntryType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub devmajor: u32,
    pub devminor: u32,
    pub xattrs: HashMap<Vec<u8>, Vec<u8>>,
    pub sparse: bool,
}

fn is_zero_block(block: &[u8; BLOCK_SIZE]) -> bool {
    block.iter().all(|&b| b == 0)
}

fn parse_numeric(field: &[u8]) -> Result<u64> {
    if field.is_empty() {
        return Ok(0);
    }
    if field[0] & 0x80 != 0 {
        // GNU base-256 extension: top bit of the first byte flags binary
        // encoding, sign carried in the remaining bit of that same byte.
        let mut value: u64 = (field[0] & 0x7f) as u64;
        for &b in &field[1..] {
            value = (value << 8) | b as u64;
        }
        return Ok(value);
    }
    let s = std::str::from_utf8(field)
        .map_err(|_| SquashfsError::corrupt("tar numeric field is not valid utf-8"))?;
    let s = s.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 8).map_err(|_| SquashfsError::corrupt(format!("bad octal field {s:?}")))
}

fn parse_string(field: &[u8]) -> Vec<u8> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    field[..end].to_vec()
}

fn checksum_ok(block: &[u8; BLOCK_SIZE]) -> bool {
    let stored = &block[148..156];
    let Ok(stored) = parse_numeric(stored) else {
        return false;
    };
    let mut sum: u64 = 0;
    for (i, &b) in block.iter().enumerate() {
        sum += if (148..156).contains(&i) { b' ' as u64 } else { b as u64 };
    }
    sum == stored
}

fn typeflag_to_entry_type(flag: u8) -> EntryType {
    match flag {
        b'1' => EntryType::HardLink,
        b'2' => EntryType::Symlink,
        b'3' => EntryType::CharDevice,
        b'4' => EntryType::BlockDevice,
        b'5' => EntryType::Directory,
        b'6' => EntryType::Fifo,
        _ => EntryType::Regular,
    }
}

fn round_up_blocks(size: u64) -> u64 {
    (size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}

/// Streams entries out of a tar archive. Body bytes for the current entry
/// must be fully consumed (via [`TarReader::read_body`]) before
/// [`TarReader::next_entry`] is called again.
pub struct TarReader<R: Read> {
    reader: R,
    pending_body: u64,
    pending_padding: u64,
}

impl<R: Read> TarReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending_body: 0,
            pending_padding: 0,
        }
    }

    fn read_block(&mut self) -> Result<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];
        self.reader.read_exact(&mut block)?;
        Ok(block)
    }

    fn skip_previous_body(&mut self) -> Result<()> {
        let mut skip = self.pending_body + self.pending_padding;
        let mut buf = [0u8; BLOCK_SIZE];
        while skip > 0 {
            let take = skip.min(BLOCK_SIZE as u64) as usize;
            self.reader.read_exact(&mut buf[..take])?;
            skip -= take as u64;
        }
        self.pending_body = 0;
        self.pending_padding = 0;
        Ok(())
    }

    /// Reads the next entry's header, or `None` at the archive's two
    /// trailing zero blocks (or a clean EOF).
    pub fn next_entry(&mut self) -> Result<Option<TarEntry>> {
        self.skip_previous_body()?;

        let mut long_name: Option<Vec<u8>> = None;
        let mut long_link: Option<Vec<u8>> = None;
        let mut pax_overrides: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

        loop {
            let block = match self.read_block() {
                Ok(b) => b,
                Err(SquashfsError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            };
            if is_zero_block(&block) {
                return Ok(None);
            }
            if !checksum_ok(&block) {
                return Err(SquashfsError::corrupt("tar header checksum mismatch"));
            }

            let magic = &block[257..263];
            let is_posix = magic == MAGIC_USTAR || magic == MAGIC_GNU;
            let typeflag = block[156];
            let size = parse_numeric(&block[124..136])?;

            match typeflag {
                b'L' => {
                    long_name = Some(self.read_gnu_long(size)?);
                    continue;
                }
                b'K' => {
                    long_link = Some(self.read_gnu_long(size)?);
                    continue;
                }
                b'x' | b'g' => {
                    let data = self.read_exact_body(size)?;
                    parse_pax(&data, &mut pax_overrides)?;
                    continue;
                }
                _ => {}
            }

            let mut name = parse_string(&block[0..100]);
            if is_posix {
                let prefix = parse_string(&block[345..500]);
                if !prefix.is_empty() {
                    let mut full = prefix;
                    full.push(b'/');
                    full.extend_from_slice(&name);
                    name = full;
                }
            }
            if let Some(n) = long_name.take() {
                name = n;
            }
            if let Some(p) = pax_overrides.get(&b"path"[..]) {
                name = p.clone();
            }

            let mut link_target = parse_string(&block[157..257]);
            if let Some(l) = long_link.take() {
                link_target = l;
            }
            if let Some(p) = pax_overrides.get(&b"linkpath"[..]) {
                link_target = p.clone();
            }

            let mut mode = parse_numeric(&block[100..108])? as u32;
            let mut uid = parse_numeric(&block[108..116])? as u32;
            let mut gid = parse_numeric(&block[116..124])? as u32;
            let mut mtime = parse_numeric(&block[136..148])? as i64;
            let mut entry_size = size;

            let mut xattrs = HashMap::new();
            let mut sparse = false;
            for (key, value) in &pax_overrides {
                if let Some(rest) = strip_prefix(key, b"SCHILY.xattr.") {
                    xattrs.insert(rest.to_vec(), value.clone());
                } else if let Some(rest) = strip_prefix(key, b"LIBARCHIVE.xattr.") {
                    xattrs.insert(rest.to_vec(), value.clone());
                } else if key.starts_with(b"GNU.sparse.") {
                    sparse = true;
                }
            }
            if let Some(v) = pax_overrides.get(&b"size"[..]) {
                entry_size = parse_decimal(v)?;
            }
            if let Some(v) = pax_overrides.get(&b"uid"[..]) {
                uid = parse_decimal(v)? as u32;
            }
            if let Some(v) = pax_overrides.get(&b"gid"[..]) {
                gid = parse_decimal(v)? as u32;
            }
            if let Some(v) = pax_overrides.get(&b"mtime"[..]) {
                mtime = parse_decimal_f64_floor(v)?;
            }
            let _ = &mut mode;

            let devmajor = parse_numeric(&block[329..337]).unwrap_or(0) as u32;
            let devminor = parse_numeric(&block[337..345]).unwrap_or(0) as u32;

            let entry_type = typeflag_to_entry_type(typeflag);
            if matches!(entry_type, EntryType::Directory) {
                entry_size = 0;
            }

            self.pending_body = entry_size;
            self.pending_padding = round_up_blocks(entry_size) * BLOCK_SIZE as u64 - entry_size;

            return Ok(Some(TarEntry {
                path: name,
                link_target,
                entry_type,
                mode,
                uid,
                gid,
                size: entry_size,
                mtime,
                devmajor,
                devminor,
                xattrs,
                sparse,
            }));
        }
    }

    fn read_gnu_long(&mut self, size: u64) -> Result<Vec<u8>> {
        let mut data = self.read_exact_body(size)?;
        while data.last() == Some(&0) {
            data.pop();
        }
        Ok(data)
    }

    fn read_exact_body(&mut self, size: u64) -> Result<Vec<u8>> {
        let mut data = vec![0u8; size as usize];
        self.reader.read_exact(&mut data)?;
        let padding = round_up_blocks(size) * BLOCK_SIZE as u64 - size;
        let mut pad = vec![0u8; padding as usize];
        self.reader.read_exact(&mut pad)?;
        Ok(data)
    }

    /// Reads up to `buf.len()` bytes of the current entry's body.
    pub fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        let take = buf.len().min(self.pending_body as usize);
        if take == 0 {
            return Ok(0);
        }
        self.reader.read_exact(&mut buf[..take])?;
        self.pending_body -= take as u64;
        Ok(take)
    }
}

fn strip_prefix<'a>(key: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if key.starts_with(prefix) {
        Some(&key[prefix.len()..])
    } else {
        None
    }
}

fn parse_decimal(bytes: &[u8]) -> Result<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SquashfsError::corrupt("bad pax decimal value"))
}

fn parse_decimal_f64_floor(bytes: &[u8]) -> Result<i64> {
    let s = std::str::from_utf8(bytes)
        .map_err(|_| SquashfsError::corrupt("bad pax mtime"))?;
    let f: f64 = s
        .parse()
        .map_err(|_| SquashfsError::corrupt("bad pax mtime"))?;
    Ok(f.floor() as i64)
}

/// Parses a PAX extended header block (`key=length value\n` records) into
/// `overrides`; PAX entries always win over any GNU long name/link already
/// queued for the same header.
fn parse_pax(data: &[u8], overrides: &mut HashMap<Vec<u8>, Vec<u8>>) -> Result<()> {
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| SquashfsError::corrupt("malformed pax record"))?;
        let len_str = std::str::from_utf8(&rest[..space])
            .map_err(|_| SquashfsError::corrupt("malformed pax record length"))?;
        let len: usize = len_str
            .parse()
            .map_err(|_| SquashfsError::corrupt("malformed pax record length"))?;
        if len == 0 || len > rest.len() {
            return Err(SquashfsError::corrupt("malformed pax record length"));
        }
        let record = &rest[..len];
        if record.last() != Some(&b'\n') {
            return Err(SquashfsError::corrupt(format!(
                "pax record declares length {len} but does not end at a newline"
            )));
        }
        let body = &record[space + 1..record.len() - 1]; // drop trailing '\n'
        let eq = body
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| SquashfsError::corrupt("malformed pax record, no '='"))?;
        overrides.insert(body[..eq].to_vec(), body[eq + 1..].to_vec());
        rest = &rest[len..];
    }
    Ok(())
}

/// Splits a tar path into components, dropping a leading `./` and any
/// trailing slash a directory entry's name carries.
fn split_path(path: &[u8]) -> Vec<Vec<u8>> {
    let mut p = path;
    if p.starts_with(b"./") {
        p = &p[2..];
    }
    while p.last() == Some(&b'/') {
        p = &p[..p.len() - 1];
    }
    p.split(|&b| b == b'/')
        .filter(|c| !c.is_empty())
        .map(|c| c.to_vec())
        .collect()
}

/// Drains the rest of an entry's body into a single buffer.
fn read_full_body<R: Read>(reader: &mut TarReader<R>, size: u64) -> Result<Vec<u8>> {
    let mut data = vec![0u8; size as usize];
    let mut got = 0usize;
    while got < data.len() {
        let n = reader.read_body(&mut data[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    data.truncate(got);
    Ok(data)
}

/// Consumes an entire tar stream into a [`Tree`], creating parent
/// directories implicitly when the archive omits them. A `1` (hard link)
/// entry is demoted to an independent regular-file inode: it reuses the
/// body already captured for its target path. A hard link to a path not
/// yet seen is rejected with [`SquashfsError::NotFound`] rather than
/// guessed at, since tar gives no guarantee link targets precede their
/// links.
pub fn into_tree<R: Read>(reader: &mut TarReader<R>) -> Result<Tree> {
    let mut tree = Tree::new(0o755, 0, 0, 0);
    let mut paths: HashMap<Vec<Vec<u8>>, crate::tree::NodeId> = HashMap::new();
    paths.insert(Vec::new(), ROOT);
    let mut bodies: HashMap<Vec<Vec<u8>>, (Option<PathKind>, u64)> = HashMap::new();

    #[derive(Clone)]
    enum PathKind {
        Data(std::rc::Rc<Vec<u8>>),
    }

    while let Some(entry) = reader.next_entry()? {
        let components = split_path(&entry.path);
        if components.is_empty() {
            continue;
        }
        let (name, parent_components) = components.split_last().unwrap();

        let parent_id = ensure_parent_dirs(&mut tree, &mut paths, parent_components, &entry);

        if entry.entry_type == EntryType::Directory {
            if paths.contains_key(&components) {
                continue;
            }
            let node = make_node(name.clone(), NodeKind::Directory, &entry);
            let id = tree.insert_child(parent_id, node);
            paths.insert(components, id);
            continue;
        }

        let kind = match entry.entry_type {
            EntryType::Regular => {
                let data = read_full_body(reader, entry.size)?;
                bodies.insert(
                    components.clone(),
                    (Some(PathKind::Data(std::rc::Rc::new(data.clone()))), entry.size),
                );
                NodeKind::Regular {
                    source: None,
                    data: Some(data),
                    size: entry.size,
                }
            }
            EntryType::HardLink => {
                let target = split_path(&entry.link_target);
                let Some((Some(PathKind::Data(data)), size)) = bodies.get(&target) else {
                    tracing::warn!(
                        path = %String::from_utf8_lossy(&entry.path),
                        target = %String::from_utf8_lossy(&entry.link_target),
                        "hard link target not seen yet, dropping entry",
                    );
                    return Err(SquashfsError::NotFound(format!(
                        "hard link {:?} -> {:?} has no earlier target",
                        String::from_utf8_lossy(&entry.path),
                        String::from_utf8_lossy(&entry.link_target),
                    )));
                };
                tracing::warn!(
                    path = %String::from_utf8_lossy(&entry.path),
                    target = %String::from_utf8_lossy(&entry.link_target),
                    "demoting hard link to an independent regular-file inode",
                );
                NodeKind::Regular {
                    source: None,
                    data: Some((**data).clone()),
                    size: *size,
                }
            }
            EntryType::Symlink => NodeKind::Symlink {
                target: entry.link_target.clone(),
            },
            EntryType::CharDevice => NodeKind::CharDevice {
                major: entry.devmajor,
                minor: entry.devminor,
            },
            EntryType::BlockDevice => NodeKind::BlockDevice {
                major: entry.devmajor,
                minor: entry.devminor,
            },
            EntryType::Fifo => NodeKind::Fifo,
            EntryType::Directory => unreachable!(),
        };

        let node = make_node(name.clone(), kind, &entry);
        let id = tree.insert_child(parent_id, node);
        paths.insert(components, id);
    }

    Ok(tree)
}

fn make_node(name: Vec<u8>, kind: NodeKind, entry: &TarEntry) -> Node {
    Node {
        name,
        kind,
        mode: (entry.mode & 0xffff) as u16,
        uid: entry.uid,
        gid: entry.gid,
        mtime: entry.mtime as u32,
        xattrs: entry.xattrs.clone(),
        parent: None,
        first_child: None,
        next_sibling: None,
    }
}

fn ensure_parent_dirs(
    tree: &mut Tree,
    paths: &mut HashMap<Vec<Vec<u8>>, crate::tree::NodeId>,
    parent_components: &[Vec<u8>],
    entry: &TarEntry,
) -> crate::tree::NodeId {
    let mut built = Vec::new();
    let mut cursor = ROOT;
    for (i, comp) in parent_components.iter().enumerate() {
        built.push(comp.clone());
        if let Some(&id) = paths.get(&built) {
            cursor = id;
            continue;
        }
        let node = Node {
            name: comp.clone(),
            kind: NodeKind::Directory,
            mode: 0o755,
            uid: if i == parent_components.len() - 1 { entry.uid } else { 0 },
            gid: if i == parent_components.len() - 1 { entry.gid } else { 0 },
            mtime: 0,
            xattrs: HashMap::new(),
            parent: None,
            first_child: None,
            next_sibling: None,
        };
        let id = tree.insert_child(cursor, node);
        paths.insert(built.clone(), id);
        cursor = id;
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ustar_block(name: &str, typeflag: u8, size: u64) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..name.len()].copy_from_slice(name.as_bytes());
        write_octal(&mut block[100..108], 0o644, 7);
        write_octal(&mut block[108..116], 0, 7);
        write_octal(&mut block[116..124], 0, 7);
        write_octal(&mut block[124..136], size, 11);
        write_octal(&mut block[136..148], 0, 11);
        block[156] = typeflag;
        block[257..263].copy_from_slice(MAGIC_USTAR);
        block[263..265].copy_from_slice(b"00");
        for b in block[148..156].iter_mut() {
            *b = b' ';
        }
        let mut sum: u64 = 0;
        for &b in block.iter() {
            sum += b as u64;
        }
        write_octal(&mut block[148..154], sum, 6);
        block[154] = 0;
        block[155] = b' ';
        block
    }

    fn write_octal(field: &mut [u8], value: u64, digits: usize) {
        let s = format!("{:0width$o}", value, width = digits);
        field[..digits].copy_from_slice(s.as_bytes());
    }

    #[test]
    fn reads_a_single_regular_entry() {
        let mut archive = Vec::new();
        archive.extend_from_slice(&ustar_block("hello.txt", b'0', 5));
        archive.extend_from_slice(b"world");
        archive.extend_from_slice(&[0u8; BLOCK_SIZE - 5]);
        archive.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);

        let mut reader = TarReader::new(Cursor::new(archive));
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.path, b"hello.txt");
        assert_eq!(entry.size, 5);

        let mut body = vec![0u8; 5];
        reader.read_body(&mut body).unwrap();
        assert_eq!(&body, b"world");

        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn gnu_long_name_is_applied() {
        let long_name = "a/very/long/path/that/exceeds/the/classic/100/byte/ustar/name/field/for/sure.txt";
        let mut archive = Vec::new();
        let mut long_block = ustar_block("", b'L', long_name.len() as u64 + 1);
        long_block[0..1].copy_from_slice(b"\0");
        archive.extend_from_slice(&long_block);
        let mut name_bytes = long_name.as_bytes().to_vec();
        name_bytes.push(0);
        let padded = round_up_blocks(name_bytes.len() as u64) as usize * BLOCK_SIZE;
        name_bytes.resize(padded, 0);
        archive.extend_from_slice(&name_bytes);
        archive.extend_from_slice(&ustar_block("placeholder", b'0', 0));
        archive.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);

        let mut reader = TarReader::new(Cursor::new(archive));
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.path, long_name.as_bytes());
    }

    #[test]
    fn hard_link_is_demoted_to_its_own_inode() {
        let mut archive = Vec::new();
        archive.extend_from_slice(&ustar_block("real.txt", b'0', 5));
        archive.extend_from_slice(b"world");
        archive.extend_from_slice(&[0u8; BLOCK_SIZE - 5]);
        let mut link_block = ustar_block("link.txt", b'1', 0);
        link_block[157..165].copy_from_slice(b"real.txt");
        archive.extend_from_slice(&link_block);
        archive.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);

        let mut reader = TarReader::new(Cursor::new(archive));
        let tree = into_tree(&mut reader).unwrap();

        let real_id = tree.find_child(ROOT, b"real.txt").unwrap();
        let link_id = tree.find_child(ROOT, b"link.txt").unwrap();
        assert_ne!(real_id, link_id);
        let NodeKind::Regular { data, size, .. } = &tree.node(link_id).kind else {
            panic!("expected a regular file");
        };
        assert_eq!(size, &5);
        assert_eq!(data.as_deref(), Some(&b"world"[..]));
    }

    #[test]
    fn pax_record_with_wrong_length_is_rejected() {
        // Declares length 9, but the 9th byte isn't the record's newline —
        // the true record is one byte longer than claimed.
        let mut overrides = HashMap::new();
        let data = b"9 a=1\nxxxx".to_vec();
        assert!(parse_pax(&data, &mut overrides).is_err());
    }

    #[test]
    fn hard_link_to_unseen_target_is_rejected() {
        let mut archive = Vec::new();
        let mut link_block = ustar_block("link.txt", b'1', 0);
        link_block[157..165].copy_from_slice(b"real.txt");
        archive.extend_from_slice(&link_block);
        archive.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);

        let mut reader = TarReader::new(Cursor::new(archive));
        assert!(into_tree(&mut reader).is_err());
    }
}
