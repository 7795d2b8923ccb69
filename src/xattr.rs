//! Extended attribute store: a key/value metadata stream plus a
//! deduplicated id table that inodes reference by index.
//!
//! Layout is a simplified version of the on-disk xattr format: identical
//! attribute lists are written once and shared by every inode's xattr
//! index, but (unlike the on-disk format this crate reads images back with
//! its own reader only) the id array is addressed directly through the
//! metadata layer's cache rather than through a second raw pointer index.

use crate::compressors::Compressor;
use crate::error::Result;
use crate::io_file::BlockFile;
use crate::metadata::{MetaCursor, MetadataReader, MetadataWriter};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XattrPrefix {
    User,
    Trusted,
    Security,
}

impl XattrPrefix {
    pub fn to_u16(self) -> u16 {
        match self {
            Self::User => 0,
            Self::Trusted => 1,
            Self::Security => 2,
        }
    }

    pub fn from_u16(v: u16) -> Self {
        match v & 0x00ff {
            1 => Self::Trusted,
            2 => Self::Security,
            _ => Self::User,
        }
    }

    pub fn full_name(self, name: &[u8]) -> Vec<u8> {
        let prefix: &[u8] = match self {
            Self::User => b"user.",
            Self::Trusted => b"trusted.",
            Self::Security => b"security.",
        };
        let mut out = Vec::with_capacity(prefix.len() + name.len());
        out.extend_from_slice(prefix);
        out.extend_from_slice(name);
        out
    }
}

/// Splits a full attribute name (`"user.comment"`) into its namespace
/// prefix and short name. Namespaces this crate doesn't model (e.g.
/// `system.*`) fall back to `User` rather than being rejected.
pub fn split_name(full: &[u8]) -> (XattrPrefix, Vec<u8>) {
    for (prefix, tag) in [
        (XattrPrefix::Trusted, &b"trusted."[..]),
        (XattrPrefix::Security, &b"security."[..]),
        (XattrPrefix::User, &b"user."[..]),
    ] {
        if let Some(rest) = full.strip_prefix(tag) {
            return (prefix, rest.to_vec());
        }
    }
    (XattrPrefix::User, full.to_vec())
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct XattrEntry {
    pub prefix: u16,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// Accumulates deduplicated xattr lists. `add_list` returns the id to store
/// in an extended inode's `xattr` field.
pub struct XattrWriter {
    kv: MetadataWriter,
    ids: MetadataWriter,
    dedupe: HashMap<Vec<XattrEntry>, u32>,
    count: u32,
}

impl XattrWriter {
    pub fn new() -> Self {
        Self {
            kv: MetadataWriter::new(),
            ids: MetadataWriter::new(),
            dedupe: HashMap::new(),
            count: 0,
        }
    }

    pub fn add_list(&mut self, compressor: &dyn Compressor, mut entries: Vec<XattrEntry>) -> Result<u32> {
        entries.sort_by(|a, b| (a.prefix, &a.name).cmp(&(b.prefix, &b.name)));
        if let Some(&id) = self.dedupe.get(&entries) {
            return Ok(id);
        }

        let xattr_ref = self.kv.current_ref();
        let mut size = 0u32;
        for entry in &entries {
            self.kv.append(compressor, &entry.prefix.to_le_bytes())?;
            let name_len = entry.name.len() as u16;
            self.kv.append(compressor, &name_len.to_le_bytes())?;
            self.kv.append(compressor, &entry.name)?;
            let value_len = entry.value.len() as u32;
            self.kv.append(compressor, &value_len.to_le_bytes())?;
            self.kv.append(compressor, &entry.value)?;
            size += 2 + 2 + entry.name.len() as u32 + 4 + entry.value.len() as u32;
        }

        let id = self.count;
        self.ids.append(compressor, &xattr_ref.to_le_bytes())?;
        self.ids.append(compressor, &(entries.len() as u32).to_le_bytes())?;
        self.ids.append(compressor, &size.to_le_bytes())?;
        self.count += 1;
        self.dedupe.insert(entries, id);
        Ok(id)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn finish(self, compressor: &dyn Compressor) -> Result<(Vec<u8>, Vec<u8>)> {
        let kv = self.kv.finish(compressor)?;
        let ids = self.ids.finish(compressor)?;
        Ok((kv, ids))
    }
}

impl Default for XattrWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads xattr lists back out given the kv stream and the id array, both
/// addressed as independent metadata tables.
pub struct XattrReader<'a, F: BlockFile> {
    kv: MetadataReader<'a, F>,
    ids: MetadataReader<'a, F>,
}

const ID_ENTRY_SIZE: usize = 16;

impl<'a, F: BlockFile> XattrReader<'a, F> {
    pub fn new(kv: MetadataReader<'a, F>, ids: MetadataReader<'a, F>) -> Self {
        Self { kv, ids }
    }

    pub fn read_list(&self, xattr_id: u32) -> Result<Vec<XattrEntry>> {
        let mut cursor = MetaCursor {
            block_rel_offset: 0,
            intra: 0,
        };
        self.skip_to_id(&mut cursor, xattr_id)?;

        let xattr_ref = self.ids.read_u64(&mut cursor)?;
        let count = self.ids.read_u32(&mut cursor)?;
        let _size = self.ids.read_u32(&mut cursor)?;

        let mut kv_cursor = self.kv.cursor_at(xattr_ref);
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let prefix = self.kv.read_u16(&mut kv_cursor)?;
            let name_len = self.kv.read_u16(&mut kv_cursor)?;
            let name = self.kv.read_vec(&mut kv_cursor, name_len as usize)?;
            let value_len = self.kv.read_u32(&mut kv_cursor)?;
            let value = self.kv.read_vec(&mut kv_cursor, value_len as usize)?;
            out.push(XattrEntry { prefix, name, value });
        }
        Ok(out)
    }

    fn skip_to_id(&self, cursor: &mut MetaCursor, xattr_id: u32) -> Result<()> {
        *cursor = self.ids.cursor_at(0);
        for _ in 0..xattr_id {
            let mut buf = [0u8; ID_ENTRY_SIZE];
            self.ids.read(cursor, &mut buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressors::{CompressorConfig, CompressorId};
    use crate::io_file::MemFile;

    #[test]
    fn split_name_recognizes_known_namespaces() {
        assert_eq!(split_name(b"user.comment"), (XattrPrefix::User, b"comment".to_vec()));
        assert_eq!(split_name(b"trusted.overlay.opaque"), (XattrPrefix::Trusted, b"overlay.opaque".to_vec()));
        assert_eq!(split_name(b"security.selinux"), (XattrPrefix::Security, b"selinux".to_vec()));
        assert_eq!(split_name(b"system.posix_acl_access"), (XattrPrefix::User, b"system.posix_acl_access".to_vec()));
    }

    #[test]
    fn identical_lists_dedupe_to_one_id() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let compressor = cfg.build();
        let mut writer = XattrWriter::new();

        let list = vec![XattrEntry {
            prefix: XattrPrefix::User.to_u16(),
            name: b"comment".to_vec(),
            value: b"hello".to_vec(),
        }];

        let id1 = writer.add_list(compressor.as_ref(), list.clone()).unwrap();
        let id2 = writer.add_list(compressor.as_ref(), list).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(writer.count(), 1);
    }

    #[test]
    fn roundtrips_through_reader() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 131072);
        let compressor = cfg.build();
        let mut writer = XattrWriter::new();

        let list_a = vec![XattrEntry {
            prefix: XattrPrefix::User.to_u16(),
            name: b"a".to_vec(),
            value: b"1".to_vec(),
        }];
        let list_b = vec![
            XattrEntry {
                prefix: XattrPrefix::User.to_u16(),
                name: b"b".to_vec(),
                value: b"22".to_vec(),
            },
            XattrEntry {
                prefix: XattrPrefix::Trusted.to_u16(),
                name: b"c".to_vec(),
                value: b"333".to_vec(),
            },
        ];

        let id_a = writer.add_list(compressor.as_ref(), list_a.clone()).unwrap();
        let id_b = writer.add_list(compressor.as_ref(), list_b.clone()).unwrap();
        let (kv, ids) = writer.finish(compressor.as_ref()).unwrap();

        let mut kv_file = MemFile::new();
        kv_file.write_at(0, &kv).unwrap();
        let mut id_file = MemFile::new();
        id_file.write_at(0, &ids).unwrap();

        let kv_reader = MetadataReader::new(&kv_file, cfg.build(), 0, kv.len() as u64);
        let id_reader = MetadataReader::new(&id_file, cfg.build(), 0, ids.len() as u64);
        let reader = XattrReader::new(kv_reader, id_reader);

        let back_a = reader.read_list(id_a).unwrap();
        assert_eq!(back_a, list_a);
        let back_b = reader.read_list(id_b).unwrap();
        assert_eq!(back_b, list_b);
    }
}
