//! L1: positioned read/write/truncate over an abstract file.
//!
//! The core never opens a path itself; it is handed something implementing
//! [`BlockFile`]. `StdFile` backs the CLI tools, `MemFile` backs the tests.

use crate::error::Result;
use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Abstract file: positioned reads/writes, truncate, size.
///
/// Partial reads/writes are retried by implementations until the buffer is
/// exhausted or the underlying source hits EOF; callers never see a short
/// read/write.
pub trait BlockFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn truncate(&mut self, len: u64) -> Result<()>;
    fn size(&self) -> Result<u64>;
}

impl<T: BlockFile + ?Sized> BlockFile for &mut T {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        (**self).truncate(len)
    }

    fn size(&self) -> Result<u64> {
        (**self).size()
    }
}

/// `std::fs::File`-backed implementation used by `mksquashfs`/`unsquashfs`.
pub struct StdFile {
    file: File,
}

impl StdFile {
    pub fn open_read(path: &std::path::Path) -> Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }

    pub fn create(path: &std::path::Path) -> Result<Self> {
        Ok(Self {
            file: File::create(path)?,
        })
    }
}

#[cfg(unix)]
impl BlockFile for StdFile {
    fn read_at(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.file.read_at(buf, offset) {
                Ok(0) => {
                    return Err(crate::error::SquashfsError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "short read past end of file",
                    )))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_at(&mut self, mut offset: u64, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.file.write_at(buf, offset) {
                Ok(0) => {
                    return Err(crate::error::SquashfsError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write truncated",
                    )))
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// In-memory implementation used by unit and integration tests.
#[derive(Default, Clone)]
pub struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl BlockFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(crate::error::SquashfsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of in-memory file",
            )));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.data.resize(len as usize, 0);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}
