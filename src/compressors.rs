//! L2: a uniform compress/decompress contract over a chosen codec.
//!
//! The core never branches on codec identity outside [`CompressorConfig::build`];
//! everywhere else it holds a `Box<dyn Compressor>` and calls the trait.

use crate::error::{Result, SquashfsError};
use bitflags::bitflags;
use std::fmt::Debug;
use std::io::{Read, Write};

/// Super-block compressor ids, per the SquashFS 4.0 format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressorId {
    Gzip = 1,
    Lzo = 2,
    Lzma = 3,
    Xz = 4,
    Lz4 = 5,
    Zstd = 6,
}

impl CompressorId {
    pub fn from_u16(v: u16) -> Result<Self> {
        Ok(match v {
            1 => Self::Gzip,
            2 => Self::Lzo,
            3 => Self::Lzma,
            4 => Self::Xz,
            5 => Self::Lz4,
            6 => Self::Zstd,
            _ => return Err(SquashfsError::unsupported(format!("unknown compressor id {v}"))),
        })
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

impl std::str::FromStr for CompressorId {
    type Err = SquashfsError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "gzip" => Self::Gzip,
            "lzo" => Self::Lzo,
            "lzma" => Self::Lzma,
            "xz" => Self::Xz,
            "lz4" | "lz4hc" => Self::Lz4,
            "zstd" => Self::Zstd,
            _ => return Err(SquashfsError::unsupported(format!("unknown compressor '{s}'"))),
        })
    }
}

/// The sentinel returned by `compress` when the result did not shrink the
/// input (or would not fit the caller's buffer): store the block raw and
/// flag it uncompressed instead.
pub const DO_NOT_COMPRESS: Option<usize> = None;

/// Per-codec contract: configure once (via [`CompressorConfig`]), then
/// compress/decompress many times. Implementations hold no shared mutable
/// state so one instance can be built per worker thread.
pub trait Compressor: Debug + Send {
    fn id(&self) -> CompressorId;

    /// Emit the codec-specific options blob that follows the super block.
    fn write_options(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Compress `src` into `dst`. Returns `Some(len)` if compression shrank
    /// the input, `None` (the `DO_NOT_COMPRESS` sentinel) otherwise.
    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<Option<usize>>;

    /// Decompress `src` into `dst`, returning the decoded length.
    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize>;
}

/// Immutable description of the chosen codec, built once from the super
/// block (or CLI flags) and cloned to build one [`Compressor`] per worker.
#[derive(Clone, Debug)]
pub struct CompressorConfig {
    pub id: CompressorId,
    pub block_size: u32,
    pub gzip: GzipOptions,
    pub xz: XzOptions,
}

impl CompressorConfig {
    pub fn new(id: CompressorId, block_size: u32) -> Self {
        Self {
            id,
            block_size,
            gzip: GzipOptions::default(),
            xz: XzOptions::default(),
        }
    }

    /// Parse a previously-written options blob (see `write_options`),
    /// or leave defaults if the super block carried no options blob.
    pub fn read_options(id: CompressorId, block_size: u32, blob: Option<&[u8]>) -> Result<Self> {
        let mut cfg = Self::new(id, block_size);
        if let Some(blob) = blob {
            match id {
                CompressorId::Gzip => cfg.gzip = GzipOptions::from_bytes(blob)?,
                CompressorId::Xz => cfg.xz = XzOptions::from_bytes(blob)?,
                _ => {}
            }
        }
        Ok(cfg)
    }

    pub fn build(&self) -> Box<dyn Compressor> {
        match self.id {
            CompressorId::Gzip => Box::new(GzipCompressor(self.gzip.clone())),
            CompressorId::Xz => Box::new(XzCompressor(self.xz.clone())),
            CompressorId::Lz4 => Box::new(Lz4Compressor),
            CompressorId::Zstd => Box::new(ZstdCompressor),
            CompressorId::Lzo => Box::new(LzoCompressor),
            CompressorId::Lzma => Box::new(XzCompressor(self.xz.clone())),
        }
    }
}

// --- gzip -------------------------------------------------------------

bitflags! {
    #[derive(Default)]
    pub struct GzipStrategies: u16 {
        const DEFAULT = 0x0001;
        const FILTERED = 0x0002;
        const HUFFMAN_ONLY = 0x0004;
        const RUN_LENGTH_ENCODED = 0x0008;
        const FIXED = 0x0010;
    }
}

#[derive(Clone, Debug)]
pub struct GzipOptions {
    pub compression_level: u32,
    pub window_size: u32,
    pub strategies: GzipStrategies,
}

impl Default for GzipOptions {
    fn default() -> Self {
        Self {
            compression_level: 9,
            window_size: 15,
            strategies: GzipStrategies::DEFAULT,
        }
    }
}

impl GzipOptions {
    const SIZE: usize = 8;

    fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.compression_level.to_le_bytes());
        buf[4..6].copy_from_slice(&(self.window_size as u16).to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(SquashfsError::corrupt("gzip options blob too short"));
        }
        let compression_level = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let window_size = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as u32;
        Ok(Self {
            compression_level,
            window_size,
            strategies: GzipStrategies::DEFAULT,
        })
    }
}

#[derive(Debug)]
struct GzipCompressor(GzipOptions);

impl Compressor for GzipCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Gzip
    }

    fn write_options(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.0.to_bytes());
        Ok(())
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<Option<usize>> {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        let level = self.0.compression_level.clamp(0, 9);
        let mut enc = ZlibEncoder::new(Vec::with_capacity(src.len()), Compression::new(level));
        enc.write_all(src)?;
        let out = enc.finish()?;
        if out.len() < src.len() {
            dst.extend_from_slice(&out);
            Ok(Some(out.len()))
        } else {
            Ok(DO_NOT_COMPRESS)
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        use flate2::read::ZlibDecoder;
        let mut dec = ZlibDecoder::new(src);
        let start = dst.len();
        dec.read_to_end(dst)
            .map_err(|e| SquashfsError::corrupt(format!("zlib decompress failed: {e}")))?;
        Ok(dst.len() - start)
    }
}

// --- xz ---------------------------------------------------------------

bitflags! {
    pub struct XzFilters: u32 {
        const X86 = 0x0004;
        const POWER_PC = 0x0005;
        const IA64 = 0x0006;
        const ARM = 0x0007;
        const ARM_THUMB = 0x0008;
        const SPARC = 0x0009;
    }
}

#[derive(Clone, Debug)]
pub struct XzOptions {
    pub dictionary_size: u32,
    pub filters: u32,
}

impl Default for XzOptions {
    fn default() -> Self {
        Self {
            dictionary_size: 1 << 20,
            filters: 0,
        }
    }
}

impl XzOptions {
    const SIZE: usize = 8;

    fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.dictionary_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.filters.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(SquashfsError::corrupt("xz options blob too short"));
        }
        Ok(Self {
            dictionary_size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            filters: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

#[derive(Debug)]
struct XzCompressor(XzOptions);

impl Compressor for XzCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Xz
    }

    fn write_options(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.0.to_bytes());
        Ok(())
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<Option<usize>> {
        use xz2::write::XzEncoder;
        let mut enc = XzEncoder::new(Vec::with_capacity(src.len()), 6);
        enc.write_all(src)?;
        let out = enc.finish()?;
        if out.len() < src.len() {
            dst.extend_from_slice(&out);
            Ok(Some(out.len()))
        } else {
            Ok(DO_NOT_COMPRESS)
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        use xz2::read::XzDecoder;
        let mut dec = XzDecoder::new(src);
        let start = dst.len();
        dec.read_to_end(dst)
            .map_err(|e| SquashfsError::corrupt(format!("xz decompress failed: {e}")))?;
        Ok(dst.len() - start)
    }
}

// --- lz4 ----------------------------------------------------------------

#[derive(Debug)]
struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn id(&self) -> CompressorId {
        CompressorId::Lz4
    }

    fn write_options(&self, out: &mut Vec<u8>) -> Result<()> {
        // version:u32, flags:u32 — lz4hc-vs-default is not distinguished by
        // the core, both compress through the same block API.
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        Ok(())
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<Option<usize>> {
        let out = lz4_flex::compress(src);
        if out.len() < src.len() {
            dst.extend_from_slice(&out);
            Ok(Some(out.len()))
        } else {
            Ok(DO_NOT_COMPRESS)
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        // The caller always knows the expected decompressed size (the
        // inode's stored block size is the uncompressed size for a
        // compressed block) and reserves it via `dst`'s capacity.
        let expected = dst.capacity().saturating_sub(dst.len()).max(src.len() * 4);
        let start = dst.len();
        dst.resize(start + expected, 0);
        let n = lz4_flex::decompress_into(src, &mut dst[start..])
            .map_err(|e| SquashfsError::corrupt(format!("lz4 decompress failed: {e}")))?;
        dst.truncate(start + n);
        Ok(n)
    }
}

// --- zstd -----------------------------------------------------------------

#[derive(Debug)]
struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Zstd
    }

    fn write_options(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&19i32.to_le_bytes()); // compression_level
        Ok(())
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<Option<usize>> {
        let out = zstd::bulk::compress(src, 19).map_err(SquashfsError::Io)?;
        if out.len() < src.len() {
            dst.extend_from_slice(&out);
            Ok(Some(out.len()))
        } else {
            Ok(DO_NOT_COMPRESS)
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        let start = dst.len();
        let mut decoder = zstd::stream::read::Decoder::new(src).map_err(SquashfsError::Io)?;
        decoder
            .read_to_end(dst)
            .map_err(|e| SquashfsError::corrupt(format!("zstd decompress failed: {e}")))?;
        Ok(dst.len() - start)
    }
}

// --- lzo ------------------------------------------------------------------

#[derive(Debug)]
struct LzoCompressor;

impl Compressor for LzoCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Lzo
    }

    fn write_options(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&0u32.to_le_bytes()); // algorithm
        out.extend_from_slice(&0u32.to_le_bytes()); // compression_level
        Ok(())
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<Option<usize>> {
        let out = minilzo_rs::LZO::init()
            .map_err(|e| SquashfsError::corrupt(format!("lzo init failed: {e:?}")))?
            .compress(src)
            .map_err(|e| SquashfsError::corrupt(format!("lzo compress failed: {e:?}")))?;
        if out.len() < src.len() {
            dst.extend_from_slice(&out);
            Ok(Some(out.len()))
        } else {
            Ok(DO_NOT_COMPRESS)
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        let lzo = minilzo_rs::LZO::init()
            .map_err(|e| SquashfsError::corrupt(format!("lzo init failed: {e:?}")))?;
        let expected = dst.capacity().saturating_sub(dst.len()).max(src.len() * 4);
        let out = lzo
            .decompress(src, expected)
            .map_err(|e| SquashfsError::corrupt(format!("lzo decompress failed: {e:?}")))?;
        dst.extend_from_slice(&out);
        Ok(out.len())
    }
}
