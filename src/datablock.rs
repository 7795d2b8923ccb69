//! L4: splits file contents into fixed-size blocks, compresses them across a
//! worker pool, deduplicates identical blocks, and packs small tails into
//! fragments.
//!
//! Compression is parallel; writing is not. Workers never touch the output
//! file — they only turn `(sequence, raw bytes)` into `(sequence, compressed
//! bytes, flags)`. A single collector thread reassembles results in
//! submission order (a `BTreeMap` reorder buffer keyed by sequence number)
//! before handing them to the block writer, so files land on disk exactly
//! as if compression were sequential.

use crate::compressors::CompressorConfig;
use crate::error::{Result, SquashfsError};
use crate::fragments::{FragmentEntry, FragmentTableWriter, BLOCK_UNCOMPRESSED_BIT};
use crate::io_file::BlockFile;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-block stored-size encoding shared between inode block lists and the
/// fragment table: high bit set means "stored uncompressed", zero means a
/// hole (sparse block, nothing written).
pub const SPARSE_BLOCK: u32 = 0;

fn fingerprint(data: &[u8]) -> u64 {
    // FNV-1a — fast, good enough to gate a byte-for-byte dedup comparison.
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn is_all_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

/// Tracks where the next data block lands in the image.
///
/// Only all-zero blocks are special-cased (as sparse holes, per
/// [`SPARSE_BLOCK`]); blocks with identical non-zero content are still
/// written at their own position. A regular-file inode's block list is read
/// back by walking forward from a single `start_block`, summing each
/// block's stored size as it goes — there is no per-block pointer, so a
/// block can only ever be deduplicated against another block physically
/// contiguous with the rest of the same file. Whole-file and tail-fragment
/// sharing (`FragmentPacker`) use an explicit index instead and dedupe
/// safely; an arbitrary interior block cannot.
pub struct DataAppender<F: BlockFile> {
    file: F,
    cursor: u64,
}

impl<F: BlockFile> DataAppender<F> {
    pub fn new(file: F, start_offset: u64) -> Self {
        Self {
            file,
            cursor: start_offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.cursor
    }

    pub fn into_file(self) -> F {
        self.file
    }

    pub fn file_mut(&mut self) -> &mut F {
        &mut self.file
    }

    /// Writes one already-compressed block (or raw, if `uncompressed`).
    /// `raw` is still needed to detect an all-zero block, which is recorded
    /// as a sparse hole rather than physically written.
    pub fn write_block(&mut self, raw: &[u8], compressed: Option<&[u8]>) -> Result<(u64, u32)> {
        if is_all_zero(raw) {
            return Ok((self.cursor, SPARSE_BLOCK));
        }
        let start = self.cursor;
        let (bytes, uncompressed) = match compressed {
            Some(c) if c.len() < raw.len() => (c, false),
            _ => (raw, true),
        };
        self.file.write_at(start, bytes)?;
        self.cursor += bytes.len() as u64;
        let stored_size = bytes.len() as u32 | if uncompressed { BLOCK_UNCOMPRESSED_BIT } else { 0 };
        Ok((start, stored_size))
    }
}

struct Job {
    seq: u64,
    raw: Vec<u8>,
}

struct JobResult {
    seq: u64,
    raw: Vec<u8>,
    compressed: Option<Vec<u8>>,
}

/// Fixed-size pool of compressor workers. One `Compressor` instance is built
/// per thread from `cfg`, so no codec state is shared across threads.
pub struct CompressionPool {
    job_tx: crossbeam_channel::Sender<Job>,
    result_rx: crossbeam_channel::Receiver<JobResult>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl CompressionPool {
    pub fn new(cfg: CompressorConfig, workers: usize) -> Self {
        let depth = (10 * workers).max(10);
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(depth);
        let (result_tx, result_rx) = crossbeam_channel::bounded::<JobResult>(depth);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let compressor = cfg.build();
            handles.push(std::thread::spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let mut out = Vec::with_capacity(job.raw.len());
                    let compressed = match compressor.compress(&job.raw, &mut out) {
                        Ok(Some(len)) => {
                            out.truncate(len);
                            Some(out)
                        }
                        Ok(None) => None,
                        Err(_) => None,
                    };
                    if result_tx
                        .send(JobResult {
                            seq: job.seq,
                            raw: job.raw,
                            compressed,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        Self {
            job_tx,
            result_rx,
            handles,
        }
    }

    pub fn submit(&self, seq: u64, raw: Vec<u8>) -> Result<()> {
        self.job_tx
            .send(Job { seq, raw })
            .map_err(|_| SquashfsError::corrupt("compression worker pool is gone"))
    }

    pub fn recv(&self) -> Result<JobResult> {
        self.result_rx
            .recv()
            .map_err(|_| SquashfsError::corrupt("compression worker pool is gone"))
    }

    pub fn shutdown(self) {
        drop(self.job_tx);
        for h in self.handles {
            let _ = h.join();
        }
    }
}

/// Splits a file's byte stream into `block_size` chunks, compresses them
/// across a worker pool, and writes them through a [`DataAppender`] in
/// submission order. The final short block (if any) is returned to the
/// caller instead of being written, so it can be routed to the fragment
/// writer.
pub struct FilePipeline<'a, F: BlockFile> {
    appender: &'a mut DataAppender<F>,
    pool: &'a CompressionPool,
    block_size: usize,
    cancel: Arc<AtomicBool>,
}

impl<'a, F: BlockFile> FilePipeline<'a, F> {
    pub fn new(
        appender: &'a mut DataAppender<F>,
        pool: &'a CompressionPool,
        block_size: usize,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            appender,
            pool,
            block_size,
            cancel,
        }
    }

    /// Consumes `blocks` (every full `block_size` chunk of the file; the
    /// caller holds back any final short chunk) and returns the per-block
    /// stored sizes in file order.
    pub fn run(&mut self, blocks: Vec<Vec<u8>>) -> Result<Vec<u32>> {
        let total = blocks.len() as u64;
        if total == 0 {
            return Ok(Vec::new());
        }

        for (i, block) in blocks.into_iter().enumerate() {
            self.pool.submit(i as u64, block)?;
        }

        let mut pending: BTreeMap<u64, JobResult> = BTreeMap::new();
        let mut next = 0u64;
        let mut sizes = vec![0u32; total as usize];

        while next < total {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(SquashfsError::Cancelled);
            }
            if let Some(result) = pending.remove(&next) {
                let (_, stored) = self
                    .appender
                    .write_block(&result.raw, result.compressed.as_deref())?;
                sizes[next as usize] = stored;
                next += 1;
                continue;
            }
            let result = self.pool.recv()?;
            if result.seq == next {
                let (_, stored) = self
                    .appender
                    .write_block(&result.raw, result.compressed.as_deref())?;
                sizes[next as usize] = stored;
                next += 1;
            } else {
                pending.insert(result.seq, result);
            }
        }

        Ok(sizes)
    }
}

/// Routes a file's tail bytes (shorter than one full block) into the
/// in-progress fragment, flushing and starting a new one when the current
/// fragment would overflow `block_size`.
pub struct FragmentPacker {
    buffer: Vec<u8>,
    block_size: usize,
    dedupe: HashMap<(u64, usize), (u32, u32)>,
    table: FragmentTableWriter,
}

impl FragmentPacker {
    pub fn new(block_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(block_size),
            block_size,
            dedupe: HashMap::new(),
            table: FragmentTableWriter::new(),
        }
    }

    /// Returns the fragment index and in-fragment byte offset for `tail`.
    pub fn add_tail<F: BlockFile>(
        &mut self,
        tail: &[u8],
        appender: &mut DataAppender<F>,
        compressor: &dyn crate::compressors::Compressor,
    ) -> Result<(u32, u32)> {
        let key = (fingerprint(tail), tail.len());
        if let Some(&(idx, off)) = self.dedupe.get(&key) {
            return Ok((idx, off));
        }
        if self.buffer.len() + tail.len() > self.block_size {
            self.flush(appender, compressor)?;
        }
        let offset = self.buffer.len() as u32;
        self.buffer.extend_from_slice(tail);
        self.dedupe.insert(key, (self.table.count(), offset));
        Ok((self.table.count(), offset))
    }

    fn flush<F: BlockFile>(
        &mut self,
        appender: &mut DataAppender<F>,
        compressor: &dyn crate::compressors::Compressor,
    ) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut out = Vec::with_capacity(self.buffer.len());
        let compressed = compressor.compress(&self.buffer, &mut out)?;
        let (start, stored) = appender.write_block(&self.buffer, compressed.map(|_| out.as_slice()))?;
        self.table.push(compressor, FragmentEntry { start_block: start, size: stored })?;
        self.buffer.clear();
        self.dedupe.clear();
        Ok(())
    }

    pub fn finish<F: BlockFile>(
        mut self,
        appender: &mut DataAppender<F>,
        compressor: &dyn crate::compressors::Compressor,
    ) -> Result<FragmentTableWriter> {
        self.flush(appender, compressor)?;
        Ok(self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressors::CompressorId;
    use crate::io_file::MemFile;

    #[test]
    fn identical_non_zero_blocks_are_written_independently() {
        // A full-file block list is read back by walking forward from one
        // start_block, so each block must land at its own, contiguous
        // position even when its bytes match an earlier block exactly.
        let mut appender = DataAppender::new(MemFile::new(), 0);
        let data = vec![7u8; 4096];
        let (start1, size1) = appender.write_block(&data, None).unwrap();
        let (start2, size2) = appender.write_block(&data, None).unwrap();
        assert_ne!(start1, start2);
        assert_eq!(start2, start1 + size1 as u64);
        assert_eq!(size1, size2);
    }

    #[test]
    fn all_zero_block_is_sparse() {
        let mut appender = DataAppender::new(MemFile::new(), 0);
        let data = vec![0u8; 4096];
        let (_start, size) = appender.write_block(&data, None).unwrap();
        assert_eq!(size, SPARSE_BLOCK);
    }

    #[test]
    fn pipeline_preserves_block_order() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 4096);
        let pool = CompressionPool::new(cfg, 4);
        let mut appender = DataAppender::new(MemFile::new(), 0);
        let blocks: Vec<Vec<u8>> = (0..16u8)
            .map(|i| vec![i.wrapping_mul(3).wrapping_add(1); 4096])
            .collect();
        let expected_order: Vec<u8> = (0..16u8).collect();

        let mut pipeline = FilePipeline::new(
            &mut appender,
            &pool,
            4096,
            Arc::new(AtomicBool::new(false)),
        );
        let sizes = pipeline.run(blocks).unwrap();
        pool.shutdown();

        assert_eq!(sizes.len(), expected_order.len());
        assert!(sizes.iter().all(|&s| s != 0));
    }

    #[test]
    fn fragment_packer_dedupes_within_current_fragment() {
        let cfg = CompressorConfig::new(CompressorId::Gzip, 4096);
        let compressor = cfg.build();
        let mut appender = DataAppender::new(MemFile::new(), 0);
        let mut packer = FragmentPacker::new(4096);
        let tail = b"short tail bytes";
        let (idx1, off1) = packer.add_tail(tail, &mut appender, compressor.as_ref()).unwrap();
        let (idx2, off2) = packer.add_tail(tail, &mut appender, compressor.as_ref()).unwrap();
        assert_eq!((idx1, off1), (idx2, off2));
    }
}
