//! Metadata block I/O.
//!
//! The replication core reads and writes its activity log and bitmap in
//! 4 KiB blocks through [`MetaIo`]. [`MemMetaIo`] keeps blocks in memory and
//! can inject failures; [`FileMetaIo`] stores them in a regular file or block
//! device node.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MetaError, MetaResult};
use crate::layout::{MD_BLOCK_SECTORS, MD_BLOCK_SIZE};

/// Metadata I/O statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaIoStats {
    /// Blocks read.
    pub blocks_read: u64,
    /// Blocks written.
    pub blocks_written: u64,
    /// Flushes issued.
    pub flushes: u64,
    /// Failed operations.
    pub errors: u64,
}

/// Block-granular access to the metadata area.
///
/// Sectors are 512-byte units and must be 4 KiB aligned; buffers are exactly
/// one block.
pub trait MetaIo: Send + Sync {
    /// Reads the 4 KiB block starting at `sector`.
    fn read_block(&self, sector: u64) -> MetaResult<Vec<u8>>;

    /// Writes the 4 KiB block starting at `sector`.
    fn write_block(&self, sector: u64, data: &[u8]) -> MetaResult<()>;

    /// Makes all completed writes durable.
    fn flush(&self) -> MetaResult<()>;

    /// Current statistics.
    fn stats(&self) -> MetaIoStats;
}

fn check_block(sector: u64, len: Option<usize>, capacity: u64) -> MetaResult<()> {
    if sector % MD_BLOCK_SECTORS != 0 {
        return Err(MetaError::NotAligned {
            what: "sector",
            value: sector,
            alignment: MD_BLOCK_SECTORS,
        });
    }
    if let Some(len) = len {
        if len != MD_BLOCK_SIZE {
            return Err(MetaError::NotAligned {
                what: "buffer length",
                value: len as u64,
                alignment: MD_BLOCK_SIZE as u64,
            });
        }
    }
    if sector + MD_BLOCK_SECTORS > capacity {
        return Err(MetaError::OutOfRange { sector, capacity });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct StatCounters {
    blocks_read: AtomicU64,
    blocks_written: AtomicU64,
    flushes: AtomicU64,
    errors: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> MetaIoStats {
        MetaIoStats {
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// In-memory metadata device. Unwritten blocks read back as zeros.
#[derive(Debug)]
pub struct MemMetaIo {
    capacity_sectors: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    stats: StatCounters,
}

impl MemMetaIo {
    /// Creates an empty in-memory metadata device of the given size.
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            capacity_sectors,
            blocks: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            stats: StatCounters::default(),
        }
    }

    /// Makes subsequent reads fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrites raw bytes of a block, bypassing checks. Used to simulate
    /// torn or corrupted metadata.
    pub fn corrupt(&self, sector: u64, offset: usize, bytes: &[u8]) {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .entry(sector)
            .or_insert_with(|| vec![0u8; MD_BLOCK_SIZE]);
        block[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Number of blocks that have ever been written.
    pub fn written_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl MetaIo for MemMetaIo {
    fn read_block(&self, sector: u64) -> MetaResult<Vec<u8>> {
        check_block(sector, None, self.capacity_sectors)?;
        if self.fail_reads.load(Ordering::SeqCst) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(MetaError::DeviceError {
                sector,
                reason: "injected read failure".to_string(),
            });
        }
        let data = self
            .blocks
            .lock()
            .get(&sector)
            .cloned()
            .unwrap_or_else(|| vec![0u8; MD_BLOCK_SIZE]);
        self.stats.blocks_read.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }

    fn write_block(&self, sector: u64, data: &[u8]) -> MetaResult<()> {
        check_block(sector, Some(data.len()), self.capacity_sectors)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(MetaError::DeviceError {
                sector,
                reason: "injected write failure".to_string(),
            });
        }
        self.blocks.lock().insert(sector, data.to_vec());
        self.stats.blocks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> MetaResult<()> {
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> MetaIoStats {
        self.stats.snapshot()
    }
}

/// Metadata stored in a file (or device node) with positional I/O.
#[derive(Debug)]
pub struct FileMetaIo {
    file: File,
    capacity_sectors: u64,
    stats: StatCounters,
}

impl FileMetaIo {
    /// Opens (creating if needed) `path` as a metadata device of the given
    /// size. Regular files are extended to the full size.
    pub fn open(path: &Path, capacity_sectors: u64) -> MetaResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let want = capacity_sectors * 512;
        if file.metadata()?.is_file() && file.metadata()?.len() < want {
            file.set_len(want)?;
        }
        debug!(path = %path.display(), capacity_sectors, "opened metadata file");
        Ok(Self {
            file,
            capacity_sectors,
            stats: StatCounters::default(),
        })
    }
}

impl MetaIo for FileMetaIo {
    fn read_block(&self, sector: u64) -> MetaResult<Vec<u8>> {
        check_block(sector, None, self.capacity_sectors)?;
        let mut buf = vec![0u8; MD_BLOCK_SIZE];
        if let Err(e) = self.file.read_exact_at(&mut buf, sector * 512) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(sector, error = %e, "metadata read failed");
            return Err(e.into());
        }
        self.stats.blocks_read.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    fn write_block(&self, sector: u64, data: &[u8]) -> MetaResult<()> {
        check_block(sector, Some(data.len()), self.capacity_sectors)?;
        if let Err(e) = self.file.write_all_at(data, sector * 512) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(sector, error = %e, "metadata write failed");
            return Err(e.into());
        }
        self.stats.blocks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> MetaResult<()> {
        self.file.sync_data()?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> MetaIoStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_unwritten_reads_zero() {
        let io = MemMetaIo::new(64);
        let block = io.read_block(8).unwrap();
        assert_eq!(block.len(), MD_BLOCK_SIZE);
        assert!(block.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mem_write_read() {
        let io = MemMetaIo::new(64);
        let data = vec![0x5au8; MD_BLOCK_SIZE];
        io.write_block(16, &data).unwrap();
        assert_eq!(io.read_block(16).unwrap(), data);
        let stats = io.stats();
        assert_eq!(stats.blocks_written, 1);
        assert_eq!(stats.blocks_read, 1);
    }

    #[test]
    fn test_mem_alignment_and_range() {
        let io = MemMetaIo::new(64);
        assert!(matches!(io.read_block(3), Err(MetaError::NotAligned { .. })));
        assert!(matches!(
            io.write_block(8, &[0u8; 100]),
            Err(MetaError::NotAligned { .. })
        ));
        assert!(matches!(io.read_block(64), Err(MetaError::OutOfRange { .. })));
    }

    #[test]
    fn test_mem_injected_failures() {
        let io = MemMetaIo::new(64);
        io.set_fail_writes(true);
        assert!(io.write_block(0, &vec![0u8; MD_BLOCK_SIZE]).is_err());
        io.set_fail_writes(false);
        io.write_block(0, &vec![0u8; MD_BLOCK_SIZE]).unwrap();
        io.set_fail_reads(true);
        assert!(io.read_block(0).is_err());
        assert_eq!(io.stats().errors, 2);
    }

    #[test]
    fn test_mem_corrupt() {
        let io = MemMetaIo::new(64);
        io.corrupt(8, 10, &[1, 2, 3]);
        let block = io.read_block(8).unwrap();
        assert_eq!(&block[10..13], &[1, 2, 3]);
    }

    #[test]
    fn test_file_meta_io_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("md");
        let data = vec![0x11u8; MD_BLOCK_SIZE];
        {
            let io = FileMetaIo::open(&path, 128).unwrap();
            io.write_block(8, &data).unwrap();
            io.flush().unwrap();
        }
        let io = FileMetaIo::open(&path, 128).unwrap();
        assert_eq!(io.read_block(8).unwrap(), data);
        assert!(io.read_block(0).unwrap().iter().all(|&b| b == 0));
    }
}
