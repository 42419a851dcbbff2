//! Lower block device collaborator.
//!
//! The core submits local reads and writes through [`LowerDevice::submit`];
//! the owner of the device reports each completion back through
//! [`Resource::local_io_done`](crate::resource::Resource::local_io_done),
//! possibly from a context that must not block.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::types::{Sector, SectorSpan, VolumeId, SECTOR_SIZE};

/// Identifies one submitted local I/O.
pub type IoToken = u64;

/// Errors reported by a lower device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LowerError {
    /// Unreadable or unwritable sectors.
    #[error("{volume}: media error at sector {sector}")]
    Media {
        /// The volume.
        volume: VolumeId,
        /// First failing sector.
        sector: Sector,
    },
    /// The device does not exist or went away.
    #[error("{0}: device gone")]
    Gone(VolumeId),
}

/// The operation of a local I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerOp {
    /// Read `sectors` sectors.
    Read {
        /// Length.
        sectors: u64,
    },
    /// Write the payload.
    Write {
        /// Payload, a multiple of 512 bytes.
        data: Bytes,
    },
}

/// A local I/O request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerIo {
    /// Completion token.
    pub token: IoToken,
    /// The volume.
    pub volume: VolumeId,
    /// First sector.
    pub sector: Sector,
    /// Read or write.
    pub op: LowerOp,
}

impl LowerIo {
    /// Sector span covered.
    pub fn span(&self) -> SectorSpan {
        match &self.op {
            LowerOp::Read { sectors } => SectorSpan::new(self.sector, *sectors),
            LowerOp::Write { data } => SectorSpan::from_bytes(self.sector, data.len() as u64),
        }
    }
}

/// Result of a local I/O: read data (empty for writes) or an error.
pub type LowerResult = Result<Bytes, LowerError>;

/// A finished local I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerCompletion {
    /// The token passed in.
    pub token: IoToken,
    /// Outcome.
    pub result: LowerResult,
}

/// Local block storage.
///
/// Overlapping I/O submitted in order must take effect in that order.
pub trait LowerDevice: Send + Sync {
    /// Starts `io`. Completion is reported asynchronously.
    fn submit(&self, io: LowerIo);
}

/// Disk statistics of a [`MemDisk`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemDiskStats {
    /// Reads executed.
    pub reads: u64,
    /// Writes executed.
    pub writes: u64,
    /// Failed operations.
    pub errors: u64,
}

/// In-memory lower device: executes I/O on submit and queues the
/// completions until [`take_completions`](MemDisk::take_completions).
#[derive(Debug, Default)]
pub struct MemDisk {
    volumes: Mutex<HashMap<VolumeId, Vec<u8>>>,
    completions: Mutex<VecDeque<LowerCompletion>>,
    failing: Mutex<Vec<(VolumeId, SectorSpan)>>,
    reads: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl MemDisk {
    /// Creates a device without volumes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a zero-filled volume.
    pub fn add_volume(&self, volume: VolumeId, sectors: u64) {
        self.volumes
            .lock()
            .insert(volume, vec![0u8; (sectors * SECTOR_SIZE) as usize]);
    }

    /// Makes I/O overlapping `span` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_range(&self, volume: VolumeId, span: SectorSpan) {
        self.failing.lock().push((volume, span));
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Reads raw content, bypassing completions.
    pub fn read_raw(&self, volume: VolumeId, span: SectorSpan) -> Option<Vec<u8>> {
        let volumes = self.volumes.lock();
        let disk = volumes.get(&volume)?;
        let start = (span.sector * SECTOR_SIZE) as usize;
        let end = (span.end() * SECTOR_SIZE) as usize;
        disk.get(start..end).map(|s| s.to_vec())
    }

    /// Writes raw content, bypassing completions.
    pub fn write_raw(&self, volume: VolumeId, sector: Sector, data: &[u8]) -> bool {
        let mut volumes = self.volumes.lock();
        let Some(disk) = volumes.get_mut(&volume) else {
            return false;
        };
        let start = (sector * SECTOR_SIZE) as usize;
        match disk.get_mut(start..start + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Removes and returns all queued completions.
    pub fn take_completions(&self) -> Vec<LowerCompletion> {
        self.completions.lock().drain(..).collect()
    }

    /// Number of queued completions.
    pub fn pending(&self) -> usize {
        self.completions.lock().len()
    }

    /// Current statistics.
    pub fn stats(&self) -> MemDiskStats {
        MemDiskStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn execute(&self, io: &LowerIo) -> LowerResult {
        let span = io.span();
        if self
            .failing
            .lock()
            .iter()
            .any(|(v, s)| *v == io.volume && s.overlaps(&span))
        {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(LowerError::Media {
                volume: io.volume,
                sector: io.sector,
            });
        }
        let mut volumes = self.volumes.lock();
        let disk = volumes.get_mut(&io.volume).ok_or(LowerError::Gone(io.volume))?;
        let start = (span.sector * SECTOR_SIZE) as usize;
        let end = (span.end() * SECTOR_SIZE) as usize;
        if end > disk.len() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(LowerError::Media {
                volume: io.volume,
                sector: io.sector,
            });
        }
        match &io.op {
            LowerOp::Read { .. } => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                Ok(Bytes::copy_from_slice(&disk[start..end]))
            }
            LowerOp::Write { data } => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                disk[start..end].copy_from_slice(data);
                Ok(Bytes::new())
            }
        }
    }
}

impl LowerDevice for MemDisk {
    fn submit(&self, io: LowerIo) {
        let result = self.execute(&io);
        if let Err(e) = &result {
            debug!(token = io.token, error = %e, "lower I/O failed");
        }
        self.completions.lock().push_back(LowerCompletion {
            token: io.token,
            result,
        });
    }
}
