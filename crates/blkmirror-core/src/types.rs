//! Identifiers, size constants and sector arithmetic shared by all modules.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 512-byte sector number.
pub type Sector = u64;

/// Bytes per sector.
pub const SECTOR_SIZE: u64 = 512;
/// One bitmap bit covers 4 KiB of storage.
pub const BM_BLOCK_SHIFT: u32 = 12;
/// Bytes per bitmap bit.
pub const BM_BLOCK_SIZE: u64 = 1 << BM_BLOCK_SHIFT;
/// Sectors per bitmap bit.
pub const BM_SECT_PER_BIT: u64 = BM_BLOCK_SIZE / SECTOR_SIZE;
/// One bitmap (resync) extent covers 128 MiB, exactly one 4 KiB bitmap page.
pub const BM_EXT_SHIFT: u32 = 27;
/// Bits per bitmap extent.
pub const BM_BITS_PER_EXT: u64 = 1 << (BM_EXT_SHIFT - BM_BLOCK_SHIFT);
/// One activity log extent covers 4 MiB.
pub const AL_EXTENT_SHIFT: u32 = 22;
/// Bytes per activity log extent.
pub const AL_EXTENT_SIZE: u64 = 1 << AL_EXTENT_SHIFT;
/// Sectors per activity log extent.
pub const AL_SECT_PER_EXT: u64 = AL_EXTENT_SIZE / SECTOR_SIZE;
/// Bitmap bits per activity log extent.
pub const AL_BITS_PER_EXT: u64 = 1 << (AL_EXTENT_SHIFT - BM_BLOCK_SHIFT);
/// Activity log extents per bitmap extent.
pub const AL_EXT_PER_BM_EXT: u64 = 1 << (BM_EXT_SHIFT - AL_EXTENT_SHIFT);
/// Maximum number of peers (bitmap planes) per device.
pub const MAX_PEERS: usize = 32;
/// Largest single replication request in bytes.
pub const MAX_BIO_SIZE: u64 = 128 * 1024;

/// Bitmap bit holding `sector`.
pub fn sect_to_bit(sector: Sector) -> u64 {
    sector >> (BM_BLOCK_SHIFT - 9)
}

/// First sector covered by `bit`.
pub fn bit_to_sect(bit: u64) -> Sector {
    bit << (BM_BLOCK_SHIFT - 9)
}

/// Activity log extent holding `sector`.
pub fn sect_to_al_ext(sector: Sector) -> u64 {
    sector >> (AL_EXTENT_SHIFT - 9)
}

/// First sector of activity log extent `enr`.
pub fn al_ext_to_sect(enr: u64) -> Sector {
    enr << (AL_EXTENT_SHIFT - 9)
}

/// Bitmap extent holding `bit`.
pub fn bit_to_bm_ext(bit: u64) -> u64 {
    bit >> (BM_EXT_SHIFT - BM_BLOCK_SHIFT)
}

/// Bitmap extent holding `sector`.
pub fn sect_to_bm_ext(sector: Sector) -> u64 {
    sector >> (BM_EXT_SHIFT - 9)
}

/// A half-open range of sectors `[sector, sector + sectors)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorSpan {
    /// First sector.
    pub sector: Sector,
    /// Length in sectors.
    pub sectors: u64,
}

impl SectorSpan {
    /// Creates a span.
    pub fn new(sector: Sector, sectors: u64) -> Self {
        Self { sector, sectors }
    }

    /// Creates a span from a byte length.
    pub fn from_bytes(sector: Sector, bytes: u64) -> Self {
        Self::new(sector, bytes.div_ceil(SECTOR_SIZE))
    }

    /// One past the last sector.
    pub fn end(&self) -> Sector {
        self.sector + self.sectors
    }

    /// Length in bytes.
    pub fn bytes(&self) -> u64 {
        self.sectors * SECTOR_SIZE
    }

    /// Returns true if the spans share at least one sector.
    pub fn overlaps(&self, other: &SectorSpan) -> bool {
        self.sector < other.end() && other.sector < self.end()
    }

    /// Inclusive range of bitmap bits touched by this span.
    ///
    /// Partially covered blocks are included: marking out-of-sync must never
    /// miss a block.
    pub fn bits(&self) -> (u64, u64) {
        let first = sect_to_bit(self.sector);
        let last = sect_to_bit(self.end().saturating_sub(1).max(self.sector));
        (first, last)
    }

    /// Inclusive range of bitmap bits fully covered by this span.
    ///
    /// Clearing bits must only happen for blocks that were written whole.
    /// Returns `None` if no block is fully covered.
    pub fn full_bits(&self) -> Option<(u64, u64)> {
        let first = self.sector.div_ceil(BM_SECT_PER_BIT);
        let end = self.end() / BM_SECT_PER_BIT;
        if end > first {
            Some((first, end - 1))
        } else {
            None
        }
    }

    /// Inclusive range of activity log extents touched by this span.
    pub fn al_extents(&self) -> (u64, u64) {
        let first = sect_to_al_ext(self.sector);
        let last = sect_to_al_ext(self.end().saturating_sub(1).max(self.sector));
        (first, last)
    }
}

impl fmt::Display for SectorSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.sector, self.sectors)
    }
}

/// Volume number within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub u32);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vol{}", self.0)
    }
}

/// Connection identifier; equal to the peer's node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer{}", self.0)
    }
}

/// One volume as seen over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerDeviceId {
    /// The connection.
    pub conn: ConnectionId,
    /// The volume.
    pub volume: VolumeId,
}

impl PeerDeviceId {
    /// Creates a peer device id.
    pub fn new(conn: ConnectionId, volume: VolumeId) -> Self {
        Self { conn, volume }
    }
}

impl fmt::Display for PeerDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.conn, self.volume)
    }
}

/// Replication protocol of a connection: when a write counts as replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Protocol {
    /// Asynchronous: once handed to the transport.
    A,
    /// Memory-synchronous: once the peer received it.
    B,
    /// Synchronous: once the peer wrote it.
    #[default]
    C,
}

/// Resource-wide write-ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteOrdering {
    /// No automatic barriers; requests may complete in any order.
    None,
    /// Barriers on flush/FUA writes and every `max_epoch_size` writes.
    #[default]
    Barrier,
    /// As `Barrier`, and requests leave the transfer log in dagtag order.
    Strict,
}

impl WriteOrdering {
    /// Whether epochs are closed automatically.
    pub fn uses_barriers(&self) -> bool {
        !matches!(self, WriteOrdering::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(BM_SECT_PER_BIT, 8);
        assert_eq!(BM_BITS_PER_EXT, 32768);
        assert_eq!(AL_SECT_PER_EXT, 8192);
        assert_eq!(AL_BITS_PER_EXT, 1024);
        assert_eq!(AL_EXT_PER_BM_EXT, 32);
    }

    #[test]
    fn test_sector_conversions() {
        assert_eq!(sect_to_bit(0), 0);
        assert_eq!(sect_to_bit(7), 0);
        assert_eq!(sect_to_bit(8), 1);
        assert_eq!(bit_to_sect(3), 24);
        assert_eq!(sect_to_al_ext(8191), 0);
        assert_eq!(sect_to_al_ext(8192), 1);
        assert_eq!(al_ext_to_sect(2), 16384);
        assert_eq!(bit_to_bm_ext(32767), 0);
        assert_eq!(bit_to_bm_ext(32768), 1);
        assert_eq!(sect_to_bm_ext(262_144), 1);
    }

    #[test]
    fn test_span_bits_partial_blocks() {
        let span = SectorSpan::new(4, 8);
        assert_eq!(span.bits(), (0, 1));
        assert_eq!(span.full_bits(), None);
        let aligned = SectorSpan::new(8, 16);
        assert_eq!(aligned.bits(), (1, 2));
        assert_eq!(aligned.full_bits(), Some((1, 2)));
        let ragged = SectorSpan::new(4, 20);
        assert_eq!(ragged.full_bits(), Some((1, 1)));
    }

    #[test]
    fn test_span_overlaps() {
        let a = SectorSpan::new(0, 8);
        let b = SectorSpan::new(7, 8);
        let c = SectorSpan::new(8, 8);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_span_al_extents() {
        let span = SectorSpan::new(8190, 4);
        assert_eq!(span.al_extents(), (0, 1));
        assert_eq!(SectorSpan::from_bytes(0, 4096).sectors, 8);
    }

    #[test]
    fn test_write_ordering_barriers() {
        assert!(!WriteOrdering::None.uses_barriers());
        assert!(WriteOrdering::Barrier.uses_barriers());
        assert!(WriteOrdering::Strict.uses_barriers());
    }
}
