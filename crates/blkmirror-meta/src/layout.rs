//! Metadata area layout.
//!
//! The metadata area holds three regions, addressed in 512-byte sectors:
//!
//! ```text
//! external:  [ 4k superblock ][ activity log ring ][ bitmap planes ]
//!            ^ md_offset
//!
//! internal:  [ data ... ][ bitmap planes ][ activity log ring ][ 4k superblock ]
//!                                                               ^ md_offset
//! ```
//!
//! The bitmap stores one plane per peer slot. Each plane is rounded up to a
//! whole number of 4 KiB pages so that one page always describes the same
//! 128 MiB of storage.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MetaError, MetaResult};

/// Metadata block size in bytes.
pub const MD_BLOCK_SIZE: usize = 4096;
/// Sectors per metadata block.
pub const MD_BLOCK_SECTORS: u64 = 8;
/// Storage bytes described by one bitmap bit.
pub const BM_BLOCK_SIZE: u64 = 4096;
/// Bits in one 4 KiB bitmap page.
pub const BM_BITS_PER_PAGE: u64 = (MD_BLOCK_SIZE as u64) * 8;
/// Default number of 4 KiB activity log transaction blocks (32 KiB ring).
pub const DEFAULT_AL_SIZE_4K: u32 = 8;

/// Where the metadata area lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// At the end of the backing device, shrinking the usable data area.
    Internal,
    /// On a separate device, starting at the given sector.
    External {
        /// First sector of the metadata area on the metadata device.
        start_sector: u64,
    },
}

/// A contiguous range of sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorRange {
    /// First sector.
    pub start: u64,
    /// Length in sectors.
    pub sectors: u64,
}

impl SectorRange {
    /// Creates a sector range.
    pub fn new(start: u64, sectors: u64) -> Self {
        Self { start, sectors }
    }

    /// One past the last sector.
    pub fn end(&self) -> u64 {
        self.start + self.sectors
    }

    /// Returns true if `sector` lies in this range.
    pub fn contains(&self, sector: u64) -> bool {
        sector >= self.start && sector < self.end()
    }
}

/// Computed layout of the metadata area for one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLayout {
    /// Placement policy this layout was computed for.
    pub placement: Placement,
    /// Superblock block (one 4 KiB block).
    pub superblock: SectorRange,
    /// Activity log transaction ring.
    pub activity_log: SectorRange,
    /// Bitmap area, all planes.
    pub bitmap: SectorRange,
    /// Number of 4 KiB activity log transaction blocks.
    pub al_size_4k: u32,
    /// Number of peer planes in the bitmap area.
    pub max_peers: u32,
    /// 4 KiB pages per bitmap plane.
    pub bm_pages_per_plane: u64,
    /// Usable data sectors on the backing device.
    pub data_sectors: u64,
}

/// Pages needed per bitmap plane for `data_sectors` of storage.
pub fn bitmap_pages_for(data_sectors: u64) -> u64 {
    let bits = data_sectors.div_ceil(BM_BLOCK_SIZE / 512);
    bits.div_ceil(BM_BITS_PER_PAGE).max(1)
}

impl MetaLayout {
    /// Computes the layout for a backing device of `device_sectors`.
    ///
    /// For internal placement the metadata is carved from the end of the
    /// device; the bitmap is sized for the whole device, which slightly
    /// over-allocates but never under-allocates.
    pub fn compute(
        device_sectors: u64,
        max_peers: u32,
        al_size_4k: u32,
        placement: Placement,
    ) -> MetaResult<Self> {
        if max_peers == 0 {
            return Err(MetaError::InvalidLayout {
                reason: "max_peers must be at least 1".to_string(),
            });
        }
        if al_size_4k == 0 {
            return Err(MetaError::InvalidLayout {
                reason: "activity log needs at least one transaction block".to_string(),
            });
        }

        let al_sectors = al_size_4k as u64 * MD_BLOCK_SECTORS;
        let pages = bitmap_pages_for(device_sectors);
        let bm_sectors = pages * max_peers as u64 * MD_BLOCK_SECTORS;

        let layout = match placement {
            Placement::External { start_sector } => {
                if start_sector % MD_BLOCK_SECTORS != 0 {
                    return Err(MetaError::NotAligned {
                        what: "metadata start sector",
                        value: start_sector,
                        alignment: MD_BLOCK_SECTORS,
                    });
                }
                let superblock = SectorRange::new(start_sector, MD_BLOCK_SECTORS);
                let activity_log = SectorRange::new(superblock.end(), al_sectors);
                let bitmap = SectorRange::new(activity_log.end(), bm_sectors);
                Self {
                    placement,
                    superblock,
                    activity_log,
                    bitmap,
                    al_size_4k,
                    max_peers,
                    bm_pages_per_plane: pages,
                    data_sectors: device_sectors,
                }
            }
            Placement::Internal => {
                // superblock is 4k aligned at the end of the device
                let sb_start = (device_sectors / MD_BLOCK_SECTORS)
                    .checked_sub(1)
                    .map(|b| b * MD_BLOCK_SECTORS)
                    .ok_or_else(|| MetaError::InvalidLayout {
                        reason: format!("device of {} sectors is too small", device_sectors),
                    })?;
                let md_sectors = MD_BLOCK_SECTORS + al_sectors + bm_sectors;
                if md_sectors >= device_sectors {
                    return Err(MetaError::InvalidLayout {
                        reason: format!(
                            "metadata needs {} sectors, device has {}",
                            md_sectors, device_sectors
                        ),
                    });
                }
                let activity_log = SectorRange::new(sb_start - al_sectors, al_sectors);
                let bitmap = SectorRange::new(activity_log.start - bm_sectors, bm_sectors);
                Self {
                    placement,
                    superblock: SectorRange::new(sb_start, MD_BLOCK_SECTORS),
                    activity_log,
                    bitmap,
                    al_size_4k,
                    max_peers,
                    bm_pages_per_plane: pages,
                    data_sectors: bitmap.start,
                }
            }
        };

        debug!(
            placement = ?layout.placement,
            al_start = layout.activity_log.start,
            bm_start = layout.bitmap.start,
            data_sectors = layout.data_sectors,
            "computed metadata layout"
        );
        Ok(layout)
    }

    /// Sector of the activity log transaction block `slot` (0..al_size_4k).
    pub fn al_block_sector(&self, slot: u32) -> u64 {
        self.activity_log.start + (slot % self.al_size_4k) as u64 * MD_BLOCK_SECTORS
    }

    /// Sector of bitmap page `page` in the plane of `bitmap_index`.
    pub fn bm_page_sector(&self, bitmap_index: u32, page: u64) -> u64 {
        self.bitmap.start
            + (bitmap_index as u64 * self.bm_pages_per_plane + page) * MD_BLOCK_SECTORS
    }

    /// Total size of the metadata area in sectors.
    pub fn md_size_sectors(&self) -> u64 {
        self.superblock.sectors + self.activity_log.sectors + self.bitmap.sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB_SECTORS: u64 = 1 << 21;

    #[test]
    fn test_bitmap_pages_for() {
        // 128 MiB per page
        assert_eq!(bitmap_pages_for(262_144), 1);
        assert_eq!(bitmap_pages_for(262_145), 2);
        assert_eq!(bitmap_pages_for(GIB_SECTORS), 8);
        assert_eq!(bitmap_pages_for(0), 1);
    }

    #[test]
    fn test_external_layout() {
        let l = MetaLayout::compute(GIB_SECTORS, 2, 8, Placement::External { start_sector: 0 })
            .unwrap();
        assert_eq!(l.superblock, SectorRange::new(0, 8));
        assert_eq!(l.activity_log, SectorRange::new(8, 64));
        assert_eq!(l.bitmap, SectorRange::new(72, 8 * 2 * 8));
        assert_eq!(l.data_sectors, GIB_SECTORS);
        assert_eq!(l.md_size_sectors(), 8 + 64 + 128);
    }

    #[test]
    fn test_internal_layout_at_end_of_device() {
        let l = MetaLayout::compute(GIB_SECTORS, 1, 8, Placement::Internal).unwrap();
        assert_eq!(l.superblock.end(), GIB_SECTORS);
        assert_eq!(l.activity_log.end(), l.superblock.start);
        assert_eq!(l.bitmap.end(), l.activity_log.start);
        assert_eq!(l.data_sectors, l.bitmap.start);
        assert!(l.data_sectors < GIB_SECTORS);
    }

    #[test]
    fn test_page_and_al_addressing() {
        let l = MetaLayout::compute(GIB_SECTORS, 2, 4, Placement::External { start_sector: 0 })
            .unwrap();
        assert_eq!(l.al_block_sector(0), 8);
        assert_eq!(l.al_block_sector(5), 8 + 8);
        let plane1 = l.bm_page_sector(1, 0);
        assert_eq!(plane1, l.bitmap.start + 8 * 8);
        assert!(l.bitmap.contains(l.bm_page_sector(1, 7)));
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(MetaLayout::compute(GIB_SECTORS, 0, 8, Placement::Internal).is_err());
        assert!(MetaLayout::compute(GIB_SECTORS, 1, 0, Placement::Internal).is_err());
        assert!(MetaLayout::compute(16, 1, 8, Placement::Internal).is_err());
        assert!(matches!(
            MetaLayout::compute(GIB_SECTORS, 1, 8, Placement::External { start_sector: 3 }),
            Err(MetaError::NotAligned { .. })
        ));
    }
}
