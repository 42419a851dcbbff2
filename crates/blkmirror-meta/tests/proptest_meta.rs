//! Property-based tests for blkmirror-meta using proptest.

use blkmirror_meta::{
    block_crc32c, MemMetaIo, MetaIo, MetaLayout, Placement, MD_BLOCK_SECTORS, MD_BLOCK_SIZE,
};
use proptest::prelude::*;

proptest! {
    /// Regions never overlap and internal layouts never overlap the data area.
    #[test]
    fn test_layout_regions_disjoint(
        device_sectors in 4096u64..(1u64 << 32),
        max_peers in 1u32..8,
        al_size_4k in 1u32..64,
        internal in any::<bool>(),
    ) {
        let placement = if internal {
            Placement::Internal
        } else {
            Placement::External { start_sector: 0 }
        };
        if let Ok(l) = MetaLayout::compute(device_sectors, max_peers, al_size_4k, placement) {
            let mut ranges = vec![l.superblock, l.activity_log, l.bitmap];
            ranges.sort_by_key(|r| r.start);
            for w in ranges.windows(2) {
                prop_assert!(w[0].end() <= w[1].start);
            }
            if internal {
                prop_assert!(l.data_sectors <= l.bitmap.start);
                prop_assert!(l.superblock.end() <= device_sectors);
            }
            prop_assert_eq!(l.superblock.start % MD_BLOCK_SECTORS, 0);
            prop_assert_eq!(l.bitmap.sectors, l.bm_pages_per_plane * max_peers as u64 * MD_BLOCK_SECTORS);
        }
    }

    /// A single flipped byte always changes the embedded block checksum.
    #[test]
    fn test_block_crc_detects_single_byte_change(
        fill in any::<u8>(),
        pos in 0usize..MD_BLOCK_SIZE,
        delta in 1u8..=255,
    ) {
        prop_assume!(!(8..12).contains(&pos));
        let mut block = vec![fill; MD_BLOCK_SIZE];
        let crc = block_crc32c(&block, 8);
        block[pos] = block[pos].wrapping_add(delta);
        prop_assert_ne!(block_crc32c(&block, 8), crc);
    }

    /// The last write to a block wins.
    #[test]
    fn test_mem_meta_last_write_wins(writes in proptest::collection::vec((0u64..16, any::<u8>()), 1..32)) {
        let io = MemMetaIo::new(16 * MD_BLOCK_SECTORS);
        let mut expect = std::collections::HashMap::new();
        for (block, byte) in &writes {
            io.write_block(block * MD_BLOCK_SECTORS, &vec![*byte; MD_BLOCK_SIZE]).unwrap();
            expect.insert(*block, *byte);
        }
        for (block, byte) in expect {
            let data = io.read_block(block * MD_BLOCK_SECTORS).unwrap();
            prop_assert!(data.iter().all(|&b| b == byte));
        }
    }
}
