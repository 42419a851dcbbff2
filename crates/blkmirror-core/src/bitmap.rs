//! Per-peer out-of-sync bitmap.
//!
//! One bit per 4 KiB block per peer plane; a set bit means "this block might
//! differ between us and that peer". Each plane keeps a cached set-bit count
//! per 4 KiB bitmap page (one page covers one 128 MiB bitmap extent), so the
//! total weight and per-extent decisions never scan raw words.
//!
//! Fine-grained operations (`set_bits`, `clear_bits`, `test_bit`, ...) take
//! a short internal lock. Bulk operations (load, resize, set/clear all,
//! bitmap exchange merges) are only reachable through a
//! [`BitmapLockGuard`] obtained from [`Bitmap::lock`], which records a
//! reason and owner and locks out the fine-grained operations named by its
//! [`BmLockFlags`].

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use blkmirror_meta::{MetaIo, MetaLayout, BM_BITS_PER_PAGE, MD_BLOCK_SIZE};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::BitmapError;
use crate::types::SectorSpan;

const WORDS_PER_PAGE: usize = MD_BLOCK_SIZE / 8;

/// Fine-grained operations locked out while a bulk lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BmLockFlags(u8);

impl BmLockFlags {
    /// Nothing locked out.
    pub const NONE: BmLockFlags = BmLockFlags(0);
    /// `test_bit`, `find_next*`, `count_bits`, `get_words`.
    pub const TEST: BmLockFlags = BmLockFlags(0x1);
    /// `set_bits`.
    pub const SET: BmLockFlags = BmLockFlags(0x2);
    /// `clear_bits`.
    pub const CLEAR: BmLockFlags = BmLockFlags(0x4);
    /// Persistence from outside the lock holder.
    pub const BULK: BmLockFlags = BmLockFlags(0x8);
    /// Everything.
    pub const ALL: BmLockFlags = BmLockFlags(0xf);

    /// Whether every flag of `other` is set.
    pub fn contains(self, other: BmLockFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BmLockFlags {
    type Output = BmLockFlags;

    fn bitor(self, rhs: BmLockFlags) -> BmLockFlags {
        BmLockFlags(self.0 | rhs.0)
    }
}

/// Where a bitmap is persisted.
#[derive(Clone)]
pub struct BitmapStore {
    /// Metadata device.
    pub meta: Arc<dyn MetaIo>,
    /// Metadata layout giving the page locations.
    pub layout: MetaLayout,
}

impl fmt::Debug for BitmapStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapStore")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Plane {
    words: Vec<u64>,
    page_weight: Vec<u32>,
    weight: u64,
    dirty: Vec<bool>,
}

impl Plane {
    fn new(bits: u64) -> Self {
        let words = bits.div_ceil(64) as usize;
        let pages = pages_for(bits);
        Self {
            words: vec![0; words],
            page_weight: vec![0; pages],
            weight: 0,
            dirty: vec![false; pages],
        }
    }

    /// Sets or clears `[first, last]`; returns how many bits changed.
    fn change_range(&mut self, first: u64, last: u64, set: bool) -> u64 {
        let mut changed = 0u64;
        let mut bit = first;
        while bit <= last {
            let w = (bit / 64) as usize;
            let lo = bit % 64;
            let base = bit - lo;
            let hi = (last - base).min(63);
            let len = hi - lo + 1;
            let mask = if len == 64 { !0u64 } else { ((1u64 << len) - 1) << lo };
            let old = self.words[w];
            let new = if set { old | mask } else { old & !mask };
            let delta = (old ^ new).count_ones();
            if delta > 0 {
                self.words[w] = new;
                let page = w / WORDS_PER_PAGE;
                if set {
                    self.page_weight[page] += delta;
                    self.weight += delta as u64;
                } else {
                    self.page_weight[page] -= delta;
                    self.weight -= delta as u64;
                }
                self.dirty[page] = true;
                changed += delta as u64;
            }
            bit = base + 64;
        }
        changed
    }

    fn count_range(&self, first: u64, last: u64) -> u64 {
        let mut count = 0u64;
        let mut bit = first;
        while bit <= last {
            let w = (bit / 64) as usize;
            let lo = bit % 64;
            let base = bit - lo;
            let hi = (last - base).min(63);
            let len = hi - lo + 1;
            let mask = if len == 64 { !0u64 } else { ((1u64 << len) - 1) << lo };
            count += (self.words[w] & mask).count_ones() as u64;
            bit = base + 64;
        }
        count
    }

    fn test(&self, bit: u64) -> bool {
        self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
    }

    fn recount(&mut self) {
        self.weight = 0;
        for (page, weight) in self.page_weight.iter_mut().enumerate() {
            let start = page * WORDS_PER_PAGE;
            let end = (start + WORDS_PER_PAGE).min(self.words.len());
            *weight = self.words[start..end].iter().map(|w| w.count_ones()).sum();
            self.weight += *weight as u64;
        }
    }

    fn mask_tail(&mut self, bits: u64) {
        let rem = bits % 64;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }

    fn page_bytes(&self, page: usize) -> Vec<u8> {
        let mut buf = vec![0u8; MD_BLOCK_SIZE];
        let start = page * WORDS_PER_PAGE;
        let end = (start + WORDS_PER_PAGE).min(self.words.len());
        for (i, w) in self.words[start..end].iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        buf
    }
}

fn pages_for(bits: u64) -> usize {
    bits.div_ceil(BM_BITS_PER_PAGE).max(1) as usize
}

#[derive(Debug, Clone)]
struct LockInfo {
    why: String,
    flags: BmLockFlags,
    owner: Option<u32>,
}

#[derive(Debug)]
struct BitmapInner {
    bits: u64,
    planes: Vec<Plane>,
    lock: Option<LockInfo>,
}

impl BitmapInner {
    fn check(&self, op_flag: BmLockFlags, op: &'static str) -> Result<(), BitmapError> {
        match &self.lock {
            Some(l) if l.flags.contains(op_flag) => Err(BitmapError::Locked {
                why: l.why.clone(),
                op,
            }),
            _ => Ok(()),
        }
    }

    fn plane(&self, plane: u32) -> Result<&Plane, BitmapError> {
        self.planes
            .get(plane as usize)
            .ok_or(BitmapError::NoSuchPlane(plane))
    }

    fn plane_mut(&mut self, plane: u32) -> Result<&mut Plane, BitmapError> {
        self.planes
            .get_mut(plane as usize)
            .ok_or(BitmapError::NoSuchPlane(plane))
    }

    fn check_range(&self, first: u64, last: u64) -> Result<(), BitmapError> {
        if first > last || last >= self.bits {
            return Err(BitmapError::OutOfRange {
                bit: last.max(first),
                bits: self.bits,
            });
        }
        Ok(())
    }
}

/// The out-of-sync bitmap of one device, all peer planes.
pub struct Bitmap {
    inner: Mutex<BitmapInner>,
    bulk: Mutex<()>,
    store: Option<BitmapStore>,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Bitmap")
            .field("bits", &inner.bits)
            .field("planes", &inner.planes.len())
            .finish_non_exhaustive()
    }
}

impl Bitmap {
    /// Creates an in-memory, all-clear bitmap of `bits` bits per plane.
    pub fn new(bits: u64, planes: u32, store: Option<BitmapStore>) -> Self {
        Self {
            inner: Mutex::new(BitmapInner {
                bits,
                planes: (0..planes).map(|_| Plane::new(bits)).collect(),
                lock: None,
            }),
            bulk: Mutex::new(()),
            store,
        }
    }

    /// Bits per plane.
    pub fn bits(&self) -> u64 {
        self.inner.lock().bits
    }

    /// Number of planes.
    pub fn planes(&self) -> u32 {
        self.inner.lock().planes.len() as u32
    }

    /// Takes the bulk lock, waiting for any other holder.
    pub fn lock(&self, why: &str, flags: BmLockFlags, owner: Option<u32>) -> BitmapLockGuard<'_> {
        let bulk = match self.bulk.try_lock() {
            Some(g) => g,
            None => {
                let holder = self.inner.lock().lock.as_ref().map(|l| l.why.clone());
                warn!(why, holder = ?holder, "waiting for bitmap lock");
                self.bulk.lock()
            }
        };
        self.inner.lock().lock = Some(LockInfo {
            why: why.to_string(),
            flags,
            owner,
        });
        debug!(why, owner = ?owner, "bitmap locked");
        BitmapLockGuard {
            bitmap: self,
            _bulk: bulk,
        }
    }

    /// Reason and owner of the current bulk lock.
    pub fn locked_by(&self) -> Option<(String, Option<u32>)> {
        self.inner
            .lock()
            .lock
            .as_ref()
            .map(|l| (l.why.clone(), l.owner))
    }

    /// Sets `[first, last]`; returns the number of newly set bits.
    pub fn set_bits(&self, plane: u32, first: u64, last: u64) -> Result<u64, BitmapError> {
        let mut inner = self.inner.lock();
        inner.check(BmLockFlags::SET, "set")?;
        inner.check_range(first, last)?;
        Ok(inner.plane_mut(plane)?.change_range(first, last, true))
    }

    /// Clears `[first, last]`; returns the number of cleared bits.
    pub fn clear_bits(&self, plane: u32, first: u64, last: u64) -> Result<u64, BitmapError> {
        let mut inner = self.inner.lock();
        inner.check(BmLockFlags::CLEAR, "clear")?;
        inner.check_range(first, last)?;
        Ok(inner.plane_mut(plane)?.change_range(first, last, false))
    }

    /// Marks every block touched by `span` out of sync.
    pub fn set_out_of_sync(&self, plane: u32, span: SectorSpan) -> Result<u64, BitmapError> {
        if span.sectors == 0 {
            return Ok(0);
        }
        let (first, last) = span.bits();
        match self.clamp(first, last) {
            Some((first, last)) => self.set_bits(plane, first, last),
            None => Ok(0),
        }
    }

    /// Marks every block fully covered by `span` in sync.
    pub fn set_in_sync(&self, plane: u32, span: SectorSpan) -> Result<u64, BitmapError> {
        let Some((first, last)) = span.full_bits() else {
            return Ok(0);
        };
        match self.clamp(first, last) {
            Some((first, last)) => self.clear_bits(plane, first, last),
            None => Ok(0),
        }
    }

    fn clamp(&self, first: u64, last: u64) -> Option<(u64, u64)> {
        let bits = self.bits();
        if first >= bits {
            return None;
        }
        Some((first, last.min(bits - 1)))
    }

    /// Tests one bit.
    pub fn test_bit(&self, plane: u32, bit: u64) -> Result<bool, BitmapError> {
        let inner = self.inner.lock();
        inner.check(BmLockFlags::TEST, "test")?;
        inner.check_range(bit, bit)?;
        Ok(inner.plane(plane)?.test(bit))
    }

    /// Set bits in `[first, last]`.
    pub fn count_bits(&self, plane: u32, first: u64, last: u64) -> Result<u64, BitmapError> {
        let inner = self.inner.lock();
        inner.check(BmLockFlags::TEST, "count")?;
        inner.check_range(first, last)?;
        Ok(inner.plane(plane)?.count_range(first, last))
    }

    /// Set bits in the whole plane, from the cache. Unknown planes weigh 0.
    pub fn total_weight(&self, plane: u32) -> u64 {
        self.inner
            .lock()
            .planes
            .get(plane as usize)
            .map(|p| p.weight)
            .unwrap_or(0)
    }

    /// Set bits in bitmap extent `ext` (one page), from the cache.
    pub fn extent_weight(&self, plane: u32, ext: u64) -> u32 {
        self.inner
            .lock()
            .planes
            .get(plane as usize)
            .and_then(|p| p.page_weight.get(ext as usize).copied())
            .unwrap_or(0)
    }

    /// First set bit at or after `from`.
    pub fn find_next(&self, plane: u32, from: u64) -> Result<Option<u64>, BitmapError> {
        let inner = self.inner.lock();
        inner.check(BmLockFlags::TEST, "find")?;
        let p = inner.plane(plane)?;
        let bits = inner.bits;
        let mut bit = from;
        while bit < bits {
            let page = (bit / BM_BITS_PER_PAGE) as usize;
            if p.page_weight[page] == 0 {
                bit = (page as u64 + 1) * BM_BITS_PER_PAGE;
                continue;
            }
            let w = (bit / 64) as usize;
            let word = p.words[w] & (!0u64 << (bit % 64));
            if word != 0 {
                let found = w as u64 * 64 + word.trailing_zeros() as u64;
                return Ok((found < bits).then_some(found));
            }
            bit = (w as u64 + 1) * 64;
        }
        Ok(None)
    }

    /// First clear bit at or after `from`.
    pub fn find_next_zero(&self, plane: u32, from: u64) -> Result<Option<u64>, BitmapError> {
        let inner = self.inner.lock();
        inner.check(BmLockFlags::TEST, "find")?;
        let p = inner.plane(plane)?;
        let bits = inner.bits;
        let mut bit = from;
        while bit < bits {
            let w = (bit / 64) as usize;
            let word = !p.words[w] & (!0u64 << (bit % 64));
            if word != 0 {
                let found = w as u64 * 64 + word.trailing_zeros() as u64;
                return Ok((found < bits).then_some(found));
            }
            bit = (w as u64 + 1) * 64;
        }
        Ok(None)
    }

    /// Copies `count` words starting at word `offset` (bitmap exchange).
    pub fn get_words(&self, plane: u32, offset: u64, count: usize) -> Result<Vec<u64>, BitmapError> {
        let inner = self.inner.lock();
        inner.check(BmLockFlags::TEST, "get words")?;
        let p = inner.plane(plane)?;
        let start = (offset as usize).min(p.words.len());
        let end = (start + count).min(p.words.len());
        Ok(p.words[start..end].to_vec())
    }

    /// Number of 64-bit words per plane.
    pub fn words(&self) -> u64 {
        self.inner.lock().bits.div_ceil(64)
    }

    /// Pages marked dirty and not yet written.
    pub fn dirty_pages(&self) -> usize {
        self.inner
            .lock()
            .planes
            .iter()
            .map(|p| p.dirty.iter().filter(|d| **d).count())
            .sum()
    }

    /// Writes every page of every plane.
    pub fn write_full(&self) -> Result<usize, BitmapError> {
        self.write_pages(|_, _, _| true)
    }

    /// Writes only pages changed since their last write.
    pub fn write_hinted(&self) -> Result<usize, BitmapError> {
        self.write_pages(|_, plane, page| plane.dirty[page])
    }

    /// Writes the pages of `plane` covering bits `[first, last]`.
    pub fn write_range(&self, plane: u32, first: u64, last: u64) -> Result<usize, BitmapError> {
        let first_page = (first / BM_BITS_PER_PAGE) as usize;
        let last_page = (last / BM_BITS_PER_PAGE) as usize;
        self.write_pages(|index, _, page| index == plane && page >= first_page && page <= last_page)
    }

    fn write_pages(
        &self,
        mut select: impl FnMut(u32, &Plane, usize) -> bool,
    ) -> Result<usize, BitmapError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.check(BmLockFlags::BULK, "write")?;
            for (index, plane) in inner.planes.iter_mut().enumerate() {
                for page in 0..plane.page_weight.len() {
                    if select(index as u32, plane, page) {
                        pending.push((index as u32, page, plane.page_bytes(page)));
                        plane.dirty[page] = false;
                    }
                }
            }
        }
        let written = pending.len();
        for (i, (index, page, data)) in pending.iter().enumerate() {
            let sector = store.layout.bm_page_sector(*index, *page as u64);
            if let Err(e) = store.meta.write_block(sector, data) {
                let mut inner = self.inner.lock();
                for (index, page, _) in &pending[i..] {
                    inner.planes[*index as usize].dirty[*page] = true;
                }
                return Err(e.into());
            }
        }
        if written > 0 {
            store.meta.flush()?;
            debug!(pages = written, "bitmap pages written");
        }
        Ok(written)
    }
}

/// Exclusive bulk access to a [`Bitmap`]. Dropping it releases the lock.
pub struct BitmapLockGuard<'a> {
    bitmap: &'a Bitmap,
    _bulk: MutexGuard<'a, ()>,
}

impl BitmapLockGuard<'_> {
    /// Reason recorded for this lock.
    pub fn why(&self) -> String {
        self.bitmap
            .inner
            .lock()
            .lock
            .as_ref()
            .map(|l| l.why.clone())
            .unwrap_or_default()
    }

    /// Sets every bit of `plane`.
    pub fn set_all(&self, plane: u32) -> Result<u64, BitmapError> {
        let mut inner = self.bitmap.inner.lock();
        let bits = inner.bits;
        if bits == 0 {
            return Ok(0);
        }
        Ok(inner.plane_mut(plane)?.change_range(0, bits - 1, true))
    }

    /// Clears every bit of `plane`.
    pub fn clear_all(&self, plane: u32) -> Result<u64, BitmapError> {
        let mut inner = self.bitmap.inner.lock();
        let bits = inner.bits;
        if bits == 0 {
            return Ok(0);
        }
        Ok(inner.plane_mut(plane)?.change_range(0, bits - 1, false))
    }

    /// Sets several ranges at once.
    pub fn set_many(&self, plane: u32, ranges: &[(u64, u64)]) -> Result<u64, BitmapError> {
        self.change_many(plane, ranges, true)
    }

    /// Clears several ranges at once.
    pub fn clear_many(&self, plane: u32, ranges: &[(u64, u64)]) -> Result<u64, BitmapError> {
        self.change_many(plane, ranges, false)
    }

    fn change_many(&self, plane: u32, ranges: &[(u64, u64)], set: bool) -> Result<u64, BitmapError> {
        let mut inner = self.bitmap.inner.lock();
        for (first, last) in ranges {
            inner.check_range(*first, *last)?;
        }
        let p = inner.plane_mut(plane)?;
        Ok(ranges
            .iter()
            .map(|(first, last)| p.change_range(*first, *last, set))
            .sum())
    }

    /// ORs `words` into `plane` at word `offset`; returns newly set bits.
    pub fn merge_words(&self, plane: u32, offset: u64, words: &[u64]) -> Result<u64, BitmapError> {
        let mut inner = self.bitmap.inner.lock();
        let bits = inner.bits;
        let p = inner.plane_mut(plane)?;
        let start = offset as usize;
        if start + words.len() > p.words.len() {
            return Err(BitmapError::OutOfRange {
                bit: (start + words.len()) as u64 * 64,
                bits,
            });
        }
        for (i, w) in words.iter().enumerate() {
            p.words[start + i] |= *w;
            p.dirty[(start + i) / WORDS_PER_PAGE] = true;
        }
        p.mask_tail(bits);
        let before = p.weight;
        p.recount();
        Ok(p.weight - before)
    }

    /// Changes the number of bits per plane. New bits are set when
    /// `set_new` is true.
    pub fn resize(&self, bits: u64, set_new: bool) -> Result<(), BitmapError> {
        let mut inner = self.bitmap.inner.lock();
        let old_bits = inner.bits;
        for p in inner.planes.iter_mut() {
            p.words.resize(bits.div_ceil(64) as usize, 0);
            let pages = pages_for(bits);
            p.page_weight.resize(pages, 0);
            p.dirty = vec![true; pages];
            p.mask_tail(bits);
            p.recount();
            if set_new && bits > old_bits {
                p.change_range(old_bits, bits - 1, true);
            }
        }
        inner.bits = bits;
        debug!(old_bits, bits, "bitmap resized");
        Ok(())
    }

    /// Loads every plane from the metadata device.
    pub fn read(&self) -> Result<(), BitmapError> {
        let Some(store) = &self.bitmap.store else {
            return Ok(());
        };
        let (planes, pages, words) = {
            let inner = self.bitmap.inner.lock();
            (
                inner.planes.len(),
                pages_for(inner.bits),
                inner.bits.div_ceil(64) as usize,
            )
        };
        let mut loaded = Vec::with_capacity(planes);
        for index in 0..planes {
            let mut plane_words = Vec::with_capacity(pages * WORDS_PER_PAGE);
            for page in 0..pages {
                let block = store
                    .meta
                    .read_block(store.layout.bm_page_sector(index as u32, page as u64))?;
                plane_words.extend(
                    block
                        .chunks_exact(8)
                        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])),
                );
            }
            plane_words.truncate(words);
            loaded.push(plane_words);
        }
        let mut inner = self.bitmap.inner.lock();
        let bits = inner.bits;
        for (p, words) in inner.planes.iter_mut().zip(loaded) {
            p.words = words;
            p.mask_tail(bits);
            p.recount();
            p.dirty.iter_mut().for_each(|d| *d = false);
        }
        debug!(planes, pages, "bitmap loaded");
        Ok(())
    }
}

impl Drop for BitmapLockGuard<'_> {
    fn drop(&mut self) {
        self.bitmap.inner.lock().lock = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blkmirror_meta::{MemMetaIo, Placement};

    fn stored(bits_sectors: u64, planes: u32) -> (Bitmap, Arc<MemMetaIo>) {
        let layout = MetaLayout::compute(bits_sectors, planes, 1, Placement::External { start_sector: 0 }).unwrap();
        let meta = Arc::new(MemMetaIo::new(layout.md_size_sectors()));
        let bits = bits_sectors / 8;
        let bm = Bitmap::new(
            bits,
            planes,
            Some(BitmapStore {
                meta: meta.clone(),
                layout,
            }),
        );
        (bm, meta)
    }

    #[test]
    fn test_set_clear_weight() {
        let bm = Bitmap::new(10_000, 1, None);
        assert_eq!(bm.set_bits(0, 100, 199).unwrap(), 100);
        assert_eq!(bm.total_weight(0), 100);
        assert_eq!(bm.clear_bits(0, 100, 149).unwrap(), 50);
        assert_eq!(bm.total_weight(0), 50);
        assert_eq!(bm.count_bits(0, 0, 9_999).unwrap(), 50);
        assert!(bm.test_bit(0, 150).unwrap());
        assert!(!bm.test_bit(0, 149).unwrap());
    }

    #[test]
    fn test_set_is_idempotent() {
        let bm = Bitmap::new(256, 1, None);
        assert_eq!(bm.set_bits(0, 0, 127).unwrap(), 128);
        assert_eq!(bm.set_bits(0, 64, 191).unwrap(), 64);
        assert_eq!(bm.total_weight(0), 192);
    }

    #[test]
    fn test_planes_are_independent() {
        let bm = Bitmap::new(1000, 2, None);
        bm.set_bits(1, 5, 9).unwrap();
        assert_eq!(bm.total_weight(0), 0);
        assert_eq!(bm.total_weight(1), 5);
        assert!(matches!(bm.set_bits(2, 0, 0), Err(BitmapError::NoSuchPlane(2))));
    }

    #[test]
    fn test_out_of_range() {
        let bm = Bitmap::new(100, 1, None);
        assert!(matches!(bm.set_bits(0, 90, 100), Err(BitmapError::OutOfRange { .. })));
        assert!(matches!(bm.test_bit(0, 100), Err(BitmapError::OutOfRange { .. })));
    }

    #[test]
    fn test_sector_helpers() {
        let bm = Bitmap::new(100, 1, None);
        // sectors 4..12 touch blocks 0 and 1, cover neither fully
        assert_eq!(bm.set_out_of_sync(0, SectorSpan::new(4, 8)).unwrap(), 2);
        assert_eq!(bm.set_in_sync(0, SectorSpan::new(4, 8)).unwrap(), 0);
        assert_eq!(bm.set_in_sync(0, SectorSpan::new(0, 16)).unwrap(), 2);
        // clamped at the end
        assert_eq!(bm.set_out_of_sync(0, SectorSpan::new(792, 100)).unwrap(), 1);
        assert_eq!(bm.set_out_of_sync(0, SectorSpan::new(800, 8)).unwrap(), 0);
    }

    #[test]
    fn test_find_next() {
        let bm = Bitmap::new(100_000, 1, None);
        bm.set_bits(0, 70_000, 70_002).unwrap();
        assert_eq!(bm.find_next(0, 0).unwrap(), Some(70_000));
        assert_eq!(bm.find_next(0, 70_001).unwrap(), Some(70_001));
        assert_eq!(bm.find_next(0, 70_003).unwrap(), None);
        assert_eq!(bm.find_next_zero(0, 70_000).unwrap(), Some(70_003));
        assert_eq!(bm.find_next_zero(0, 0).unwrap(), Some(0));
    }

    #[test]
    fn test_extent_weight() {
        let bm = Bitmap::new(100_000, 1, None);
        bm.set_bits(0, 32_760, 32_770).unwrap();
        assert_eq!(bm.extent_weight(0, 0), 8);
        assert_eq!(bm.extent_weight(0, 1), 3);
    }

    #[test]
    fn test_lock_forbids_operations() {
        let bm = Bitmap::new(100, 1, None);
        {
            let guard = bm.lock("resize", BmLockFlags::SET | BmLockFlags::CLEAR, Some(0));
            assert_eq!(guard.why(), "resize");
            let err = bm.set_bits(0, 1, 1).unwrap_err();
            assert!(matches!(err, BitmapError::Locked { ref why, op: "set" } if why == "resize"));
            assert!(bm.clear_bits(0, 1, 1).is_err());
            assert!(bm.test_bit(0, 1).is_ok());
            assert_eq!(bm.locked_by(), Some(("resize".to_string(), Some(0))));
            guard.set_all(0).unwrap();
        }
        assert_eq!(bm.total_weight(0), 100);
        assert!(bm.clear_bits(0, 0, 99).is_ok());
        assert_eq!(bm.locked_by(), None);
    }

    #[test]
    fn test_set_all_clear_all_many() {
        let bm = Bitmap::new(130, 1, None);
        let g = bm.lock("bulk", BmLockFlags::ALL, None);
        assert_eq!(g.set_all(0).unwrap(), 130);
        assert_eq!(g.clear_many(0, &[(0, 9), (120, 129)]).unwrap(), 20);
        assert_eq!(g.clear_all(0).unwrap(), 110);
        assert_eq!(g.set_many(0, &[(1, 1), (64, 65)]).unwrap(), 3);
        drop(g);
        assert_eq!(bm.total_weight(0), 3);
    }

    #[test]
    fn test_merge_and_get_words() {
        let a = Bitmap::new(200, 1, None);
        let b = Bitmap::new(200, 1, None);
        a.set_bits(0, 0, 3).unwrap();
        b.set_bits(0, 2, 5).unwrap();
        b.set_bits(0, 150, 150).unwrap();
        let words = b.get_words(0, 0, 100).unwrap();
        assert_eq!(words.len(), 4);
        let g = a.lock("receive bitmap", BmLockFlags::SET | BmLockFlags::CLEAR, Some(0));
        assert_eq!(g.merge_words(0, 0, &words).unwrap(), 3);
        drop(g);
        assert_eq!(a.total_weight(0), 7);
    }

    #[test]
    fn test_resize() {
        let bm = Bitmap::new(100, 1, None);
        bm.set_bits(0, 90, 99).unwrap();
        let g = bm.lock("resize", BmLockFlags::ALL, None);
        g.resize(95, false).unwrap();
        drop(g);
        assert_eq!(bm.total_weight(0), 5);
        let g = bm.lock("resize", BmLockFlags::ALL, None);
        g.resize(200, true).unwrap();
        drop(g);
        assert_eq!(bm.bits(), 200);
        assert_eq!(bm.total_weight(0), 110);
    }

    #[test]
    fn test_persist_full_and_read_back() {
        let (bm, meta) = stored(1 << 20, 2);
        bm.set_bits(0, 5, 10).unwrap();
        bm.set_bits(1, 100_000, 100_001).unwrap();
        let pages = bm.write_full().unwrap();
        assert_eq!(pages, 2 * 4);
        assert_eq!(bm.dirty_pages(), 0);

        let layout = MetaLayout::compute(1 << 20, 2, 1, Placement::External { start_sector: 0 }).unwrap();
        let other = Bitmap::new(
            (1 << 20) / 8,
            2,
            Some(BitmapStore {
                meta: meta.clone(),
                layout,
            }),
        );
        other.lock("load", BmLockFlags::ALL, None).read().unwrap();
        assert_eq!(other.total_weight(0), 6);
        assert_eq!(other.total_weight(1), 2);
        assert!(other.test_bit(1, 100_001).unwrap());
    }

    #[test]
    fn test_write_hinted_only_dirty() {
        let (bm, meta) = stored(1 << 20, 1);
        bm.write_full().unwrap();
        let before = meta.stats().blocks_written;
        bm.set_bits(0, 40_000, 40_000).unwrap();
        assert_eq!(bm.dirty_pages(), 1);
        assert_eq!(bm.write_hinted().unwrap(), 1);
        assert_eq!(meta.stats().blocks_written, before + 1);
        assert_eq!(bm.write_hinted().unwrap(), 0);
    }

    #[test]
    fn test_write_range() {
        let (bm, meta) = stored(1 << 20, 2);
        assert_eq!(bm.write_range(1, 0, 40_000).unwrap(), 2);
        assert_eq!(meta.stats().blocks_written, 2);
    }

    #[test]
    fn test_write_failure_keeps_pages_dirty() {
        let (bm, meta) = stored(1 << 20, 1);
        bm.set_bits(0, 0, 0).unwrap();
        meta.set_fail_writes(true);
        assert!(matches!(bm.write_hinted(), Err(BitmapError::Meta(_))));
        assert_eq!(bm.dirty_pages(), 1);
        meta.set_fail_writes(false);
        assert_eq!(bm.write_hinted().unwrap(), 1);
    }
}
