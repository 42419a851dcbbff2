//! Activity log: the set of recently written 4 MiB extents, journaled so
//! that after a crash only those extents (plus the bitmap) need a resync.
//!
//! Writes pin the extents they touch. Bringing a new extent in evicts the
//! least recently used unpinned one; the evicted range is marked out of
//! sync for peers that are not being replicated to and those bitmap pages
//! are written before the change is journaled. Changes are journaled as
//! transactions into a ring of 4 KiB blocks; each transaction also carries
//! a window of the slot table (its context), so replaying the ring from
//! any consistent point rebuilds a superset of the hot extents.
//!
//! The per-peer resync extent caches live here too, so that application
//! writes and resync lock against each other under one lock.

use std::sync::Arc;

use blkmirror_meta::{block_crc32c, MetaIo, MetaLayout, MD_BLOCK_SIZE};
use tracing::{debug, info, warn};

use crate::bitmap::{Bitmap, BmLockFlags};
use crate::error::{AlError, BitmapError};
use crate::lru::{LruCache, LruGet, LruStats, LC_FREE};
use crate::types::{sect_to_bm_ext, SectorSpan, AL_BITS_PER_EXT, AL_EXT_PER_BM_EXT};

/// Magic of a transaction block.
pub const AL_TR_MAGIC: u32 = 0x69cb_65a2;
/// Slot changes per transaction.
pub const AL_UPDATES_PER_TRANSACTION: usize = 64;
/// Slot table entries carried per transaction.
pub const AL_CONTEXT_PER_TRANSACTION: usize = 919;
/// Slot numbers are 16 bit on disk.
pub const AL_MAX_EXTENTS: usize = u16::MAX as usize - 1;
/// Transaction type of a normal update.
pub const AL_TR_UPDATE: u16 = 0;
/// Transaction type written when formatting the ring.
pub const AL_TR_INITIALIZED: u16 = 0xffff;

const OFF_MAGIC: usize = 0;
const OFF_TR_NUMBER: usize = 4;
const OFF_CRC: usize = 8;
const OFF_TYPE: usize = 12;
const OFF_N_UPDATES: usize = 14;
const OFF_CONTEXT_SIZE: usize = 16;
const OFF_CONTEXT_START: usize = 18;
const OFF_UPDATE_SLOTS: usize = 36;
const OFF_UPDATE_EXTENTS: usize = OFF_UPDATE_SLOTS + 2 * AL_UPDATES_PER_TRANSACTION;
const OFF_CONTEXT: usize = OFF_UPDATE_EXTENTS + 4 * AL_UPDATES_PER_TRANSACTION;

/// Resync extent refuses new application writes.
pub const BME_NO_WRITES: u8 = 0x1;
/// Resync I/O is running on the extent.
pub const BME_LOCKED: u8 = 0x2;
/// Application I/O is waiting for the extent.
pub const BME_PRIORITY: u8 = 0x4;

/// One transaction block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlTransaction {
    /// Sequence number.
    pub tr_number: u32,
    /// [`AL_TR_UPDATE`] or [`AL_TR_INITIALIZED`].
    pub tr_type: u16,
    /// `(slot, extent)` changes; extent [`LC_FREE`] frees the slot.
    pub updates: Vec<(u16, u32)>,
    /// First slot described by `context`.
    pub context_start: u16,
    /// Extents of consecutive slots after this transaction.
    pub context: Vec<u32>,
}

impl AlTransaction {
    /// Serializes into a 4 KiB block, big-endian, with its CRC32C.
    pub fn encode(&self) -> Vec<u8> {
        let mut b = vec![0u8; MD_BLOCK_SIZE];
        b[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&AL_TR_MAGIC.to_be_bytes());
        b[OFF_TR_NUMBER..OFF_TR_NUMBER + 4].copy_from_slice(&self.tr_number.to_be_bytes());
        b[OFF_TYPE..OFF_TYPE + 2].copy_from_slice(&self.tr_type.to_be_bytes());
        let n = self.updates.len().min(AL_UPDATES_PER_TRANSACTION);
        b[OFF_N_UPDATES..OFF_N_UPDATES + 2].copy_from_slice(&(n as u16).to_be_bytes());
        let ctx = self.context.len().min(AL_CONTEXT_PER_TRANSACTION);
        b[OFF_CONTEXT_SIZE..OFF_CONTEXT_SIZE + 2].copy_from_slice(&(ctx as u16).to_be_bytes());
        b[OFF_CONTEXT_START..OFF_CONTEXT_START + 2].copy_from_slice(&self.context_start.to_be_bytes());
        for i in 0..AL_UPDATES_PER_TRANSACTION {
            let (slot, ext) = self.updates.get(i).copied().unwrap_or((u16::MAX, LC_FREE));
            let s = OFF_UPDATE_SLOTS + 2 * i;
            b[s..s + 2].copy_from_slice(&slot.to_be_bytes());
            let e = OFF_UPDATE_EXTENTS + 4 * i;
            b[e..e + 4].copy_from_slice(&ext.to_be_bytes());
        }
        for i in 0..AL_CONTEXT_PER_TRANSACTION {
            let ext = self.context.get(i).copied().unwrap_or(LC_FREE);
            let c = OFF_CONTEXT + 4 * i;
            b[c..c + 4].copy_from_slice(&ext.to_be_bytes());
        }
        let crc = block_crc32c(&b, OFF_CRC);
        b[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_be_bytes());
        b
    }

    /// Parses a block, checking magic and checksum.
    pub fn decode(b: &[u8]) -> Result<Self, AlError> {
        if b.len() != MD_BLOCK_SIZE {
            return Err(AlError::Corrupt(format!("transaction block of {} bytes", b.len())));
        }
        let u16_at = |o: usize| u16::from_be_bytes([b[o], b[o + 1]]);
        let u32_at = |o: usize| u32::from_be_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        let magic = u32_at(OFF_MAGIC);
        if magic != AL_TR_MAGIC {
            return Err(AlError::Corrupt(format!("bad magic {:#x}", magic)));
        }
        let crc = u32_at(OFF_CRC);
        let actual = block_crc32c(b, OFF_CRC);
        if crc != actual {
            return Err(AlError::Corrupt(format!(
                "checksum mismatch: stored {:#x}, computed {:#x}",
                crc, actual
            )));
        }
        let n = u16_at(OFF_N_UPDATES) as usize;
        let ctx = u16_at(OFF_CONTEXT_SIZE) as usize;
        if n > AL_UPDATES_PER_TRANSACTION || ctx > AL_CONTEXT_PER_TRANSACTION {
            return Err(AlError::Corrupt(format!("{} updates, {} context entries", n, ctx)));
        }
        Ok(Self {
            tr_number: u32_at(OFF_TR_NUMBER),
            tr_type: u16_at(OFF_TYPE),
            updates: (0..n)
                .map(|i| (u16_at(OFF_UPDATE_SLOTS + 2 * i), u32_at(OFF_UPDATE_EXTENTS + 4 * i)))
                .collect(),
            context_start: u16_at(OFF_CONTEXT_START),
            context: (0..ctx).map(|i| u32_at(OFF_CONTEXT + 4 * i)).collect(),
        })
    }
}

/// Resync bookkeeping of one 128 MiB bitmap extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BmExtent {
    /// Bits still out of sync.
    pub rs_left: u32,
    /// Bits that failed to resync.
    pub rs_failed: u32,
    /// `BME_*` flags.
    pub flags: u8,
}

/// Where the activity log ring lives.
#[derive(Clone)]
pub struct AlStore {
    /// Metadata device.
    pub meta: Arc<dyn MetaIo>,
    /// Layout giving the ring location.
    pub layout: MetaLayout,
}

impl std::fmt::Debug for AlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlStore")
            .field("al_size_4k", &self.layout.al_size_4k)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`ActivityLog::read_log`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlReplay {
    /// Valid transactions found.
    pub transactions: usize,
    /// Unreadable blocks tolerated (a torn last write).
    pub torn: usize,
    /// Extents active after replay.
    pub extents: Vec<u64>,
}

/// The activity log of one device.
pub struct ActivityLog {
    lru: LruCache<()>,
    store: Option<AlStore>,
    bitmap: Arc<Bitmap>,
    updates_enabled: bool,
    tr_number: u32,
    next_block: u32,
    context_start: usize,
    suspended: bool,
    resync: Vec<LruCache<BmExtent>>,
    transactions: u64,
}

impl std::fmt::Debug for ActivityLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLog")
            .field("capacity", &self.lru.capacity())
            .field("used", &self.lru.used())
            .field("tr_number", &self.tr_number)
            .field("suspended", &self.suspended)
            .finish_non_exhaustive()
    }
}

fn bm_err(e: BitmapError) -> AlError {
    match e {
        BitmapError::Meta(m) => AlError::Meta(m),
        other => AlError::Corrupt(other.to_string()),
    }
}

impl ActivityLog {
    /// Creates an empty log of `extents` slots. `resync_extents` sizes the
    /// resync cache of each bitmap plane.
    pub fn new(
        extents: usize,
        bitmap: Arc<Bitmap>,
        store: Option<AlStore>,
        resync_extents: usize,
        updates_enabled: bool,
    ) -> Self {
        let planes = bitmap.planes() as usize;
        let extents = extents.clamp(1, AL_MAX_EXTENTS);
        Self {
            lru: LruCache::new(extents, AL_UPDATES_PER_TRANSACTION),
            store,
            bitmap,
            updates_enabled,
            tr_number: 0,
            next_block: 0,
            context_start: 0,
            suspended: false,
            resync: (0..planes)
                .map(|_| LruCache::new(resync_extents.max(1), resync_extents.max(1)))
                .collect(),
            transactions: 0,
        }
    }

    /// Pins the extents of `span`, journaling any change. Fails without
    /// side effects (besides marking evicted ranges) when the caller has to
    /// wait: no free slot, a resync lock, or suspension.
    pub fn begin_io(&mut self, span: SectorSpan, unreplicated: &[u32]) -> Result<(), AlError> {
        let changed = self.begin_io_prepare(span, unreplicated)?;
        if changed {
            if let Err(e) = self.commit() {
                self.rollback(span);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Pins the extents of `span` only if all are committed and unlocked.
    pub fn begin_io_fastpath(&mut self, span: SectorSpan) -> bool {
        let (first, last) = span.al_extents();
        if self.check_resync_locks(first, last).is_err() {
            return false;
        }
        for enr in first..=last {
            if self.lru.try_get(enr).is_none() {
                for done in first..enr {
                    self.lru.put(done);
                }
                return false;
            }
        }
        true
    }

    /// Pins the extents of `span`, staging changes. Returns whether a
    /// [`commit`](Self::commit) is needed before the write may proceed.
    pub fn begin_io_prepare(&mut self, span: SectorSpan, unreplicated: &[u32]) -> Result<bool, AlError> {
        if self.suspended {
            return if self.begin_io_fastpath(span) {
                Ok(false)
            } else {
                Err(AlError::Suspended)
            };
        }
        let (first, last) = span.al_extents();
        self.check_resync_locks(first, last)?;

        let mut pinned: Vec<(u64, bool)> = Vec::new();
        let mut changed = false;
        for enr in first..=last {
            let failure = match self.lru.get(enr) {
                LruGet::Hit(_) => {
                    pinned.push((enr, false));
                    None
                }
                LruGet::Changed { evicted, .. } => {
                    pinned.push((enr, true));
                    changed = true;
                    match evicted {
                        Some(old) => self.mark_evicted(old, unreplicated).err(),
                        None => None,
                    }
                }
                LruGet::Starving => Some(AlError::NoFreeSlot(self.lru.capacity())),
                LruGet::TooManyPending => Some(AlError::TooManyPending),
                LruGet::Locked => Some(AlError::Suspended),
            };
            if let Some(e) = failure {
                self.unpin(&pinned);
                return Err(e);
            }
        }
        Ok(changed)
    }

    /// Journals staged changes.
    pub fn commit(&mut self) -> Result<(), AlError> {
        if !self.lru.has_pending() {
            return Ok(());
        }
        if !self.updates_enabled {
            self.lru.committed();
            return Ok(());
        }
        self.write_transaction(AL_TR_UPDATE)
    }

    /// Unpins the extents of `span`.
    pub fn complete_io(&mut self, span: SectorSpan) {
        let (first, last) = span.al_extents();
        for enr in first..=last {
            self.lru.put(enr);
        }
    }

    fn unpin(&mut self, pinned: &[(u64, bool)]) {
        for (enr, changed) in pinned.iter().rev() {
            self.lru.put(*enr);
            if *changed {
                self.lru.forget_pending(*enr);
            }
        }
    }

    fn rollback(&mut self, span: SectorSpan) {
        let (first, last) = span.al_extents();
        for enr in (first..=last).rev() {
            self.lru.put(enr);
            self.lru.forget_pending(enr);
        }
    }

    fn check_resync_locks(&self, first: u64, last: u64) -> Result<(), AlError> {
        let (bm_first, bm_last) = (first / AL_EXT_PER_BM_EXT, last / AL_EXT_PER_BM_EXT);
        for cache in &self.resync {
            for enr in bm_first..=bm_last {
                if let Some(el) = cache.find(enr) {
                    if el.payload.flags & (BME_NO_WRITES | BME_LOCKED) != 0 {
                        return Err(AlError::ResyncLocked { enr });
                    }
                }
            }
        }
        Ok(())
    }

    fn extent_bits(&self, enr: u64) -> Option<(u64, u64)> {
        let bits = self.bitmap.bits();
        let first = enr * AL_BITS_PER_EXT;
        (first < bits).then(|| (first, (first + AL_BITS_PER_EXT - 1).min(bits - 1)))
    }

    fn mark_evicted(&self, enr: u64, planes: &[u32]) -> Result<(), AlError> {
        let Some((first, last)) = self.extent_bits(enr) else {
            return Ok(());
        };
        for &plane in planes {
            self.bitmap.set_bits(plane, first, last).map_err(bm_err)?;
            self.bitmap.write_range(plane, first, last).map_err(bm_err)?;
        }
        debug!(enr, planes = planes.len(), "evicted activity log extent");
        Ok(())
    }

    fn context(&self, start: usize) -> Vec<u32> {
        let cap = self.lru.capacity();
        let size = cap.min(AL_CONTEXT_PER_TRANSACTION);
        (0..size)
            .map(|i| {
                self.lru
                    .slot((start + i) % cap)
                    .and_then(|el| el.new_number.or(el.number))
                    .map(|n| n as u32)
                    .unwrap_or(LC_FREE)
            })
            .collect()
    }

    fn write_transaction(&mut self, tr_type: u16) -> Result<(), AlError> {
        let cap = self.lru.capacity();
        let start = self.context_start % cap;
        let tr = AlTransaction {
            tr_number: self.tr_number,
            tr_type,
            updates: self
                .lru
                .pending_changes()
                .into_iter()
                .map(|(slot, n)| (slot as u16, n as u32))
                .collect(),
            context_start: start as u16,
            context: self.context(start),
        };
        if let Some(store) = &self.store {
            let sector = store.layout.al_block_sector(self.next_block);
            store.meta.write_block(sector, &tr.encode())?;
            store.meta.flush()?;
            self.next_block = (self.next_block + 1) % store.layout.al_size_4k;
        }
        self.tr_number = self.tr_number.wrapping_add(1);
        self.context_start = (start + tr.context.len()) % cap;
        self.lru.committed();
        self.transactions += 1;
        debug!(
            tr_number = tr.tr_number,
            updates = tr.updates.len(),
            "activity log transaction written"
        );
        Ok(())
    }

    /// Formats the ring: every block gets a valid, empty transaction.
    pub fn initialize(&mut self) -> Result<(), AlError> {
        self.lru.reset();
        self.tr_number = 0;
        self.next_block = 0;
        self.context_start = 0;
        let blocks = self.store.as_ref().map(|s| s.layout.al_size_4k).unwrap_or(1);
        for _ in 0..blocks {
            self.write_transaction(AL_TR_INITIALIZED)?;
        }
        info!(blocks, "activity log initialized");
        Ok(())
    }

    /// Rebuilds the slot table from the ring. At most one unreadable block
    /// (a torn last write) is tolerated; the valid transactions must be
    /// consecutive.
    pub fn read_log(&mut self) -> Result<AlReplay, AlError> {
        let Some(store) = self.store.clone() else {
            return Ok(AlReplay::default());
        };
        let blocks = store.layout.al_size_4k;
        let mut valid: Vec<(u32, AlTransaction)> = Vec::new();
        let mut torn = 0usize;
        for block in 0..blocks {
            let data = store.meta.read_block(store.layout.al_block_sector(block))?;
            match AlTransaction::decode(&data) {
                Ok(tr) => valid.push((block, tr)),
                Err(e) => {
                    debug!(block, error = %e, "unreadable activity log block");
                    torn += 1;
                }
            }
        }
        if torn > 1 {
            return Err(AlError::Corrupt(format!("{} unreadable transaction blocks", torn)));
        }
        if valid.is_empty() {
            return Err(AlError::Corrupt("no valid transaction".to_string()));
        }
        valid.sort_by_key(|(_, tr)| tr.tr_number);
        if let Some(w) = valid
            .windows(2)
            .find(|w| w[1].1.tr_number != w[0].1.tr_number.wrapping_add(1))
        {
            return Err(AlError::Corrupt(format!(
                "transaction {} follows {}",
                w[1].1.tr_number, w[0].1.tr_number
            )));
        }

        let cap = self.lru.capacity();
        self.lru.reset();
        let as_number = |ext: u32| (ext != LC_FREE).then_some(ext as u64);
        for (_, tr) in &valid {
            for (slot, ext) in &tr.updates {
                self.lru.set(*slot as usize, as_number(*ext));
            }
            for (i, ext) in tr.context.iter().enumerate() {
                self.lru.set((tr.context_start as usize + i) % cap, as_number(*ext));
            }
        }
        if let Some((block, last)) = valid.last() {
            self.tr_number = last.tr_number.wrapping_add(1);
            self.next_block = (block + 1) % blocks;
            self.context_start = (last.context_start as usize + last.context.len()) % cap;
        }
        let replay = AlReplay {
            transactions: valid.len(),
            torn,
            extents: self.lru.numbers(),
        };
        info!(
            transactions = replay.transactions,
            torn,
            extents = replay.extents.len(),
            "activity log replayed"
        );
        Ok(replay)
    }

    /// Marks every active extent out of sync on `planes` (crash recovery).
    /// Returns the number of newly set bits.
    pub fn apply_to_bitmap(&self, planes: &[u32]) -> Result<u64, AlError> {
        let mut set = 0;
        if !self.updates_enabled {
            // without transactions nothing bounds the hot set
            let guard = self.bitmap.lock("activity log recovery", BmLockFlags::BULK, None);
            for &plane in planes {
                set += guard.set_all(plane).map_err(bm_err)?;
            }
            return Ok(set);
        }
        for enr in self.lru.numbers() {
            if let Some((first, last)) = self.extent_bits(enr) {
                for &plane in planes {
                    set += self.bitmap.set_bits(plane, first, last).map_err(bm_err)?;
                }
            }
        }
        info!(bits = set, "activity log applied to bitmap");
        Ok(set)
    }

    /// Changes the number of slots. Only while no extent is pinned.
    /// Extents that no longer fit are marked out of sync on every plane.
    pub fn resize(&mut self, extents: usize) -> Result<(), AlError> {
        if self.lru.used() > 0 || self.lru.has_pending() {
            return Err(AlError::NotIdle(self.lru.used()));
        }
        let extents = extents.clamp(1, AL_MAX_EXTENTS);
        let old = self.lru.numbers();
        let mut lru = LruCache::new(extents, AL_UPDATES_PER_TRANSACTION);
        let planes: Vec<u32> = (0..self.bitmap.planes()).collect();
        for (slot, enr) in old.iter().enumerate() {
            if slot < extents {
                lru.set(slot, Some(*enr));
            } else {
                self.mark_evicted(*enr, &planes)?;
            }
        }
        self.lru = lru;
        self.context_start = 0;
        if self.updates_enabled {
            self.write_transaction(AL_TR_UPDATE)?;
        }
        info!(extents, "activity log resized");
        Ok(())
    }

    /// Stops journaling; only already active extents may be used.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Allows journaling again.
    pub fn resume(&mut self) {
        self.suspended = false;
    }

    /// Whether journaling is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Extents in the log.
    pub fn extents(&self) -> Vec<u64> {
        self.lru.numbers()
    }

    /// Whether `enr` is pinned.
    pub fn is_active(&self, enr: u64) -> bool {
        self.lru.find(enr).map(|e| e.refcnt > 0).unwrap_or(false)
    }

    /// Pinned extents.
    pub fn used(&self) -> usize {
        self.lru.used()
    }

    /// Slots.
    pub fn capacity(&self) -> usize {
        self.lru.capacity()
    }

    /// Transactions written since creation.
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    /// Next transaction number.
    pub fn tr_number(&self) -> u32 {
        self.tr_number
    }

    /// Cache counters.
    pub fn stats(&self) -> LruStats {
        self.lru.stats()
    }

    fn al_busy_in(&self, bm_enr: u64) -> bool {
        self.lru.iter().any(|(_, el)| {
            el.refcnt > 0
                && el
                    .new_number
                    .or(el.number)
                    .map(|n| n / AL_EXT_PER_BM_EXT == bm_enr)
                    .unwrap_or(false)
        })
    }

    /// Locks the resync extent of `sector` on `plane` for one resync
    /// request. Fails with `ResyncLocked` while application writes are
    /// active in it; new application writes are refused from then on.
    pub fn try_rs_begin_io(&mut self, plane: u32, sector: u64) -> Result<(), AlError> {
        let enr = sect_to_bm_ext(sector);
        let busy = self.al_busy_in(enr);
        let weight = self.bitmap.extent_weight(plane, enr);
        let cache = self
            .resync
            .get_mut(plane as usize)
            .ok_or_else(|| AlError::Corrupt(format!("no resync cache for plane {}", plane)))?;
        match cache.get(enr) {
            LruGet::Hit(_) => {}
            LruGet::Changed { .. } => {
                cache.committed();
                if let Some(el) = cache.find_mut(enr) {
                    el.payload.rs_left = weight;
                }
            }
            LruGet::Starving | LruGet::TooManyPending | LruGet::Locked => {
                return Err(AlError::NoFreeSlot(cache.capacity()));
            }
        }
        let Some(el) = cache.find_mut(enr) else {
            return Err(AlError::NoFreeSlot(cache.capacity()));
        };
        if busy {
            el.payload.flags |= BME_NO_WRITES;
            cache.put(enr);
            return Err(AlError::ResyncLocked { enr });
        }
        el.payload.flags |= BME_NO_WRITES | BME_LOCKED;
        Ok(())
    }

    /// Ends one resync request on the extent of `sector`.
    pub fn rs_complete_io(&mut self, plane: u32, sector: u64) {
        let enr = sect_to_bm_ext(sector);
        let weight = self.bitmap.extent_weight(plane, enr);
        let Some(cache) = self.resync.get_mut(plane as usize) else {
            return;
        };
        if cache.put(enr) == Some(0) {
            if let Some(el) = cache.find_mut(enr) {
                el.payload.flags = 0;
                el.payload.rs_left = weight;
            }
        }
    }

    /// Accounts `bits` failed resync bits to the extent of `sector`.
    pub fn rs_failed_io(&mut self, plane: u32, sector: u64, bits: u32) {
        let enr = sect_to_bm_ext(sector);
        if let Some(el) = self
            .resync
            .get_mut(plane as usize)
            .and_then(|cache| cache.find_mut(enr))
        {
            el.payload.rs_failed += bits;
        }
    }

    /// Drops every resync lock of `plane`.
    pub fn rs_cancel_all(&mut self, plane: u32) {
        if let Some(cache) = self.resync.get_mut(plane as usize) {
            if cache.used() > 0 {
                warn!(plane, locked = cache.used(), "cancelling resync extent locks");
            }
            cache.reset();
        }
    }

    /// Resync bookkeeping of bitmap extent `enr`.
    pub fn rs_extent(&self, plane: u32, enr: u64) -> Option<BmExtent> {
        self.resync
            .get(plane as usize)
            .and_then(|cache| cache.find(enr))
            .map(|el| el.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapStore;
    use crate::types::{al_ext_to_sect, AL_SECT_PER_EXT};
    use blkmirror_meta::{MemMetaIo, Placement};

    const SECTORS: u64 = 1 << 20;

    fn setup(extents: usize, planes: u32) -> (ActivityLog, Arc<Bitmap>, Arc<MemMetaIo>, MetaLayout) {
        let layout = MetaLayout::compute(SECTORS, planes, 4, Placement::External { start_sector: 0 }).unwrap();
        let meta = Arc::new(MemMetaIo::new(layout.md_size_sectors()));
        let bitmap = Arc::new(Bitmap::new(
            SECTORS / 8,
            planes,
            Some(BitmapStore {
                meta: meta.clone(),
                layout: layout.clone(),
            }),
        ));
        let al = ActivityLog::new(
            extents,
            bitmap.clone(),
            Some(AlStore {
                meta: meta.clone(),
                layout: layout.clone(),
            }),
            4,
            true,
        );
        (al, bitmap, meta, layout)
    }

    fn reopen(bitmap: Arc<Bitmap>, meta: Arc<MemMetaIo>, layout: MetaLayout, extents: usize) -> ActivityLog {
        ActivityLog::new(extents, bitmap, Some(AlStore { meta, layout }), 4, true)
    }

    fn ext(enr: u64) -> SectorSpan {
        SectorSpan::new(al_ext_to_sect(enr), 8)
    }

    #[test]
    fn test_transaction_encode_decode() {
        let tr = AlTransaction {
            tr_number: 42,
            tr_type: AL_TR_UPDATE,
            updates: vec![(3, 17), (4, LC_FREE)],
            context_start: 2,
            context: vec![1, 2, LC_FREE],
        };
        let block = tr.encode();
        assert_eq!(block.len(), MD_BLOCK_SIZE);
        assert_eq!(&block[0..4], &AL_TR_MAGIC.to_be_bytes());
        assert_eq!(AlTransaction::decode(&block).unwrap(), tr);
    }

    #[test]
    fn test_transaction_checksum_detects_damage() {
        let mut block = AlTransaction {
            tr_number: 1,
            tr_type: AL_TR_UPDATE,
            updates: vec![],
            context_start: 0,
            context: vec![5],
        }
        .encode();
        block[OFF_CONTEXT] ^= 0xff;
        assert!(matches!(AlTransaction::decode(&block), Err(AlError::Corrupt(_))));
        assert!(matches!(AlTransaction::decode(&[0u8; MD_BLOCK_SIZE]), Err(AlError::Corrupt(_))));
    }

    #[test]
    fn test_begin_and_complete() {
        let (mut al, _, _, _) = setup(8, 1);
        al.initialize().unwrap();
        let span = SectorSpan::new(AL_SECT_PER_EXT - 4, 8);
        al.begin_io(span, &[]).unwrap();
        assert!(al.is_active(0));
        assert!(al.is_active(1));
        assert_eq!(al.used(), 2);
        al.complete_io(span);
        assert_eq!(al.used(), 0);
        assert_eq!(al.extents(), vec![0, 1]);
        // hot extents take the fast path
        assert!(al.begin_io_fastpath(span));
        al.complete_io(span);
        assert!(!al.begin_io_fastpath(ext(5)));
        assert_eq!(al.used(), 0);
    }

    #[test]
    fn test_eviction_marks_range_before_reuse() {
        let n = 4;
        let (mut al, bitmap, _, _) = setup(n, 1);
        al.initialize().unwrap();
        for enr in 0..n as u64 {
            al.begin_io(ext(enr), &[0]).unwrap();
            al.complete_io(ext(enr));
        }
        assert_eq!(bitmap.total_weight(0), 0);
        al.begin_io(ext(n as u64), &[0]).unwrap();
        // exactly the least recently used extent went out
        assert_eq!(al.extents(), vec![1, 2, 3, 4]);
        assert_eq!(bitmap.total_weight(0), AL_BITS_PER_EXT);
        assert_eq!(bitmap.count_bits(0, 0, AL_BITS_PER_EXT - 1).unwrap(), AL_BITS_PER_EXT);
        assert_eq!(bitmap.dirty_pages(), 0);
    }

    #[test]
    fn test_eviction_spares_replicated_peers() {
        let (mut al, bitmap, _, _) = setup(1, 2);
        al.initialize().unwrap();
        al.begin_io(ext(0), &[1]).unwrap();
        al.complete_io(ext(0));
        al.begin_io(ext(1), &[1]).unwrap();
        assert_eq!(bitmap.total_weight(0), 0);
        assert_eq!(bitmap.total_weight(1), AL_BITS_PER_EXT);
    }

    #[test]
    fn test_full_log_reports_no_free_slot() {
        let (mut al, _, _, _) = setup(2, 1);
        al.initialize().unwrap();
        al.begin_io(ext(0), &[]).unwrap();
        al.begin_io(ext(1), &[]).unwrap();
        assert!(matches!(al.begin_io(ext(2), &[]), Err(AlError::NoFreeSlot(2))));
        assert_eq!(al.used(), 2);
        al.complete_io(ext(0));
        al.begin_io(ext(2), &[]).unwrap();
        assert_eq!(al.extents(), vec![1, 2]);
    }

    #[test]
    fn test_replay_after_crash() {
        let (mut al, bitmap, meta, layout) = setup(8, 1);
        al.initialize().unwrap();
        for enr in [3u64, 9, 12] {
            al.begin_io(ext(enr), &[]).unwrap();
        }
        // crash: nothing completed, nothing flushed
        drop(al);
        let mut al = reopen(bitmap.clone(), meta, layout, 8);
        let replay = al.read_log().unwrap();
        assert_eq!(replay.extents, vec![3, 9, 12]);
        assert_eq!(replay.torn, 0);
        let set = al.apply_to_bitmap(&[0]).unwrap();
        assert_eq!(set, 3 * AL_BITS_PER_EXT);
        assert!(bitmap.test_bit(0, 9 * AL_BITS_PER_EXT).unwrap());
        // four formatting transactions, three updates; replay continues after them
        assert_eq!(replay.transactions, 4);
        assert_eq!(al.tr_number(), 7);
        al.begin_io(ext(20), &[]).unwrap();
        assert_eq!(al.tr_number(), 8);
    }

    #[test]
    fn test_replay_tolerates_one_torn_block() {
        let (mut al, bitmap, meta, layout) = setup(8, 1);
        al.initialize().unwrap();
        al.begin_io(ext(1), &[]).unwrap();
        al.begin_io(ext(2), &[]).unwrap();
        // the newest transaction sits in block (4 init + 2 updates - 1) % 4
        meta.corrupt(layout.al_block_sector(1), 100, &[0xde, 0xad]);
        drop(al);
        let mut al = reopen(bitmap, meta, layout, 8);
        let replay = al.read_log().unwrap();
        assert_eq!(replay.torn, 1);
        assert_eq!(replay.extents, vec![1]);
    }

    #[test]
    fn test_replay_rejects_two_bad_blocks() {
        let (mut al, bitmap, meta, layout) = setup(8, 1);
        al.initialize().unwrap();
        meta.corrupt(layout.al_block_sector(0), 100, &[1]);
        meta.corrupt(layout.al_block_sector(2), 100, &[1]);
        drop(al);
        let mut al = reopen(bitmap, meta, layout, 8);
        assert!(matches!(al.read_log(), Err(AlError::Corrupt(_))));
    }

    #[test]
    fn test_replay_of_unformatted_ring_fails() {
        let (_, bitmap, meta, layout) = setup(8, 1);
        let mut al = reopen(bitmap, meta, layout, 8);
        assert!(matches!(al.read_log(), Err(AlError::Corrupt(_))));
    }

    #[test]
    fn test_meta_write_failure_rolls_back() {
        let (mut al, _, meta, _) = setup(8, 1);
        al.initialize().unwrap();
        meta.set_fail_writes(true);
        assert!(matches!(al.begin_io(ext(0), &[]), Err(AlError::Meta(_))));
        assert_eq!(al.used(), 0);
        assert!(al.extents().is_empty());
        meta.set_fail_writes(false);
        al.begin_io(ext(0), &[]).unwrap();
    }

    #[test]
    fn test_suspend_allows_only_hot_extents() {
        let (mut al, _, _, _) = setup(8, 1);
        al.initialize().unwrap();
        al.begin_io(ext(0), &[]).unwrap();
        al.complete_io(ext(0));
        al.suspend();
        assert!(al.is_suspended());
        al.begin_io(ext(0), &[]).unwrap();
        assert!(matches!(al.begin_io(ext(1), &[]), Err(AlError::Suspended)));
        al.resume();
        al.begin_io(ext(1), &[]).unwrap();
    }

    #[test]
    fn test_resize_requires_idle() {
        let (mut al, bitmap, _, _) = setup(4, 1);
        al.initialize().unwrap();
        for enr in 0..4 {
            al.begin_io(ext(enr), &[]).unwrap();
        }
        assert!(matches!(al.resize(2), Err(AlError::NotIdle(4))));
        for enr in 0..4 {
            al.complete_io(ext(enr));
        }
        al.resize(2).unwrap();
        assert_eq!(al.capacity(), 2);
        assert_eq!(al.extents(), vec![0, 1]);
        // extents 2 and 3 lost their protection
        assert_eq!(bitmap.total_weight(0), 2 * AL_BITS_PER_EXT);
    }

    #[test]
    fn test_resync_lock_excludes_application_writes() {
        let (mut al, _, _, _) = setup(8, 1);
        al.initialize().unwrap();
        al.try_rs_begin_io(0, 0).unwrap();
        let flags = al.rs_extent(0, 0).unwrap().flags;
        assert_eq!(flags, BME_NO_WRITES | BME_LOCKED);
        assert!(matches!(al.begin_io(ext(3), &[]), Err(AlError::ResyncLocked { enr: 0 })));
        // another bitmap extent is unaffected
        al.begin_io(ext(AL_EXT_PER_BM_EXT), &[]).unwrap();
        al.rs_complete_io(0, 0);
        assert_eq!(al.rs_extent(0, 0).unwrap().flags, 0);
        al.begin_io(ext(3), &[]).unwrap();
    }

    #[test]
    fn test_resync_waits_for_active_writes() {
        let (mut al, _, _, _) = setup(8, 1);
        al.initialize().unwrap();
        al.begin_io(ext(5), &[]).unwrap();
        assert!(matches!(al.try_rs_begin_io(0, 0), Err(AlError::ResyncLocked { enr: 0 })));
        // from now on no new writes enter the extent
        assert_eq!(al.rs_extent(0, 0).unwrap().flags, BME_NO_WRITES);
        assert!(matches!(al.begin_io(ext(6), &[]), Err(AlError::ResyncLocked { .. })));
        al.complete_io(ext(5));
        al.try_rs_begin_io(0, 0).unwrap();
        al.rs_failed_io(0, 0, 3);
        assert_eq!(al.rs_extent(0, 0).unwrap().rs_failed, 3);
        al.rs_cancel_all(0);
        assert!(al.rs_extent(0, 0).is_none());
        al.begin_io(ext(6), &[]).unwrap();
    }

    #[test]
    fn test_resync_extent_tracks_weight() {
        let (mut al, bitmap, _, _) = setup(8, 1);
        bitmap.set_bits(0, 10, 19).unwrap();
        al.try_rs_begin_io(0, 80).unwrap();
        assert_eq!(al.rs_extent(0, 0).unwrap().rs_left, 10);
        bitmap.clear_bits(0, 10, 14).unwrap();
        al.rs_complete_io(0, 80);
        assert_eq!(al.rs_extent(0, 0).unwrap().rs_left, 5);
    }

    #[test]
    fn test_without_updates_recovery_sets_everything() {
        let bitmap = Arc::new(Bitmap::new(SECTORS / 8, 1, None));
        let mut al = ActivityLog::new(8, bitmap.clone(), None, 4, false);
        al.begin_io(ext(0), &[]).unwrap();
        assert_eq!(al.transactions(), 0);
        al.apply_to_bitmap(&[0]).unwrap();
        assert_eq!(bitmap.total_weight(0), SECTORS / 8);
    }
}
