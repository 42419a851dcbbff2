//! Fixed-capacity, pin-counted element cache.
//!
//! Used by the activity log (one element per hot 4 MiB extent) and by the
//! per-peer resync extent caches. Each element owns a stable slot index,
//! which the activity log uses as its on-disk context slot. Replacing the
//! extent of a slot is a *change*: it stays pending until the caller
//! persisted it and called [`LruCache::committed`]. Pinned or pending
//! elements are never evicted.

use std::collections::HashMap;

/// Marker for a free slot in on-disk representations.
pub const LC_FREE: u32 = u32::MAX;

/// One cache element.
#[derive(Debug, Clone)]
pub struct LruElement<T> {
    /// Committed element number, `None` if free.
    pub number: Option<u64>,
    /// Number the slot is changing to, until committed.
    pub new_number: Option<u64>,
    /// Pin count.
    pub refcnt: u32,
    last_used: u64,
    /// Per-element payload.
    pub payload: T,
}

/// Result of [`LruCache::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LruGet {
    /// Already cached (committed or pending); pinned.
    Hit(usize),
    /// Slot reassigned to the requested number; pinned and pending.
    Changed {
        /// The slot.
        slot: usize,
        /// The number that was evicted from it, if any.
        evicted: Option<u64>,
    },
    /// Every element is pinned or pending.
    Starving,
    /// Too many uncommitted changes; commit first.
    TooManyPending,
    /// The cache is locked.
    Locked,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruStats {
    /// Lookups that found the element.
    pub hits: u64,
    /// Lookups that did not.
    pub misses: u64,
    /// Slot reassignments.
    pub changed: u64,
    /// Lookups that found no evictable element.
    pub starving: u64,
}

/// The cache.
#[derive(Debug, Clone)]
pub struct LruCache<T> {
    elements: Vec<LruElement<T>>,
    index: HashMap<u64, usize>,
    pending: Vec<usize>,
    max_pending: usize,
    used: usize,
    tick: u64,
    locked: bool,
    stats: LruStats,
}

impl<T: Default> LruCache<T> {
    /// Creates a cache of `capacity` free elements allowing up to
    /// `max_pending` uncommitted changes.
    pub fn new(capacity: usize, max_pending: usize) -> Self {
        let elements = (0..capacity)
            .map(|_| LruElement {
                number: None,
                new_number: None,
                refcnt: 0,
                last_used: 0,
                payload: T::default(),
            })
            .collect();
        Self {
            elements,
            index: HashMap::new(),
            pending: Vec::new(),
            max_pending: max_pending.max(1),
            used: 0,
            tick: 0,
            locked: false,
            stats: LruStats::default(),
        }
    }

    /// Pins the element for `number`, reassigning the least recently used
    /// unpinned slot on a miss.
    pub fn get(&mut self, number: u64) -> LruGet {
        self.tick += 1;
        if let Some(&slot) = self.index.get(&number) {
            self.stats.hits += 1;
            self.pin(slot);
            return LruGet::Hit(slot);
        }
        self.stats.misses += 1;
        if self.locked {
            return LruGet::Locked;
        }
        if self.pending.len() >= self.max_pending {
            return LruGet::TooManyPending;
        }
        let Some(slot) = self.victim() else {
            self.stats.starving += 1;
            return LruGet::Starving;
        };

        let el = &mut self.elements[slot];
        let evicted = el.number.take();
        if let Some(old) = evicted {
            self.index.remove(&old);
        }
        el.new_number = Some(number);
        el.payload = T::default();
        self.index.insert(number, slot);
        self.pending.push(slot);
        self.stats.changed += 1;
        self.pin(slot);
        LruGet::Changed { slot, evicted }
    }

    /// Pins `number` only if it is cached and committed.
    pub fn try_get(&mut self, number: u64) -> Option<usize> {
        let slot = *self.index.get(&number)?;
        if self.elements[slot].new_number.is_some() {
            return None;
        }
        self.tick += 1;
        self.stats.hits += 1;
        self.pin(slot);
        Some(slot)
    }

    fn pin(&mut self, slot: usize) {
        let el = &mut self.elements[slot];
        if el.refcnt == 0 {
            self.used += 1;
        }
        el.refcnt += 1;
        el.last_used = self.tick;
    }

    fn victim(&self) -> Option<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.refcnt == 0 && e.new_number.is_none())
            .min_by_key(|(_, e)| (e.number.is_some(), e.last_used))
            .map(|(i, _)| i)
    }

    /// Unpins `number`; returns the remaining pin count.
    pub fn put(&mut self, number: u64) -> Option<u32> {
        let slot = *self.index.get(&number)?;
        let el = &mut self.elements[slot];
        if el.refcnt == 0 {
            return Some(0);
        }
        el.refcnt -= 1;
        if el.refcnt == 0 {
            self.used -= 1;
        }
        Some(el.refcnt)
    }

    /// Uncommitted changes: `(slot, new number)`.
    pub fn pending_changes(&self) -> Vec<(usize, u64)> {
        self.pending
            .iter()
            .filter_map(|&slot| self.elements[slot].new_number.map(|n| (slot, n)))
            .collect()
    }

    /// Applies all pending changes.
    pub fn committed(&mut self) {
        for slot in self.pending.drain(..) {
            let el = &mut self.elements[slot];
            if let Some(n) = el.new_number.take() {
                el.number = Some(n);
            }
        }
    }

    /// Reverts a pending change of an unpinned slot, making it free.
    pub fn forget_pending(&mut self, number: u64) {
        let Some(&slot) = self.index.get(&number) else {
            return;
        };
        let el = &mut self.elements[slot];
        if el.new_number == Some(number) && el.refcnt == 0 {
            el.new_number = None;
            el.number = None;
            self.index.remove(&number);
            self.pending.retain(|s| *s != slot);
        }
    }

    /// Sets slot `slot` to `number` directly (log replay). Unpinned,
    /// committed. Out-of-range slots are ignored.
    pub fn set(&mut self, slot: usize, number: Option<u64>) {
        if slot >= self.elements.len() {
            return;
        }
        if let Some(old) = self.elements[slot].number.take() {
            self.index.remove(&old);
        }
        if let Some(n) = number {
            if let Some(prev) = self.index.insert(n, slot) {
                self.elements[prev].number = None;
            }
        }
        self.elements[slot].number = number;
    }

    /// Removes an unpinned element.
    pub fn del(&mut self, number: u64) -> bool {
        let Some(&slot) = self.index.get(&number) else {
            return false;
        };
        let el = &mut self.elements[slot];
        if el.refcnt > 0 || el.new_number.is_some() {
            return false;
        }
        el.number = None;
        el.payload = T::default();
        self.index.remove(&number);
        true
    }

    /// Looks up an element (committed or pending).
    pub fn find(&self, number: u64) -> Option<&LruElement<T>> {
        self.index.get(&number).map(|&slot| &self.elements[slot])
    }

    /// Mutable lookup.
    pub fn find_mut(&mut self, number: u64) -> Option<&mut LruElement<T>> {
        let slot = *self.index.get(&number)?;
        Some(&mut self.elements[slot])
    }

    /// Element by slot.
    pub fn slot(&self, slot: usize) -> Option<&LruElement<T>> {
        self.elements.get(slot)
    }

    /// Iterates `(slot, element)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &LruElement<T>)> {
        self.elements.iter().enumerate()
    }

    /// Iterates elements mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LruElement<T>> {
        self.elements.iter_mut()
    }

    /// Numbers of committed or pending elements.
    pub fn numbers(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.index.keys().copied().collect();
        v.sort_unstable();
        v
    }

    /// Capacity.
    pub fn capacity(&self) -> usize {
        self.elements.len()
    }

    /// Number of pinned elements.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Whether changes are pending.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Locks out new changes (hits still pin).
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Allows changes again.
    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Counters.
    pub fn stats(&self) -> LruStats {
        self.stats
    }

    /// Drops every element. Only valid while nothing is pinned.
    pub fn reset(&mut self) {
        for el in &mut self.elements {
            el.number = None;
            el.new_number = None;
            el.refcnt = 0;
            el.payload = T::default();
        }
        self.index.clear();
        self.pending.clear();
        self.used = 0;
    }
}
