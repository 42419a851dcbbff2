//! In-flight request ranges, for conflict detection.

use std::collections::BTreeMap;

use crate::types::{Sector, SectorSpan};

/// Identifies one interval in an [`IntervalSet`].
pub type IntervalId = u64;

/// Sector ranges of requests in flight on one device.
///
/// Keyed by `(start, id)`; the longest interval ever inserted bounds the
/// backwards scan of an overlap query.
#[derive(Debug, Default)]
pub struct IntervalSet {
    map: BTreeMap<(Sector, IntervalId), Sector>,
    max_len: u64,
}

impl IntervalSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `span` under `id`.
    pub fn insert(&mut self, id: IntervalId, span: SectorSpan) {
        self.max_len = self.max_len.max(span.sectors);
        self.map.insert((span.sector, id), span.end());
    }

    /// Removes the interval `id` starting at `span.sector`.
    pub fn remove(&mut self, id: IntervalId, span: SectorSpan) -> bool {
        self.map.remove(&(span.sector, id)).is_some()
    }

    /// Ids of intervals sharing at least one sector with `span`.
    pub fn conflicts(&self, span: SectorSpan) -> Vec<IntervalId> {
        if span.sectors == 0 {
            return Vec::new();
        }
        let from = span.sector.saturating_sub(self.max_len);
        self.map
            .range((from, 0)..(span.end(), 0))
            .filter(|((_, _), end)| **end > span.sector)
            .map(|((_, id), _)| *id)
            .collect()
    }

    /// Whether any interval overlaps `span`.
    pub fn overlaps(&self, span: SectorSpan) -> bool {
        !self.conflicts(span).is_empty()
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// No intervals.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_detection() {
        let mut set = IntervalSet::new();
        set.insert(1, SectorSpan::new(0, 8));
        set.insert(2, SectorSpan::new(100, 256));
        assert!(set.overlaps(SectorSpan::new(7, 1)));
        assert!(!set.overlaps(SectorSpan::new(8, 8)));
        assert_eq!(set.conflicts(SectorSpan::new(300, 8)), vec![2]);
        assert!(!set.overlaps(SectorSpan::new(356, 8)));
    }

    #[test]
    fn test_remove() {
        let mut set = IntervalSet::new();
        set.insert(1, SectorSpan::new(16, 8));
        set.insert(2, SectorSpan::new(16, 8));
        assert_eq!(set.len(), 2);
        assert!(set.remove(1, SectorSpan::new(16, 8)));
        assert!(!set.remove(1, SectorSpan::new(16, 8)));
        assert_eq!(set.conflicts(SectorSpan::new(20, 1)), vec![2]);
        assert!(set.remove(2, SectorSpan::new(16, 8)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_empty_span_never_conflicts() {
        let mut set = IntervalSet::new();
        set.insert(1, SectorSpan::new(0, 8));
        assert!(!set.overlaps(SectorSpan::new(4, 0)));
    }
}
