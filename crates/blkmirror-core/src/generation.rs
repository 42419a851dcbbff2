//! Data generation identifiers.
//!
//! Every volume carries the id of its current data generation, the
//! generation its out-of-sync bitmap started from and a short history. A
//! primary that writes without one of its peers starts a new generation;
//! comparing the ids at handshake time tells which side moved on, and two
//! sides that moved on from the same base have split brain.

use serde::{Deserialize, Serialize};

/// Current id of a freshly formatted volume.
pub const UUID_JUST_CREATED: u64 = 4;

/// Older generations remembered.
pub const HISTORY_LEN: usize = 2;

/// Generation ids of one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationIds {
    /// Current data generation.
    pub current: u64,
    /// Generation the bitmap tracks changes since; 0 when none.
    pub bitmap: u64,
    /// Older generations, newest first; 0 marks an empty slot.
    pub history: [u64; HISTORY_LEN],
}

impl GenerationIds {
    /// Ids of a freshly formatted volume.
    pub fn just_created() -> Self {
        Self {
            current: UUID_JUST_CREATED,
            ..Self::default()
        }
    }

    /// Starts generation `fresh`. The old current id becomes the bitmap
    /// base, or history when a base is already recorded.
    pub fn new_current(&mut self, fresh: u64) {
        if self.bitmap == 0 {
            self.bitmap = self.current;
        } else {
            self.push_history(self.current);
        }
        self.current = fresh;
    }

    /// The bitmap no longer tracks anything: its base moves to history.
    pub fn clear_bitmap(&mut self) {
        if self.bitmap != 0 {
            self.push_history(self.bitmap);
            self.bitmap = 0;
        }
    }

    /// A resync target caught up with `source`.
    pub fn adopt(&mut self, source: &GenerationIds) {
        if self.current != source.current {
            self.push_history(self.current);
        }
        self.current = source.current;
        self.bitmap = 0;
    }

    fn push_history(&mut self, id: u64) {
        if id == 0 || self.history.contains(&id) {
            return;
        }
        self.history.rotate_right(1);
        self.history[0] = id;
    }

    fn in_history(&self, id: u64) -> bool {
        id != 0 && self.history.contains(&id)
    }
}

/// How two sides' data relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOrder {
    /// Same generation; the bitmaps alone tell the differences.
    Same,
    /// The local side moved on. With `full` the bitmap does not cover the
    /// difference and every block is resynced.
    LocalNewer {
        /// Resync everything.
        full: bool,
    },
    /// The peer moved on.
    PeerNewer {
        /// Resync everything.
        full: bool,
    },
    /// Both moved on from a common generation.
    SplitBrain,
    /// No common generation at all.
    Unrelated,
}

/// A fresh generation id. Never 0 and never [`UUID_JUST_CREATED`].
pub fn fresh_id() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 && id != UUID_JUST_CREATED {
            return id;
        }
    }
}

/// Compares the local ids with the peer's.
pub fn compare(local: &GenerationIds, peer: &GenerationIds) -> GenerationOrder {
    if local.current == peer.current {
        return GenerationOrder::Same;
    }
    if peer.bitmap != 0 && peer.bitmap == local.current {
        return GenerationOrder::PeerNewer { full: false };
    }
    if local.bitmap != 0 && local.bitmap == peer.current {
        return GenerationOrder::LocalNewer { full: false };
    }
    if local.bitmap != 0 && local.bitmap == peer.bitmap {
        return GenerationOrder::SplitBrain;
    }
    if peer.in_history(local.current) {
        return GenerationOrder::PeerNewer { full: true };
    }
    if local.in_history(peer.current) {
        return GenerationOrder::LocalNewer { full: true };
    }
    if peer.current == UUID_JUST_CREATED {
        return GenerationOrder::LocalNewer { full: true };
    }
    if local.current == UUID_JUST_CREATED {
        return GenerationOrder::PeerNewer { full: true };
    }
    let local_base = [local.bitmap, local.history[0], local.history[1]];
    if [peer.bitmap, peer.history[0], peer.history[1]]
        .iter()
        .any(|id| *id != 0 && local_base.contains(id))
    {
        return GenerationOrder::SplitBrain;
    }
    GenerationOrder::Unrelated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_volumes_are_the_same() {
        let a = GenerationIds::just_created();
        assert_eq!(compare(&a, &a), GenerationOrder::Same);
    }

    #[test]
    fn test_one_side_moved_on() {
        let base = GenerationIds::just_created();
        let mut primary = base;
        primary.new_current(100);
        assert_eq!(primary.bitmap, UUID_JUST_CREATED);
        assert_eq!(compare(&primary, &base), GenerationOrder::LocalNewer { full: false });
        assert_eq!(compare(&base, &primary), GenerationOrder::PeerNewer { full: false });

        // a second disconnect keeps the bitmap base
        primary.new_current(200);
        assert_eq!(primary.bitmap, UUID_JUST_CREATED);
        assert_eq!(primary.history[0], 100);
        assert_eq!(compare(&base, &primary), GenerationOrder::PeerNewer { full: false });
    }

    #[test]
    fn test_both_moved_on_is_split_brain() {
        let base = GenerationIds::just_created();
        let mut a = base;
        let mut b = base;
        a.new_current(100);
        b.new_current(200);
        assert_eq!(compare(&a, &b), GenerationOrder::SplitBrain);
        assert_eq!(compare(&b, &a), GenerationOrder::SplitBrain);
    }

    #[test]
    fn test_resync_aligns_generations() {
        let mut target = GenerationIds::just_created();
        let mut source = target;
        source.new_current(100);
        target.adopt(&source);
        source.clear_bitmap();
        assert_eq!(compare(&source, &target), GenerationOrder::Same);
        assert_eq!(source.bitmap, 0);
        assert_eq!(source.history[0], UUID_JUST_CREATED);
    }

    #[test]
    fn test_history_match_needs_full_sync() {
        let mut old = GenerationIds::just_created();
        old.new_current(100);
        old.clear_bitmap();
        let mut newer = old;
        newer.new_current(200);
        newer.clear_bitmap();
        assert_eq!(compare(&newer, &old), GenerationOrder::LocalNewer { full: true });
    }

    #[test]
    fn test_unrelated_data() {
        let a = GenerationIds {
            current: 11,
            ..GenerationIds::default()
        };
        let b = GenerationIds {
            current: 22,
            ..GenerationIds::default()
        };
        assert_eq!(compare(&a, &b), GenerationOrder::Unrelated);
        assert_eq!(
            compare(&GenerationIds::just_created(), &a),
            GenerationOrder::PeerNewer { full: true }
        );
    }

    #[test]
    fn test_fresh_ids_avoid_reserved_values() {
        for _ in 0..64 {
            let id = fresh_id();
            assert!(id != 0 && id != UUID_JUST_CREATED);
        }
    }
}
