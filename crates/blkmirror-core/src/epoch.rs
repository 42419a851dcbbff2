//! Receive-side epochs.
//!
//! Every replicated write received on a connection joins the newest epoch
//! of that connection. A `Barrier` packet closes the newest epoch (it now
//! has a barrier number) and opens a new one. An epoch is finished, and its
//! `BarrierAck` emitted, once it has a barrier number, no write of it is
//! still being written locally, and it is not the newest epoch. Epochs
//! finish strictly in order.
//!
//! Counters are atomics: local write completions decrement `active` without
//! taking any lock the state machine holds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

/// The epoch received a `Barrier`.
pub const EPOCH_CONTAINS_BARRIER: u32 = 0x1;
/// `barrier_nr` is valid.
pub const EPOCH_HAVE_BARRIER_NUMBER: u32 = 0x2;
/// The epoch is being finished; its ack is out.
pub const EPOCH_IS_FINISHING: u32 = 0x4;

/// One receive-side epoch.
#[derive(Debug)]
pub struct Epoch {
    id: u64,
    barrier_nr: AtomicU32,
    flags: AtomicU32,
    size: AtomicU32,
    active: AtomicU32,
}

impl Epoch {
    fn new(id: u64) -> Self {
        Self {
            id,
            barrier_nr: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            size: AtomicU32::new(0),
            active: AtomicU32::new(0),
        }
    }

    /// Local sequence number of the epoch.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Writes received in this epoch.
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Writes of this epoch still being written.
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// Flag word.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Barrier number, if received.
    pub fn barrier_nr(&self) -> Option<u32> {
        (self.flags() & EPOCH_HAVE_BARRIER_NUMBER != 0).then(|| self.barrier_nr.load(Ordering::Acquire))
    }
}

/// A finished epoch: send `BarrierAck { nr, set_size }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochAck {
    /// Barrier number.
    pub barrier_nr: u32,
    /// Writes in the epoch.
    pub set_size: u32,
}

/// The epochs of one connection, oldest first. Never empty.
#[derive(Debug)]
pub struct EpochChain {
    epochs: Mutex<VecDeque<Arc<Epoch>>>,
    next_id: AtomicU64,
    finished: AtomicU64,
}

impl Default for EpochChain {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochChain {
    /// Creates a chain holding one empty epoch.
    pub fn new() -> Self {
        let mut epochs = VecDeque::new();
        epochs.push_back(Arc::new(Epoch::new(0)));
        Self {
            epochs: Mutex::new(epochs),
            next_id: AtomicU64::new(1),
            finished: AtomicU64::new(0),
        }
    }

    /// The newest epoch.
    pub fn current(&self) -> Arc<Epoch> {
        let epochs = self.epochs.lock();
        match epochs.back() {
            Some(e) => e.clone(),
            None => Arc::new(Epoch::new(0)),
        }
    }

    /// Accounts a received write in the newest epoch and returns it; hand
    /// it back to [`put`](Self::put) when the local write is done.
    pub fn add_request(&self) -> Arc<Epoch> {
        let epoch = self.current();
        epoch.size.fetch_add(1, Ordering::AcqRel);
        epoch.active.fetch_add(1, Ordering::AcqRel);
        epoch
    }

    /// A local write of `epoch` finished.
    pub fn put(&self, epoch: &Epoch) -> Vec<EpochAck> {
        let prev = epoch.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "epoch active count underflow");
        self.may_finish()
    }

    /// `Barrier { nr }` received: closes the newest epoch and opens a new one.
    pub fn got_barrier(&self, nr: u32) -> Vec<EpochAck> {
        {
            let mut epochs = self.epochs.lock();
            if let Some(cur) = epochs.back() {
                cur.barrier_nr.store(nr, Ordering::Release);
                cur.flags
                    .fetch_or(EPOCH_CONTAINS_BARRIER | EPOCH_HAVE_BARRIER_NUMBER, Ordering::AcqRel);
                trace!(epoch = cur.id, nr, size = cur.size(), "barrier received");
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            epochs.push_back(Arc::new(Epoch::new(id)));
        }
        self.may_finish()
    }

    /// Finishes every leading epoch that is complete.
    pub fn may_finish(&self) -> Vec<EpochAck> {
        let mut acks = Vec::new();
        let mut epochs = self.epochs.lock();
        while epochs.len() > 1 {
            let Some(front) = epochs.front() else { break };
            let Some(nr) = front.barrier_nr() else { break };
            if front.active() != 0 {
                break;
            }
            front.flags.fetch_or(EPOCH_IS_FINISHING, Ordering::AcqRel);
            acks.push(EpochAck {
                barrier_nr: nr,
                set_size: front.size(),
            });
            epochs.pop_front();
            self.finished.fetch_add(1, Ordering::Relaxed);
        }
        acks
    }

    /// Drops every epoch (connection loss) and starts over with an empty
    /// one. Writes still in flight keep their epoch alive but will not be
    /// acknowledged. Returns the number of discarded epochs.
    pub fn cleanup(&self) -> usize {
        let mut epochs = self.epochs.lock();
        let dropped = epochs.len();
        epochs.clear();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        epochs.push_back(Arc::new(Epoch::new(id)));
        debug!(dropped, "receive epochs cleaned up");
        dropped
    }

    /// Number of epochs in the chain.
    pub fn len(&self) -> usize {
        self.epochs.lock().len()
    }

    /// Whether only the (empty or open) newest epoch remains.
    pub fn is_empty(&self) -> bool {
        let epochs = self.epochs.lock();
        epochs.len() == 1 && epochs.back().map(|e| e.size() == 0).unwrap_or(true)
    }

    /// Epochs acknowledged so far.
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }
}
