//! Resync engine state: per-peer-device resync and verify runs.
//!
//! A resync run is target-driven. The target walks its bitmap plane for the
//! source, asks for one run of set bits at a time (never crossing a 128 MiB
//! resync extent), and clears bits as data arrives. The source answers
//! requests and clears its own bits when the target acknowledges the write.
//! The bookkeeping here holds no locks and performs no I/O; the resource
//! drives it from its tick.

pub mod controller;

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::config::ResyncConfig;
use crate::error::BitmapError;
use crate::types::{bit_to_bm_ext, Sector, SectorSpan, BM_BITS_PER_EXT, BM_BLOCK_SIZE};

pub use controller::{sectors_per_tick, should_slow_down, RateController};

/// Sync marks kept for the rate estimate.
pub const SYNC_MARKS: usize = 8;
/// Interval between sync marks.
pub const SYNC_MARK_STEP: Duration = Duration::from_secs(3);

/// A (time, bits left) sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMark {
    /// Bits still out of sync.
    pub left: u64,
    /// When the sample was taken.
    pub at: Instant,
}

/// Snapshot of a resync run for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncProgress {
    /// Bits out of sync when the run started.
    pub rs_total: u64,
    /// Bits still out of sync.
    pub rs_left: u64,
    /// Bits that failed.
    pub rs_failed: u64,
    /// Bits skipped because checksums matched.
    pub rs_same_csum: u64,
    /// Recent rate.
    pub rate_kib: u64,
    /// Estimated seconds to completion, if any progress was measured.
    pub eta_secs: Option<u64>,
    /// Currently paused.
    pub paused: bool,
}

/// One resync run of a peer device, either side.
#[derive(Debug, Clone)]
pub struct ResyncRun {
    /// Bits out of sync when the run started.
    pub rs_total: u64,
    /// Bits that could not be resynced.
    pub rs_failed: u64,
    /// Bits skipped because checksums matched.
    pub rs_same_csum: u64,
    /// Next bit the target scans from.
    pub cursor: u64,
    /// Rate controller of the target.
    pub controller: RateController,
    started: Instant,
    paused: Duration,
    paused_since: Option<Instant>,
    marks: VecDeque<SyncMark>,
    restarted: bool,
    in_flight: BTreeMap<Sector, u64>,
    in_flight_sectors: u64,
}

impl ResyncRun {
    /// Starts a run over `rs_total` set bits.
    pub fn new(rs_total: u64, cfg: &ResyncConfig, now: Instant) -> Self {
        let mut marks = VecDeque::with_capacity(SYNC_MARKS);
        marks.push_back(SyncMark { left: rs_total, at: now });
        Self {
            rs_total,
            rs_failed: 0,
            rs_same_csum: 0,
            cursor: 0,
            controller: RateController::new(cfg),
            started: now,
            paused: Duration::ZERO,
            paused_since: None,
            marks,
            restarted: false,
            in_flight: BTreeMap::new(),
            in_flight_sectors: 0,
        }
    }

    /// Stops the clock.
    pub fn pause(&mut self, now: Instant) {
        if self.paused_since.is_none() {
            self.paused_since = Some(now);
        }
    }

    /// Restarts the clock; marks taken before the pause are dropped.
    pub fn resume(&mut self, now: Instant, left: u64) {
        if let Some(since) = self.paused_since.take() {
            self.paused += now.saturating_duration_since(since);
            self.marks.clear();
            self.marks.push_back(SyncMark { left, at: now });
        }
    }

    /// Whether the clock is stopped.
    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    /// Run time without pauses.
    pub fn elapsed(&self, now: Instant) -> Duration {
        let paused = self.paused
            + self
                .paused_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default();
        now.saturating_duration_since(self.started).saturating_sub(paused)
    }

    /// Takes a sync mark if the last one is old enough.
    pub fn mark(&mut self, now: Instant, left: u64) {
        if self.is_paused() {
            return;
        }
        let due = self
            .marks
            .back()
            .map(|m| now.saturating_duration_since(m.at) >= SYNC_MARK_STEP)
            .unwrap_or(true);
        if due {
            self.marks.push_back(SyncMark { left, at: now });
            while self.marks.len() > SYNC_MARKS {
                self.marks.pop_front();
            }
        }
    }

    /// Rate over the window of sync marks, in KiB/s.
    pub fn rate_kib(&self, now: Instant, left: u64) -> u64 {
        let Some(oldest) = self.marks.front() else {
            return 0;
        };
        let ms = now.saturating_duration_since(oldest.at).as_millis() as u64;
        if ms == 0 {
            return 0;
        }
        let done_kib = oldest.left.saturating_sub(left) * (BM_BLOCK_SIZE / 1024);
        done_kib * 1000 / ms
    }

    /// Seconds until `left` bits are done at the current rate.
    pub fn eta_secs(&self, now: Instant, left: u64) -> Option<u64> {
        let rate = self.rate_kib(now, left);
        (rate > 0).then(|| left * (BM_BLOCK_SIZE / 1024) / rate)
    }

    /// Status snapshot.
    pub fn progress(&self, now: Instant, left: u64) -> ResyncProgress {
        ResyncProgress {
            rs_total: self.rs_total,
            rs_left: left,
            rs_failed: self.rs_failed,
            rs_same_csum: self.rs_same_csum,
            rate_kib: self.rate_kib(now, left),
            eta_secs: self.eta_secs(now, left),
            paused: self.is_paused(),
        }
    }

    /// Records an outstanding resync request.
    pub fn request(&mut self, span: SectorSpan) {
        if self.in_flight.insert(span.sector, span.sectors).is_none() {
            self.in_flight_sectors += span.sectors;
        }
    }

    /// Ends the outstanding request starting at `sector`; returns its length.
    pub fn complete(&mut self, sector: Sector) -> Option<u64> {
        let sectors = self.in_flight.remove(&sector)?;
        self.in_flight_sectors -= sectors;
        self.controller.completed(sectors);
        Some(sectors)
    }

    /// Whether a request starting at `sector` is outstanding.
    pub fn is_requested(&self, sector: Sector) -> bool {
        self.in_flight.contains_key(&sector)
    }

    /// Sectors requested and not yet completed.
    pub fn in_flight_sectors(&self) -> u64 {
        self.in_flight_sectors
    }

    /// Requests outstanding.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Starts scanning from the beginning again. Allowed once per run.
    pub fn restart(&mut self) -> bool {
        if self.restarted {
            return false;
        }
        self.restarted = true;
        self.cursor = 0;
        true
    }

    /// Forgets everything outstanding (connection loss).
    pub fn cancel(&mut self) {
        self.in_flight.clear();
        self.in_flight_sectors = 0;
    }
}

/// One online verify run, driving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRun {
    /// First sector.
    pub start: Sector,
    /// End sector (exclusive).
    pub stop: Sector,
    /// Next sector to request.
    pub position: Sector,
    /// Requests outstanding.
    pub in_flight: u64,
    /// Blocks compared.
    pub verified: u64,
    /// Blocks found to differ.
    pub out_of_sync: u64,
}

impl VerifyRun {
    /// Verifies `[start, stop)`.
    pub fn new(start: Sector, stop: Sector) -> Self {
        Self {
            start,
            stop,
            position: start,
            in_flight: 0,
            verified: 0,
            out_of_sync: 0,
        }
    }

    /// Next range of at most `max_sectors` to compare.
    pub fn next_request(&mut self, max_sectors: u64) -> Option<SectorSpan> {
        if self.position >= self.stop || max_sectors == 0 {
            return None;
        }
        let sectors = max_sectors.min(self.stop - self.position);
        let span = SectorSpan::new(self.position, sectors);
        self.position += sectors;
        self.in_flight += 1;
        Some(span)
    }

    /// Accounts one answer covering `blocks` blocks.
    pub fn record(&mut self, blocks: u64, in_sync: bool) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.verified += blocks;
        if !in_sync {
            self.out_of_sync += blocks;
        }
    }

    /// Everything requested and answered.
    pub fn is_done(&self) -> bool {
        self.position >= self.stop && self.in_flight == 0
    }
}

/// Finds the next run of set bits on `plane` at or after `from`: at most
/// `max_bits` long and within one resync extent. Returns `(first, count)`.
pub fn plan_request(
    bitmap: &Bitmap,
    plane: u32,
    from: u64,
    max_bits: u64,
) -> Result<Option<(u64, u64)>, BitmapError> {
    let bits = bitmap.bits();
    if from >= bits || max_bits == 0 {
        return Ok(None);
    }
    let Some(first) = bitmap.find_next(plane, from)? else {
        return Ok(None);
    };
    let extent_end = (bit_to_bm_ext(first) + 1) * BM_BITS_PER_EXT;
    let zero = bitmap.find_next_zero(plane, first)?.unwrap_or(bits);
    let end = zero.min(extent_end).min(first + max_bits).min(bits);
    Ok(Some((first, end - first)))
}
