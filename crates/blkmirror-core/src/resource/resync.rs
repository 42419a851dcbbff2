//! Resync and online verify.
//!
//! The sync target drives a resync: each tick it asks the rate controller
//! for a budget, scans its plane for the next runs of set bits, locks the
//! resync extent and requests the data (or, with checksums, sends the
//! digest of its own data first). The source answers from its disk. Bits
//! are cleared on both sides once the target wrote the block or the
//! checksums matched. The verify source walks the device and compares
//! digests with the peer.

use std::time::Instant;

use blkmirror_meta::{digest, Digest};
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{Device, Effects, LocalIo, Resource, ResourceInner};
use crate::bitmap::BmLockFlags;
use crate::error::{AlError, ReplError, ReplResult};
use crate::lower::{LowerOp, LowerResult};
use crate::resync::controller::sectors_per_tick;
use crate::resync::{plan_request, VerifyRun};
use crate::state::{ChangeFlags, DiskState, ReplState};
use crate::transport::Packet;
use crate::types::{bit_to_sect, ConnectionId, PeerDeviceId, Sector, SectorSpan, VolumeId, BM_SECT_PER_BIT, SECTOR_SIZE};

/// Blocks covered by `span`.
fn span_bits(span: SectorSpan) -> u64 {
    let (first, last) = span.bits();
    last - first + 1
}

/// Clears the bits of a resynced span. Resync spans start on a block
/// boundary; only the last block of the device may be short.
fn clear_resynced(device: &Device, plane: u32, span: SectorSpan) {
    let (first, last) = span.bits();
    if let Err(e) = device.bitmap.clear_bits(plane, first, last) {
        warn!(volume = %device.volume, span = %span, error = %e, "cannot clear resynced bits");
    }
}

/// Verify compares one 4 KiB block per request.
const OV_REQUEST_SECTORS: u64 = BM_SECT_PER_BIT;

enum TargetStep {
    Busy,
    Restart,
    Finished { clean: bool },
}

impl Resource {
    /// Periodic resync work: target requests, deferred source requests,
    /// verify requests and progress marks.
    pub fn resync_tick(&self, now: Instant) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            let pds: Vec<(PeerDeviceId, ReplState)> =
                inner.states.peer_devices.iter().map(|(pd, p)| (*pd, p.repl)).collect();
            for (pd, repl) in pds {
                match repl {
                    ReplState::SyncTarget => self.target_step(&mut inner, &mut fx, pd),
                    ReplState::SyncSource => self.retry_deferred(&mut inner, &mut fx, pd),
                    ReplState::VerifyS => self.verify_step(&mut inner, &mut fx, pd),
                    _ => {}
                }
                let Some(device) = self.devices.get(&pd.volume) else {
                    continue;
                };
                let left = device.bitmap.total_weight(self.plane_of(pd.conn));
                if let Some(run) = inner.pd(pd).resync.as_mut() {
                    run.mark(now, left);
                }
            }
        }
        self.run_effects(fx);
    }

    fn target_step(&self, inner: &mut ResourceInner, fx: &mut Effects, pd: PeerDeviceId) {
        let Some(device) = self.devices.get(&pd.volume).cloned() else {
            return;
        };
        let Some(mut run) = inner.pd(pd).resync.take() else {
            return;
        };
        let plane = self.plane_of(pd.conn);
        let max_bits = (self.config.net.max_bio_size / SECTOR_SIZE / BM_SECT_PER_BIT).max(1);
        let mut budget = run
            .controller
            .sectors_for_tick(&self.config.resync, run.in_flight_sectors());
        let mut scanned = false;
        while budget > 0 {
            let want = (budget / BM_SECT_PER_BIT).clamp(1, max_bits);
            let (first, count) = match plan_request(&device.bitmap, plane, run.cursor, want) {
                Ok(Some(p)) => p,
                Ok(None) => {
                    scanned = true;
                    break;
                }
                Err(e) => {
                    warn!(peer = %pd, error = %e, "resync scan failed");
                    break;
                }
            };
            let sector = bit_to_sect(first);
            if run.is_requested(sector) {
                run.cursor = first + count;
                continue;
            }
            let sectors = (count * BM_SECT_PER_BIT).min(device.data_sectors.saturating_sub(sector));
            if sectors == 0 {
                scanned = true;
                break;
            }
            let span = SectorSpan::new(sector, sectors);
            match device.al.lock().try_rs_begin_io(plane, sector) {
                Ok(()) => {}
                Err(e @ (AlError::ResyncLocked { .. } | AlError::NoFreeSlot(_))) => {
                    debug!(peer = %pd, span = %span, reason = %e, "resync waits for the extent");
                    break;
                }
                Err(e) => {
                    warn!(peer = %pd, span = %span, error = %e, "cannot lock resync extent");
                    break;
                }
            }
            run.request(span);
            run.cursor = first + count;
            budget = budget.saturating_sub(sectors);
            if self.config.net.csums {
                self.submit_lower(
                    inner,
                    fx,
                    pd.volume,
                    sector,
                    LowerOp::Read { sectors },
                    LocalIo::CsumRead {
                        conn: pd.conn,
                        volume: pd.volume,
                        span,
                    },
                );
            } else {
                inner.queue(
                    pd.conn,
                    Packet::RsDataRequest {
                        volume: pd.volume,
                        sector,
                        sectors,
                    },
                );
            }
        }

        let step = if !scanned || run.in_flight() > 0 {
            TargetStep::Busy
        } else {
            let left = device.bitmap.total_weight(plane);
            if left > 0 && run.rs_failed == 0 && run.restart() {
                TargetStep::Restart
            } else {
                TargetStep::Finished {
                    clean: left == 0 && run.rs_failed == 0,
                }
            }
        };
        inner.pd(pd).resync = Some(run);
        match step {
            TargetStep::Busy => {}
            TargetStep::Restart => debug!(peer = %pd, "bits left after the scan, rescanning"),
            TargetStep::Finished { clean } => {
                let result = self.change_locked(inner, fx, ChangeFlags::VERBOSE, |s| {
                    if let Some(p) = s.peer_devices.get_mut(&pd) {
                        p.repl = ReplState::Established;
                    }
                    if clean {
                        if let Some(d) = s.devices.get_mut(&pd.volume) {
                            d.disk = DiskState::UpToDate;
                        }
                    }
                });
                if let Err(e) = result {
                    warn!(peer = %pd, error = %e, "cannot finish resync");
                }
            }
        }
    }

    fn retry_deferred(&self, inner: &mut ResourceInner, fx: &mut Effects, pd: PeerDeviceId) {
        let deferred: Vec<Packet> = inner.pd(pd).deferred.drain(..).collect();
        for packet in deferred {
            let result = match packet {
                Packet::RsDataRequest { volume, sector, sectors } => {
                    self.handle_rs_request(inner, fx, pd.conn, volume, SectorSpan::new(sector, sectors), None)
                }
                Packet::CsumRsRequest {
                    volume,
                    sector,
                    sectors,
                    digest,
                } => self.handle_rs_request(inner, fx, pd.conn, volume, SectorSpan::new(sector, sectors), Some(digest)),
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(peer = %pd, error = %e, "deferred resync request failed");
            }
        }
    }

    fn verify_step(&self, inner: &mut ResourceInner, fx: &mut Effects, pd: PeerDeviceId) {
        let Some(mut verify) = inner.pd(pd).verify.take() else {
            return;
        };
        let mut budget = sectors_per_tick(self.config.resync.resync_rate_kib, self.config.resync.tick_ms);
        while budget >= OV_REQUEST_SECTORS {
            let Some(span) = verify.next_request(OV_REQUEST_SECTORS) else {
                break;
            };
            budget -= span.sectors;
            self.submit_lower(
                inner,
                fx,
                pd.volume,
                span.sector,
                LowerOp::Read { sectors: span.sectors },
                LocalIo::OvRead {
                    conn: pd.conn,
                    volume: pd.volume,
                    span,
                    peer: None,
                },
            );
        }
        let done = verify.is_done();
        inner.pd(pd).verify = Some(verify);
        if done {
            let result = self.change_locked(inner, fx, ChangeFlags::NONE, |s| {
                if let Some(p) = s.peer_devices.get_mut(&pd) {
                    p.repl = ReplState::Established;
                }
            });
            if let Err(e) = result {
                warn!(peer = %pd, error = %e, "cannot finish online verify");
            }
        }
    }

    /// Source side: the target asks for `span`.
    pub(super) fn handle_rs_request(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        csum: Option<Digest>,
    ) -> ReplResult<()> {
        let device = self.device(volume)?.clone();
        let pd = PeerDeviceId::new(conn, volume);
        let neg = Packet::NegRsDReply {
            volume,
            sector: span.sector,
            sectors: span.sectors,
        };
        if !inner.states.repl(pd).is_sync_source() || !inner.states.disk(volume).is_usable() {
            debug!(peer = %pd, span = %span, "resync request while not a source");
            inner.queue(conn, neg);
            return Ok(());
        }
        if span.sectors == 0 || span.end() > device.data_sectors {
            return Err(ReplError::Protocol {
                conn,
                msg: format!("resync request {} beyond the device", span),
            });
        }
        let plane = self.plane_of(conn);
        let locked = device.al.lock().try_rs_begin_io(plane, span.sector);
        match locked {
            Ok(()) => {
                self.submit_lower(
                    inner,
                    fx,
                    volume,
                    span.sector,
                    LowerOp::Read { sectors: span.sectors },
                    LocalIo::RsRead { conn, volume, span, csum },
                );
            }
            Err(AlError::ResyncLocked { .. } | AlError::NoFreeSlot(_)) => {
                let packet = match csum {
                    Some(digest) => Packet::CsumRsRequest {
                        volume,
                        sector: span.sector,
                        sectors: span.sectors,
                        digest,
                    },
                    None => Packet::RsDataRequest {
                        volume,
                        sector: span.sector,
                        sectors: span.sectors,
                    },
                };
                inner.pd(pd).deferred.push_back(packet);
            }
            Err(e) => {
                warn!(peer = %pd, span = %span, error = %e, "cannot serve resync request");
                inner.queue(conn, neg);
            }
        }
        Ok(())
    }

    /// Source side: the local read for a resync request finished.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn rs_read_done(
        &self,
        inner: &mut ResourceInner,
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        csum: Option<Digest>,
        result: LowerResult,
        _fx: &mut Effects,
    ) {
        let pd = PeerDeviceId::new(conn, volume);
        let Some(device) = self.devices.get(&volume).cloned() else {
            return;
        };
        if !inner.states.repl(pd).is_sync_source() {
            return;
        }
        let plane = self.plane_of(conn);
        let bits = span_bits(span);
        match result {
            Ok(data) => {
                let same = csum
                    .map(|peer| digest(peer.algorithm, &data) == peer)
                    .unwrap_or(false);
                if same {
                    clear_resynced(&device, plane, span);
                    if let Some(run) = inner.pd(pd).resync.as_mut() {
                        run.rs_same_csum += bits;
                    }
                    device.al.lock().rs_complete_io(plane, span.sector);
                    inner.queue(
                        conn,
                        Packet::RsIsInSync {
                            volume,
                            sector: span.sector,
                            sectors: span.sectors,
                        },
                    );
                } else {
                    inner.queue(
                        conn,
                        Packet::RsDataReply {
                            volume,
                            sector: span.sector,
                            data,
                        },
                    );
                }
            }
            Err(_) => {
                if let Some(run) = inner.pd(pd).resync.as_mut() {
                    run.rs_failed += bits;
                }
                {
                    let mut al = device.al.lock();
                    al.rs_failed_io(plane, span.sector, bits as u32);
                    al.rs_complete_io(plane, span.sector);
                }
                inner.queue(
                    conn,
                    Packet::NegRsDReply {
                        volume,
                        sector: span.sector,
                        sectors: span.sectors,
                    },
                );
            }
        }
    }

    /// Target side: resync data arrived.
    pub(super) fn receive_rs_data(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        conn: ConnectionId,
        volume: VolumeId,
        sector: Sector,
        data: Bytes,
    ) -> ReplResult<()> {
        let device = self.device(volume)?;
        let pd = PeerDeviceId::new(conn, volume);
        let span = SectorSpan::from_bytes(sector, data.len() as u64);
        let requested = inner
            .pds
            .get(&pd)
            .and_then(|rt| rt.resync.as_ref())
            .map(|run| run.is_requested(sector))
            .unwrap_or(false);
        if !inner.states.repl(pd).is_sync_target() || !requested {
            debug!(peer = %pd, span = %span, "unexpected resync data dropped");
            return Ok(());
        }
        if span.end() > device.data_sectors {
            return Err(ReplError::Protocol {
                conn,
                msg: format!("resync data {} beyond the device", span),
            });
        }
        self.submit_lower(inner, fx, volume, sector, LowerOp::Write { data }, LocalIo::RsWrite { conn, volume, span });
        Ok(())
    }

    /// Target side: the resync write finished.
    pub(super) fn rs_write_done(&self, inner: &mut ResourceInner, conn: ConnectionId, volume: VolumeId, span: SectorSpan, ok: bool) {
        let pd = PeerDeviceId::new(conn, volume);
        let Some(device) = self.devices.get(&volume).cloned() else {
            return;
        };
        if !inner.states.repl(pd).is_sync_target() {
            return;
        }
        let plane = self.plane_of(conn);
        let bits = span_bits(span);
        let ack = if ok {
            clear_resynced(&device, plane, span);
            Packet::RsWriteAck {
                volume,
                sector: span.sector,
                sectors: span.sectors,
            }
        } else {
            device.al.lock().rs_failed_io(plane, span.sector, bits as u32);
            Packet::RsNegAck {
                volume,
                sector: span.sector,
                sectors: span.sectors,
            }
        };
        if let Some(run) = inner.pd(pd).resync.as_mut() {
            if !ok {
                run.rs_failed += bits;
            }
            run.complete(span.sector);
        }
        device.al.lock().rs_complete_io(plane, span.sector);
        inner.queue(conn, ack);
    }

    /// Target side: the source answered without data, either because the
    /// checksums matched or because its read failed.
    pub(super) fn target_rs_done(
        &self,
        inner: &mut ResourceInner,
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        in_sync: bool,
    ) -> ReplResult<()> {
        let device = self.device(volume)?.clone();
        let pd = PeerDeviceId::new(conn, volume);
        if !inner.states.repl(pd).is_sync_target() {
            return Ok(());
        }
        let plane = self.plane_of(conn);
        let bits = span_bits(span);
        if in_sync {
            clear_resynced(&device, plane, span);
        } else {
            device.al.lock().rs_failed_io(plane, span.sector, bits as u32);
        }
        if let Some(run) = inner.pd(pd).resync.as_mut() {
            if in_sync {
                run.rs_same_csum += bits;
            } else {
                run.rs_failed += bits;
            }
            run.complete(span.sector);
        }
        device.al.lock().rs_complete_io(plane, span.sector);
        Ok(())
    }

    /// Source side: the target acknowledged (or failed) a resync write.
    pub(super) fn source_rs_acked(
        &self,
        inner: &mut ResourceInner,
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        ok: bool,
    ) -> ReplResult<()> {
        let device = self.device(volume)?.clone();
        let pd = PeerDeviceId::new(conn, volume);
        if !inner.states.repl(pd).is_sync_source() {
            return Ok(());
        }
        let plane = self.plane_of(conn);
        if ok {
            clear_resynced(&device, plane, span);
        } else {
            let bits = span_bits(span);
            if let Some(run) = inner.pd(pd).resync.as_mut() {
                run.rs_failed += bits;
            }
            device.al.lock().rs_failed_io(plane, span.sector, bits as u32);
        }
        device.al.lock().rs_complete_io(plane, span.sector);
        Ok(())
    }

    /// Verify target: compare our block with the peer's digest.
    pub(super) fn receive_ov_request(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        peer: Digest,
    ) -> ReplResult<()> {
        let device = self.device(volume)?;
        let pd = PeerDeviceId::new(conn, volume);
        if inner.states.repl(pd) != ReplState::VerifyT
            || !inner.states.disk(volume).is_usable()
            || span.end() > device.data_sectors
        {
            inner.queue(
                conn,
                Packet::OvReply {
                    volume,
                    sector: span.sector,
                    sectors: span.sectors,
                    in_sync: false,
                },
            );
            return Ok(());
        }
        self.submit_lower(
            inner,
            fx,
            volume,
            span.sector,
            LowerOp::Read { sectors: span.sectors },
            LocalIo::OvRead {
                conn,
                volume,
                span,
                peer: Some(peer),
            },
        );
        Ok(())
    }

    /// Verify source: the peer compared a block.
    pub(super) fn receive_ov_reply(
        &self,
        inner: &mut ResourceInner,
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        in_sync: bool,
    ) -> ReplResult<()> {
        let device = self.device(volume)?.clone();
        let pd = PeerDeviceId::new(conn, volume);
        let Some(verify) = inner.pd(pd).verify.as_mut() else {
            return Ok(());
        };
        verify.record(span_bits(span), in_sync);
        if !in_sync {
            device.bitmap.set_out_of_sync(self.plane_of(conn), span)?;
            info!(peer = %pd, span = %span, "online verify found a difference");
        }
        Ok(())
    }

    /// A local read for online verify finished. Without `peer` we are the
    /// verify source and send our digest; with it we answer the comparison.
    pub(super) fn ov_read_done(
        &self,
        inner: &mut ResourceInner,
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        peer: Option<Digest>,
        result: LowerResult,
        fx: &mut Effects,
    ) {
        let Some(device) = self.devices.get(&volume).cloned() else {
            return;
        };
        let pd = PeerDeviceId::new(conn, volume);
        let plane = self.plane_of(conn);
        match peer {
            None => {
                if inner.states.repl(pd) != ReplState::VerifyS {
                    return;
                }
                match result {
                    Ok(data) => inner.queue(
                        conn,
                        Packet::OvRequest {
                            volume,
                            sector: span.sector,
                            sectors: span.sectors,
                            digest: digest(self.config.net.digest, &data),
                        },
                    ),
                    Err(_) => {
                        if let Some(verify) = inner.pd(pd).verify.as_mut() {
                            verify.record(span_bits(span), false);
                        }
                        if let Err(e) = device.bitmap.set_out_of_sync(plane, span) {
                            self.bitmap_failed(fx, volume, span, e);
                        }
                    }
                }
            }
            Some(theirs) => {
                let in_sync = result
                    .map(|data| digest(theirs.algorithm, &data) == theirs)
                    .unwrap_or(false);
                if !in_sync {
                    if let Err(e) = device.bitmap.set_out_of_sync(plane, span) {
                        self.bitmap_failed(fx, volume, span, e);
                    }
                }
                inner.queue(
                    conn,
                    Packet::OvReply {
                        volume,
                        sector: span.sector,
                        sectors: span.sectors,
                        in_sync,
                    },
                );
            }
        }
    }

    /// Forces a full resync of `pd`: with `as_source` the peer's data is
    /// overwritten with ours, otherwise ours with the peer's.
    pub fn start_resync(&self, pd: PeerDeviceId, as_source: bool) -> ReplResult<()> {
        let device = self.device(pd.volume)?.clone();
        self.connection(pd.conn)?;
        let mut fx = Effects::default();
        let result = {
            let mut inner = self.inner.lock();
            let repl = inner.states.repl(pd);
            if repl != ReplState::Established {
                return Err(ReplError::InvalidRequest(format!(
                    "cannot start a resync of {} in {:?}",
                    pd, repl
                )));
            }
            let disk = inner.states.disk(pd.volume);
            if !disk.is_usable() {
                return Err(ReplError::InvalidRequest(format!(
                    "cannot resync {} with the local disk {:?}",
                    pd, disk
                )));
            }
            let (starting, exchange) = if as_source {
                (ReplState::StartingSyncS, ReplState::WfBitmapS)
            } else {
                (ReplState::StartingSyncT, ReplState::WfBitmapT)
            };
            info!(peer = %pd, as_source, "full resync requested");
            // the bitmap is only touched once the resync is committed
            (|| -> ReplResult<()> {
                self.change_locked(&mut inner, &mut fx, ChangeFlags::VERBOSE, |s| {
                    if let Some(p) = s.peer_devices.get_mut(&pd) {
                        p.repl = starting;
                    }
                })?;
                if inner.states.repl(pd) != starting {
                    return Err(ReplError::InvalidRequest(format!("resync of {} did not start", pd)));
                }
                let set = {
                    let guard = device.bitmap.lock("start resync", BmLockFlags::NONE, Some(pd.conn.0));
                    guard.set_all(self.plane_of(pd.conn))
                };
                if let Err(e) = set {
                    let back = self.change_locked(&mut inner, &mut fx, ChangeFlags::HARD, |s| {
                        if let Some(p) = s.peer_devices.get_mut(&pd) {
                            p.repl = ReplState::Established;
                        }
                    });
                    if let Err(back) = back {
                        warn!(peer = %pd, error = %back, "cannot abandon the resync");
                    }
                    return Err(e.into());
                }
                fx.flush_bitmap.insert(pd.volume);
                self.change_locked(&mut inner, &mut fx, ChangeFlags::VERBOSE, |s| {
                    if let Some(p) = s.peer_devices.get_mut(&pd) {
                        p.repl = exchange;
                    }
                })?;
                Ok(())
            })()
        };
        self.run_effects(fx);
        result?;
        Ok(())
    }

    /// Starts an online verify of `[start, stop)` (sectors) against the
    /// peer of `pd`. `stop` is clamped to the device.
    pub fn start_verify(&self, pd: PeerDeviceId, start: Sector, stop: Sector) -> ReplResult<()> {
        let device = self.device(pd.volume)?.clone();
        self.connection(pd.conn)?;
        let start = start - start % BM_SECT_PER_BIT;
        let stop = stop.min(device.data_sectors);
        if start >= stop {
            return Err(ReplError::InvalidRequest(format!("empty verify range {}..{}", start, stop)));
        }
        let mut fx = Effects::default();
        let result = {
            let mut inner = self.inner.lock();
            let repl = inner.states.repl(pd);
            if repl != ReplState::Established {
                return Err(ReplError::InvalidRequest(format!(
                    "cannot verify {} in {:?}",
                    pd, repl
                )));
            }
            let result = self.change_locked(&mut inner, &mut fx, ChangeFlags::VERBOSE, |s| {
                if let Some(p) = s.peer_devices.get_mut(&pd) {
                    p.repl = ReplState::VerifyS;
                }
            });
            if result.is_ok() {
                info!(peer = %pd, start, stop, "online verify started");
                inner.pd(pd).verify = Some(VerifyRun::new(start, stop));
            }
            result
        };
        self.run_effects(fx);
        result?;
        Ok(())
    }

    /// Pauses the resync of `pd` on user request.
    pub fn pause_resync(&self, pd: PeerDeviceId) -> ReplResult<()> {
        self.set_resync_susp_user(pd, true)
    }

    /// Resumes a resync paused with [`pause_resync`](Self::pause_resync).
    pub fn resume_resync(&self, pd: PeerDeviceId) -> ReplResult<()> {
        self.set_resync_susp_user(pd, false)
    }

    fn set_resync_susp_user(&self, pd: PeerDeviceId, on: bool) -> ReplResult<()> {
        self.device(pd.volume)?;
        self.connection(pd.conn)?;
        self.change(ChangeFlags::VERBOSE, |s| {
            if let Some(p) = s.peer_devices.get_mut(&pd) {
                p.resync_susp_user = on;
            }
        })?;
        Ok(())
    }
}
