//! Application I/O and local completions.

use std::sync::atomic::Ordering;

use blkmirror_meta::digest;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use super::{AppRead, Device, Effects, Followup, LocalIo, Resource, ResourceInner, CONN_CONGESTED};
use crate::config::OnCongestion;
use crate::error::{AlError, IoFailure, ReplError, ReplResult};
use crate::lower::{IoToken, LowerOp, LowerResult};
use crate::state::{ChangeFlags, ConnState, DiskState, ReplState, Role, StateVector};
use crate::transfer_log::{Dagtag, IoResult, NewRequest, PeerPlan, RequestEvent, TlOutcome};
use crate::transport::Packet;
use crate::types::{ConnectionId, PeerDeviceId, Sector, SectorSpan, VolumeId, SECTOR_SIZE};

/// Flags of an application write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Flush/FUA semantics: the write closes the epoch of every connection.
    pub barrier: bool,
}

/// Outcome of an application read.
pub type ReadResult = Result<Bytes, IoFailure>;

/// A submitted write.
#[derive(Debug)]
pub struct RequestHandle {
    dagtag: Dagtag,
    rx: oneshot::Receiver<IoResult>,
}

impl RequestHandle {
    /// Position of the write in the resource-wide write order.
    pub fn dagtag(&self) -> Dagtag {
        self.dagtag
    }

    /// Waits for the upstream completion.
    pub async fn wait(self) -> IoResult {
        self.rx.await.unwrap_or(Err(IoFailure::NoUsableDisk))
    }

    /// The completion, if already delivered.
    pub fn try_result(&mut self) -> Option<IoResult> {
        match self.rx.try_recv() {
            Ok(r) => Some(r),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(IoFailure::NoUsableDisk)),
        }
    }
}

/// A submitted read.
#[derive(Debug)]
pub struct ReadHandle {
    rx: oneshot::Receiver<ReadResult>,
}

impl ReadHandle {
    /// Waits for the data.
    pub async fn wait(self) -> ReadResult {
        self.rx.await.unwrap_or(Err(IoFailure::NoUsableDisk))
    }

    /// The data, if already delivered.
    pub fn try_result(&mut self) -> Option<ReadResult> {
        match self.rx.try_recv() {
            Ok(r) => Some(r),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(IoFailure::NoUsableDisk)),
        }
    }
}

/// How a new write treats the peer device `pd`.
fn peer_plan(states: &StateVector, pd: PeerDeviceId, protocol: crate::types::Protocol) -> PeerPlan {
    let conn = pd.conn;
    match states.repl(pd) {
        ReplState::Off | ReplState::Behind => PeerPlan::NotReplicated { conn },
        ReplState::Ahead | ReplState::StartingSyncS | ReplState::WfBitmapS => PeerPlan::OutOfSyncOnly { conn },
        _ if states.peer_disk(pd).is_usable() => PeerPlan::Replicate { conn, protocol },
        _ => PeerPlan::NotReplicated { conn },
    }
}

impl Resource {
    fn check_span(&self, device: &Device, sector: Sector, sectors: u64) -> ReplResult<SectorSpan> {
        if sectors == 0 {
            return Err(ReplError::InvalidRequest("empty request".to_string()));
        }
        if sectors * SECTOR_SIZE > self.config.net.max_bio_size {
            return Err(ReplError::InvalidRequest(format!(
                "{} sectors exceed the maximum request size of {} bytes",
                sectors, self.config.net.max_bio_size
            )));
        }
        let span = SectorSpan::new(sector, sectors);
        if span.end() > device.data_sectors {
            return Err(ReplError::InvalidRequest(format!(
                "{} beyond the end of {} ({} sectors)",
                span, device.volume, device.data_sectors
            )));
        }
        Ok(span)
    }

    /// Waits until application I/O on `device` is admitted. With `count`,
    /// takes an application request slot.
    async fn admit(&self, device: &Device, count: bool) -> ReplResult<()> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock();
                if inner.shutdown {
                    return Err(ReplError::Shutdown);
                }
                if inner.states.resource.role != Role::Primary {
                    return Err(ReplError::InvalidRequest("resource is not primary".to_string()));
                }
                let slots = !count || device.ap_bio_cnt() < self.config.disk.max_buffers;
                if inner.io_stable(device.volume) && slots {
                    if count {
                        device.ap_bio_cnt.fetch_add(1, Ordering::AcqRel);
                    }
                    return Ok(());
                }
            }
            trace!(volume = %device.volume, "waiting for admission");
            notified.await;
        }
    }

    /// Planes whose peers will not receive a write on `volume` right now.
    fn unreplicated_planes(&self, states: &StateVector, volume: VolumeId) -> Vec<u32> {
        self.connections
            .keys()
            .filter(|conn| {
                !matches!(
                    peer_plan(states, PeerDeviceId::new(**conn, volume), self.config.net.protocol),
                    PeerPlan::Replicate { .. }
                )
            })
            .map(|conn| self.plane_of(*conn))
            .collect()
    }

    /// Pins the activity log extents of `span` if the local disk is usable.
    /// Returns whether the write goes to the local disk.
    async fn al_begin(&self, device: &Device, span: SectorSpan) -> ReplResult<bool> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let unreplicated = {
                let inner = self.inner.lock();
                if inner.shutdown {
                    return Err(ReplError::Shutdown);
                }
                if !inner.states.disk(device.volume).is_usable() {
                    return Ok(false);
                }
                self.unreplicated_planes(&inner.states, device.volume)
            };
            let result = device.al.lock().begin_io(span, &unreplicated);
            match result {
                Ok(()) => return Ok(true),
                Err(
                    e @ (AlError::NoFreeSlot(_)
                    | AlError::ResyncLocked { .. }
                    | AlError::Suspended
                    | AlError::TooManyPending),
                ) => {
                    debug!(volume = %device.volume, span = %span, reason = %e, "write waits for the activity log");
                }
                Err(e) => {
                    error!(volume = %device.volume, error = %e, "activity log failed");
                    self.handle_meta_error(device.volume, &e.to_string());
                    return Ok(false);
                }
            }
            notified.await;
        }
    }

    /// Submits an application write.
    ///
    /// Waits for admission (role, I/O stability, free request slots), for
    /// the activity log and for conflicting requests in flight; then stamps
    /// the write with a dagtag and starts the local and the peer writes.
    /// The returned handle delivers the upstream completion.
    pub async fn submit_write(
        &self,
        volume: VolumeId,
        sector: Sector,
        data: Bytes,
        flags: WriteFlags,
    ) -> ReplResult<RequestHandle> {
        let device = self.device(volume)?.clone();
        if data.len() as u64 % SECTOR_SIZE != 0 {
            return Err(ReplError::InvalidRequest(format!(
                "write of {} bytes is not sector aligned",
                data.len()
            )));
        }
        let span = self.check_span(&device, sector, data.len() as u64 / SECTOR_SIZE)?;
        self.admit(&device, true).await?;

        let local = match self.al_begin(&device, span).await {
            Ok(local) => local,
            Err(e) => {
                device.ap_bio_cnt.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        let mut waiter = Some(tx);
        let mut fx = Effects::default();
        let result = loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                let busy = inner.write_iv.get(&volume).map(|s| s.overlaps(span)).unwrap_or(false)
                    || inner.read_iv.get(&volume).map(|s| s.overlaps(span)).unwrap_or(false);
                if !busy {
                    break self.start_write(&mut inner, &mut fx, &device, span, data.clone(), local, flags, waiter.take());
                }
            }
            trace!(volume = %volume, span = %span, "write waits for a conflicting request");
            notified.await;
        };
        self.run_effects(fx);
        let dagtag = result?;
        Ok(RequestHandle { dagtag, rx })
    }

    #[allow(clippy::too_many_arguments)]
    fn start_write(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        device: &Device,
        span: SectorSpan,
        data: Bytes,
        local: bool,
        flags: WriteFlags,
        waiter: Option<oneshot::Sender<IoResult>>,
    ) -> ReplResult<Dagtag> {
        let volume = device.volume;
        let peers: Vec<PeerPlan> = self
            .connections
            .keys()
            .map(|conn| peer_plan(&inner.states, PeerDeviceId::new(*conn, volume), self.config.net.protocol))
            .collect();
        let replicating: Vec<ConnectionId> = peers
            .iter()
            .filter_map(|p| match p {
                PeerPlan::Replicate { conn, .. } => Some(*conn),
                _ => None,
            })
            .collect();
        if !local && replicating.is_empty() {
            device.ap_bio_cnt.fetch_sub(1, Ordering::AcqRel);
            warn!(volume = %volume, span = %span, "write with neither local disk nor peer");
            return Err(IoFailure::NoUsableDisk.into());
        }

        let (dagtag, out) = inner.tl.insert(NewRequest {
            volume,
            span,
            data: data.clone(),
            local,
            peers,
            barrier: flags.barrier,
            waiter,
        });
        let id = inner.next_id();
        if let Some(set) = inner.write_iv.get_mut(&volume) {
            set.insert(id, span);
        }
        inner.write_ids.insert(dagtag, id);
        trace!(volume = %volume, span = %span, dagtag, local, peers = replicating.len(), "write started");

        if local {
            self.submit_lower(inner, fx, volume, span.sector, LowerOp::Write { data }, LocalIo::Write { dagtag, volume });
        }
        self.apply_tl_outcome(inner, out, fx);
        for conn in self.connection_ids() {
            self.process_sender(inner, conn, fx);
        }
        self.check_congestion(inner, fx);
        Ok(dagtag)
    }

    /// Hands the queued writes of `conn` to the outbound queue.
    pub(super) fn process_sender(&self, inner: &mut ResourceInner, conn: ConnectionId, fx: &mut Effects) {
        if inner.states.cstate(conn) != ConnState::Connected {
            return;
        }
        let (packets, out) = inner.tl.process_sender_queue(conn);
        for packet in packets {
            inner.queue(conn, packet);
        }
        self.apply_tl_outcome(inner, out, fx);
    }

    /// Applies the consequences of transfer log events.
    pub(super) fn apply_tl_outcome(&self, inner: &mut ResourceInner, out: TlOutcome, fx: &mut Effects) {
        for c in out.completed {
            if let Some(id) = inner.write_ids.remove(&c.dagtag) {
                if let Some(set) = inner.write_iv.get_mut(&c.volume) {
                    set.remove(id, c.span);
                }
            }
            if let Some(device) = self.devices.get(&c.volume) {
                device.ap_bio_cnt.fetch_sub(1, Ordering::AcqRel);
            }
            fx.completed.push(c);
        }
        for r in out.retired {
            if r.local {
                if let Some(device) = self.devices.get(&r.volume) {
                    device.al.lock().complete_io(r.span);
                }
            }
        }
        for b in out.out_of_sync {
            let Some(device) = self.devices.get(&b.volume) else {
                continue;
            };
            for plane in self.planes(b.conn) {
                if let Err(e) = device.bitmap.set_out_of_sync(plane, b.span) {
                    self.bitmap_failed(fx, b.volume, b.span, e);
                }
            }
        }
        for b in out.in_sync {
            let Some(device) = self.devices.get(&b.volume) else {
                continue;
            };
            for plane in self.planes(b.conn) {
                if let Err(e) = device.bitmap.set_in_sync(plane, b.span) {
                    self.bitmap_failed(fx, b.volume, b.span, e);
                }
            }
        }
        if let Some(dagtag) = out.peer_ack {
            for conn in self.connection_ids() {
                if inner.states.cstate(conn) == ConnState::Connected {
                    inner.queue(conn, Packet::PeerAck { dagtag });
                }
            }
        }
    }

    /// Switches congested connections to `Ahead`.
    fn check_congestion(&self, inner: &mut ResourceInner, fx: &mut Effects) {
        let net = &self.config.net;
        if net.on_congestion != OnCongestion::PullAhead || net.cong_fill_sectors == 0 {
            return;
        }
        for conn in self.connection_ids() {
            let in_flight = inner.tl.in_flight_sectors(conn);
            if in_flight <= net.cong_fill_sectors {
                continue;
            }
            let established: Vec<PeerDeviceId> = inner
                .states
                .peer_devices_of(conn)
                .filter(|(_, p)| p.repl == ReplState::Established)
                .map(|(pd, _)| *pd)
                .collect();
            if established.is_empty() {
                continue;
            }
            warn!(conn = %conn, in_flight, fill = net.cong_fill_sectors, "congested, pulling ahead");
            let changed = self.change_locked(inner, fx, ChangeFlags::NONE, |s| {
                for pd in &established {
                    if let Some(p) = s.peer_devices.get_mut(pd) {
                        p.repl = ReplState::Ahead;
                    }
                }
            });
            if changed.is_ok() {
                if let Some(c) = self.connections.get(&conn) {
                    c.set_flag(CONN_CONGESTED);
                }
            }
        }
    }

    /// Closes the current epoch of `conn`; its barrier follows the last
    /// write sent.
    pub fn close_epoch(&self, conn: ConnectionId) -> ReplResult<bool> {
        self.connection(conn)?;
        let mut fx = Effects::default();
        let closed = {
            let mut inner = self.inner.lock();
            let closed = inner.tl.close_epoch(conn);
            if closed {
                self.process_sender(&mut inner, conn, &mut fx);
            }
            closed
        };
        self.run_effects(fx);
        Ok(closed)
    }

    /// Sender idle pass: closes the open epoch of every connected peer so
    /// that its last writes get barrier-acknowledged.
    pub fn send_barriers(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            for conn in self.connection_ids() {
                if inner.states.cstate(conn) != ConnState::Connected {
                    continue;
                }
                self.process_sender(&mut inner, conn, &mut fx);
                for packet in inner.tl.sender_idle(conn) {
                    inner.queue(conn, packet);
                }
            }
        }
        self.run_effects(fx);
    }

    /// Submits an application read. Served locally when the local data is
    /// good, otherwise by an up-to-date peer.
    pub async fn submit_read(&self, volume: VolumeId, sector: Sector, sectors: u64) -> ReplResult<ReadHandle> {
        let device = self.device(volume)?.clone();
        let span = self.check_span(&device, sector, sectors)?;
        self.admit(&device, false).await?;

        let (tx, rx) = oneshot::channel();
        let mut waiter = Some(tx);
        let mut fx = Effects::default();
        let result = loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                let busy = inner.write_iv.get(&volume).map(|s| s.overlaps(span)).unwrap_or(false);
                if !busy {
                    break self.start_read(&mut inner, &mut fx, &device, span, waiter.take());
                }
            }
            notified.await;
        };
        self.run_effects(fx);
        result?;
        Ok(ReadHandle { rx })
    }

    /// An up-to-date connected peer to read `span` from.
    fn read_peer(&self, states: &StateVector, volume: VolumeId) -> Option<ConnectionId> {
        states
            .peer_devices
            .iter()
            .find(|(pd, p)| {
                pd.volume == volume
                    && states.cstate(pd.conn) == ConnState::Connected
                    && p.peer_disk == DiskState::UpToDate
                    && p.repl != ReplState::Off
            })
            .map(|(pd, _)| pd.conn)
    }

    fn start_read(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        device: &Device,
        span: SectorSpan,
        waiter: Option<oneshot::Sender<ReadResult>>,
    ) -> ReplResult<()> {
        let volume = device.volume;
        let disk = inner.states.disk(volume);
        let peer = self.read_peer(&inner.states, volume);
        let local = match (disk, peer) {
            (DiskState::UpToDate, _) => true,
            (d, Some(conn)) if d.is_usable() => {
                let (first, last) = span.bits();
                device
                    .bitmap
                    .count_bits(self.plane_of(conn), first, last)
                    .map(|n| n == 0)
                    .unwrap_or(false)
            }
            (DiskState::Consistent | DiskState::Outdated, None) => true,
            _ => false,
        };
        if !local && peer.is_none() {
            return Err(IoFailure::NoUsableDisk.into());
        }

        let id = inner.next_id();
        if let Some(set) = inner.read_iv.get_mut(&volume) {
            set.insert(id, span);
        }
        inner.reads.insert(
            id,
            AppRead {
                volume,
                span,
                iv: id,
                remote: None,
                waiter,
            },
        );
        if local {
            self.submit_lower(inner, fx, volume, span.sector, LowerOp::Read { sectors: span.sectors }, LocalIo::Read { id });
        } else if let Some(conn) = peer {
            self.read_remote(inner, id, conn);
        }
        Ok(())
    }

    fn read_remote(&self, inner: &mut ResourceInner, id: u64, conn: ConnectionId) {
        let Some(read) = inner.reads.get_mut(&id) else {
            return;
        };
        read.remote = Some(conn);
        let (volume, span) = (read.volume, read.span);
        debug!(conn = %conn, volume = %volume, span = %span, "reading from peer");
        inner.queue(
            conn,
            Packet::DataRequest {
                volume,
                id,
                sector: span.sector,
                sectors: span.sectors,
            },
        );
    }

    /// Delivers the outcome of application read `id`.
    pub(super) fn finish_read(&self, inner: &mut ResourceInner, id: u64, result: ReadResult, fx: &mut Effects) {
        let Some(read) = inner.reads.remove(&id) else {
            return;
        };
        if let Some(set) = inner.read_iv.get_mut(&read.volume) {
            set.remove(read.iv, read.span);
        }
        if let Some(tx) = read.waiter {
            fx.reads.push((tx, result));
        }
    }

    /// Completion of a local I/O issued by this resource.
    pub fn local_io_done(&self, token: IoToken, result: LowerResult) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            let Some(what) = inner.local_ios.remove(&token) else {
                warn!(token, "completion for an unknown local I/O");
                return;
            };
            let volume = what.volume(&inner.reads);
            if let Some(v) = volume {
                if let Some(device) = self.devices.get(&v) {
                    if device.local_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
                        fx.followups.push(Followup::DetachCheck(v));
                    }
                }
                if let Err(e) = &result {
                    warn!(volume = %v, token, error = %e, "local I/O error");
                    fx.followups.push(Followup::IoError(v));
                }
            }
            self.local_done_locked(&mut inner, what, result, &mut fx);
        }
        self.run_effects(fx);
    }

    fn local_done_locked(&self, inner: &mut ResourceInner, what: LocalIo, result: LowerResult, fx: &mut Effects) {
        let alg = self.config.net.digest;
        match what {
            LocalIo::Write { dagtag, .. } => {
                let event = if result.is_ok() {
                    RequestEvent::LocalCompletedOk
                } else {
                    RequestEvent::LocalCompletedError
                };
                let out = inner.tl.mod_request(dagtag, event);
                self.apply_tl_outcome(inner, out, fx);
            }
            LocalIo::Read { id } => match result {
                Ok(data) => self.finish_read(inner, id, Ok(data), fx),
                Err(_) => {
                    let volume = inner.reads.get(&id).map(|r| r.volume);
                    match volume.and_then(|v| self.read_peer(&inner.states, v)) {
                        Some(conn) => self.read_remote(inner, id, conn),
                        None => self.finish_read(inner, id, Err(IoFailure::LocalDisk), fx),
                    }
                }
            },
            LocalIo::PeerWrite {
                conn,
                volume,
                span,
                dagtag,
                epoch,
                iv,
            } => {
                if let Some(set) = inner.write_iv.get_mut(&volume) {
                    set.remove(iv, span);
                }
                match result {
                    Ok(_) => {
                        if let Some(device) = self.devices.get(&volume) {
                            if let Err(e) = device.bitmap.set_in_sync(self.plane_of(conn), span) {
                                self.bitmap_failed(fx, volume, span, e);
                            }
                        }
                        let protocol = inner.protocol_of(conn).unwrap_or(self.config.net.protocol);
                        if protocol == crate::types::Protocol::C {
                            inner.queue(conn, Packet::WriteAck { volume, dagtag });
                        }
                    }
                    Err(_) => inner.queue(conn, Packet::NegAck { volume, dagtag }),
                }
                if let Some(c) = self.connections.get(&conn) {
                    for ack in c.epochs.put(&epoch) {
                        inner.queue(
                            conn,
                            Packet::BarrierAck {
                                nr: ack.barrier_nr,
                                set_size: ack.set_size,
                            },
                        );
                    }
                }
            }
            LocalIo::PeerRead { conn, volume, id } => match result {
                Ok(data) => inner.queue(conn, Packet::DataReply { volume, id, data }),
                Err(_) => inner.queue(conn, Packet::NegDReply { volume, id }),
            },
            LocalIo::RsRead {
                conn,
                volume,
                span,
                csum,
            } => self.rs_read_done(inner, conn, volume, span, csum, result, fx),
            LocalIo::RsWrite { conn, volume, span } => self.rs_write_done(inner, conn, volume, span, result.is_ok()),
            LocalIo::CsumRead { conn, volume, span } => match result {
                Ok(data) => inner.queue(
                    conn,
                    Packet::CsumRsRequest {
                        volume,
                        sector: span.sector,
                        sectors: span.sectors,
                        digest: digest(alg, &data),
                    },
                ),
                Err(_) => inner.queue(
                    conn,
                    Packet::RsDataRequest {
                        volume,
                        sector: span.sector,
                        sectors: span.sectors,
                    },
                ),
            },
            LocalIo::OvRead {
                conn,
                volume,
                span,
                peer,
            } => self.ov_read_done(inner, conn, volume, span, peer, result, fx),
        }
    }
}
