//! Transfer log: every in-flight application write, keyed by dagtag.
//!
//! A request carries one local slot and one slot per peer connection. Each
//! event moves one slot forward; the upstream completion is delivered when
//! the completion reference count (one for the local write, one per peer
//! that has to acknowledge) drops to zero, and the request leaves the log
//! once every slot is final. Peer slots become final on barrier ack
//! (`Durable`), on negative ack, or on connection loss.
//!
//! The sender side of the epoch/barrier mechanism also lives here: each
//! connection numbers its epochs, every replicated write joins the current
//! one, and a `Barrier` packet is queued after the last write of a closed
//! epoch. Barrier acks must arrive in order and carry the epoch size.
//!
//! The log performs no I/O. Every operation returns a [`TlOutcome`] listing
//! what the caller has to do once it dropped its lock: complete upstream
//! requests, update bitmap bits, release activity log extents.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{IoFailure, ReplError, ReplResult};
use crate::transport::Packet;
use crate::types::{ConnectionId, Protocol, SectorSpan, VolumeId, WriteOrdering};

/// Position of a write in the resource-wide write order.
pub type Dagtag = u64;

/// Upstream outcome of a request.
pub type IoResult = Result<(), IoFailure>;

/// Local disk slot of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSlot {
    /// No local disk.
    NotApplicable,
    /// Submitted to the lower device.
    Pending,
    /// Written.
    Completed,
    /// The lower device failed it.
    Failed,
}

impl LocalSlot {
    fn is_final(self) -> bool {
        self != LocalSlot::Pending
    }
}

/// State of a request towards one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    /// Peer not reachable; the range was marked out of sync.
    NotReplicated,
    /// Peer behind; only an `OutOfSync` notice is sent.
    OutOfSyncOnly,
    /// Waiting in the sender queue.
    Queued,
    /// Handed to the transport.
    Sent,
    /// Peer received it (protocol B ack).
    RecvAcked,
    /// Peer wrote it (protocol C ack).
    WriteAcked,
    /// Its epoch was barrier-acked.
    Durable,
    /// Peer failed the write.
    NegAcked,
    /// Connection lost before the peer confirmed.
    ConnectionLost,
}

impl PeerState {
    /// No further event changes this slot.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            PeerState::NotReplicated
                | PeerState::OutOfSyncOnly
                | PeerState::Durable
                | PeerState::NegAcked
                | PeerState::ConnectionLost
        )
    }

    /// The peer may have a copy that still needs a barrier ack.
    fn on_the_wire(self) -> bool {
        matches!(
            self,
            PeerState::Sent | PeerState::RecvAcked | PeerState::WriteAcked
        )
    }

    fn is_failure(self) -> bool {
        matches!(self, PeerState::NegAcked | PeerState::ConnectionLost)
    }
}

fn ack_point_reached(protocol: Protocol, state: PeerState) -> bool {
    match protocol {
        Protocol::A => state >= PeerState::Sent,
        Protocol::B => state >= PeerState::RecvAcked,
        Protocol::C => state >= PeerState::WriteAcked,
    }
}

/// One peer slot of a request.
#[derive(Debug, Clone)]
pub struct PeerSlot {
    /// The connection.
    pub conn: ConnectionId,
    /// Current state.
    pub state: PeerState,
    /// Sender epoch the write belongs to.
    pub epoch: u32,
    /// Replication protocol of the connection.
    pub protocol: Protocol,
    ref_held: bool,
    in_flight: bool,
    acked: bool,
    in_sync_done: bool,
}

/// How a new request treats one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPlan {
    /// Send the data with the given protocol.
    Replicate {
        /// The connection.
        conn: ConnectionId,
        /// Protocol.
        protocol: Protocol,
    },
    /// Record out of sync and tell the peer.
    OutOfSyncOnly {
        /// The connection.
        conn: ConnectionId,
    },
    /// Record out of sync.
    NotReplicated {
        /// The connection.
        conn: ConnectionId,
    },
}

/// A request to be added with [`TransferLog::insert`].
#[derive(Debug)]
pub struct NewRequest {
    /// The volume.
    pub volume: VolumeId,
    /// Sectors written.
    pub span: SectorSpan,
    /// Payload.
    pub data: Bytes,
    /// Written to a local disk (and covered by the activity log).
    pub local: bool,
    /// Per-peer treatment.
    pub peers: Vec<PeerPlan>,
    /// Close the epoch of every replicating connection after this write.
    pub barrier: bool,
    /// Receives the upstream result.
    pub waiter: Option<oneshot::Sender<IoResult>>,
}

/// A request in the transfer log.
#[derive(Debug)]
pub struct Request {
    dagtag: Dagtag,
    volume: VolumeId,
    span: SectorSpan,
    data: Bytes,
    local: LocalSlot,
    peers: Vec<PeerSlot>,
    completion_ref: u32,
    result: Option<IoResult>,
    waiter: Option<oneshot::Sender<IoResult>>,
}

impl Request {
    /// Dagtag.
    pub fn dagtag(&self) -> Dagtag {
        self.dagtag
    }

    /// The volume.
    pub fn volume(&self) -> VolumeId {
        self.volume
    }

    /// Sectors written.
    pub fn span(&self) -> SectorSpan {
        self.span
    }

    /// Local slot.
    pub fn local(&self) -> LocalSlot {
        self.local
    }

    /// Slot of `conn`.
    pub fn peer(&self, conn: ConnectionId) -> Option<&PeerSlot> {
        self.peers.iter().find(|p| p.conn == conn)
    }

    /// All peer slots.
    pub fn peers(&self) -> &[PeerSlot] {
        &self.peers
    }

    /// Outstanding completion references.
    pub fn completion_ref(&self) -> u32 {
        self.completion_ref
    }

    /// Upstream result, once delivered.
    pub fn result(&self) -> Option<&IoResult> {
        self.result.as_ref()
    }

    fn is_finished(&self) -> bool {
        self.completion_ref == 0 && self.local.is_final() && self.peers.iter().all(|p| p.state.is_final())
    }

    fn upstream_result(&self) -> IoResult {
        if self.local == LocalSlot::Completed || self.peers.iter().any(|p| p.acked) {
            return Ok(());
        }
        if let Some(p) = self.peers.iter().find(|p| p.state == PeerState::NegAcked) {
            return Err(IoFailure::Peer(p.conn));
        }
        if self.peers.iter().any(|p| p.state == PeerState::ConnectionLost) {
            return Err(IoFailure::ConnectionLost);
        }
        if self.local == LocalSlot::Failed {
            return Err(IoFailure::LocalDisk);
        }
        Err(IoFailure::NoUsableDisk)
    }
}

/// An event on one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    /// Local write finished.
    LocalCompletedOk,
    /// Local write failed.
    LocalCompletedError,
    /// Data handed to the transport.
    Sent(ConnectionId),
    /// Protocol B ack.
    RecvAcked(ConnectionId),
    /// Protocol C ack.
    WriteAcked(ConnectionId),
    /// Peer failed the write.
    NegAcked(ConnectionId),
    /// The epoch of the write was barrier-acked.
    BarrierAcked(ConnectionId),
    /// The connection went away.
    ConnectionLost(ConnectionId),
}

/// Bits to set or clear. `conn: None` means every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitsUpdate {
    /// The volume.
    pub volume: VolumeId,
    /// The peer, or all peers.
    pub conn: Option<ConnectionId>,
    /// Sectors.
    pub span: SectorSpan,
}

/// A request whose upstream completion is due.
#[derive(Debug)]
pub struct Completed {
    /// Dagtag.
    pub dagtag: Dagtag,
    /// The volume.
    pub volume: VolumeId,
    /// Sectors.
    pub span: SectorSpan,
    /// Result.
    pub result: IoResult,
    /// Where to deliver it.
    pub waiter: Option<oneshot::Sender<IoResult>>,
}

impl Completed {
    /// Delivers the result. A dropped handle is not an error.
    pub fn deliver(self) {
        if let Some(tx) = self.waiter {
            let _ = tx.send(self.result);
        }
    }
}

/// A request that left the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired {
    /// Dagtag.
    pub dagtag: Dagtag,
    /// The volume.
    pub volume: VolumeId,
    /// Sectors.
    pub span: SectorSpan,
    /// Holds activity log extents.
    pub local: bool,
}

/// Work for the caller after a transfer log operation.
#[derive(Debug, Default)]
pub struct TlOutcome {
    /// Upstream completions.
    pub completed: Vec<Completed>,
    /// Requests that left the log.
    pub retired: Vec<Retired>,
    /// Ranges to mark out of sync.
    pub out_of_sync: Vec<BitsUpdate>,
    /// Ranges confirmed identical on a peer.
    pub in_sync: Vec<BitsUpdate>,
    /// New peer-ack position.
    pub peer_ack: Option<Dagtag>,
}

impl TlOutcome {
    /// Appends `other`.
    pub fn merge(&mut self, other: TlOutcome) {
        self.completed.extend(other.completed);
        self.retired.extend(other.retired);
        self.out_of_sync.extend(other.out_of_sync);
        self.in_sync.extend(other.in_sync);
        if other.peer_ack.is_some() {
            self.peer_ack = other.peer_ack;
        }
    }

    /// Nothing to do.
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
            && self.retired.is_empty()
            && self.out_of_sync.is_empty()
            && self.in_sync.is_empty()
            && self.peer_ack.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendItem {
    Data(Dagtag),
    OutOfSync { volume: VolumeId, span: SectorSpan },
}

/// Sender position of one connection.
#[derive(Debug)]
struct Sender {
    current: u32,
    writes: u32,
    barrier_sent: u32,
    acked: u32,
    epoch_sizes: BTreeMap<u32, u32>,
    queue: VecDeque<SendItem>,
    in_flight_sectors: u64,
}

impl Default for Sender {
    fn default() -> Self {
        Self {
            current: 1,
            writes: 0,
            barrier_sent: 0,
            acked: 0,
            epoch_sizes: BTreeMap::new(),
            queue: VecDeque::new(),
            in_flight_sectors: 0,
        }
    }
}

impl Sender {
    fn close_epoch(&mut self) -> bool {
        if self.writes == 0 {
            return false;
        }
        self.epoch_sizes.insert(self.current, self.writes);
        self.current = self.current.wrapping_add(1);
        self.writes = 0;
        true
    }

    fn flush_barriers(&mut self, upto: u32, out: &mut Vec<Packet>) {
        while self.barrier_sent < upto {
            self.barrier_sent += 1;
            if self.epoch_sizes.contains_key(&self.barrier_sent) {
                out.push(Packet::Barrier { nr: self.barrier_sent });
            }
        }
    }
}

/// The transfer log of a resource.
#[derive(Debug)]
pub struct TransferLog {
    requests: BTreeMap<Dagtag, Request>,
    senders: BTreeMap<ConnectionId, Sender>,
    dagtag: Dagtag,
    write_ordering: WriteOrdering,
    max_epoch_size: u32,
    peer_acked: Dagtag,
    retired_ahead: BTreeSet<Dagtag>,
    touched: BTreeSet<Dagtag>,
}

impl TransferLog {
    /// Creates an empty log.
    pub fn new(write_ordering: WriteOrdering, max_epoch_size: u32) -> Self {
        Self {
            requests: BTreeMap::new(),
            senders: BTreeMap::new(),
            dagtag: 0,
            write_ordering,
            max_epoch_size: max_epoch_size.max(1),
            peer_acked: 0,
            retired_ahead: BTreeSet::new(),
            touched: BTreeSet::new(),
        }
    }

    /// Current write ordering policy.
    pub fn write_ordering(&self) -> WriteOrdering {
        self.write_ordering
    }

    /// Changes the write ordering policy.
    pub fn set_write_ordering(&mut self, wo: WriteOrdering) {
        self.write_ordering = wo;
        self.touched.extend(self.requests.keys().copied());
    }

    /// Dagtag of the newest request.
    pub fn current_dagtag(&self) -> Dagtag {
        self.dagtag
    }

    /// Adds a request, stamping it with the next dagtag.
    pub fn insert(&mut self, req: NewRequest) -> (Dagtag, TlOutcome) {
        self.dagtag += req.span.sectors.max(1);
        let dagtag = self.dagtag;
        let mut out = TlOutcome::default();
        let mut peers = Vec::with_capacity(req.peers.len());
        let mut completion_ref = u32::from(req.local);

        for plan in &req.peers {
            match *plan {
                PeerPlan::Replicate { conn, protocol } => {
                    let sender = self.senders.entry(conn).or_default();
                    sender.writes += 1;
                    sender.queue.push_back(SendItem::Data(dagtag));
                    completion_ref += 1;
                    peers.push(PeerSlot {
                        conn,
                        state: PeerState::Queued,
                        epoch: sender.current,
                        protocol,
                        ref_held: true,
                        in_flight: false,
                        acked: false,
                        in_sync_done: false,
                    });
                }
                PeerPlan::OutOfSyncOnly { conn } => {
                    let sender = self.senders.entry(conn).or_default();
                    sender.queue.push_back(SendItem::OutOfSync {
                        volume: req.volume,
                        span: req.span,
                    });
                    out.out_of_sync.push(BitsUpdate {
                        volume: req.volume,
                        conn: Some(conn),
                        span: req.span,
                    });
                    peers.push(Self::idle_slot(conn, PeerState::OutOfSyncOnly));
                }
                PeerPlan::NotReplicated { conn } => {
                    out.out_of_sync.push(BitsUpdate {
                        volume: req.volume,
                        conn: Some(conn),
                        span: req.span,
                    });
                    peers.push(Self::idle_slot(conn, PeerState::NotReplicated));
                }
            }
        }

        let request = Request {
            dagtag,
            volume: req.volume,
            span: req.span,
            data: req.data,
            local: if req.local {
                LocalSlot::Pending
            } else {
                LocalSlot::NotApplicable
            },
            peers,
            completion_ref,
            result: None,
            waiter: req.waiter,
        };
        trace!(dagtag, volume = %req.volume, sector = req.span.sector, sectors = req.span.sectors, "request added");
        self.requests.insert(dagtag, request);
        self.touched.insert(dagtag);

        for plan in &req.peers {
            if let PeerPlan::Replicate { conn, .. } = plan {
                let full = self.write_ordering.uses_barriers()
                    && self
                        .senders
                        .get(conn)
                        .map(|s| s.writes >= self.max_epoch_size)
                        .unwrap_or(false);
                if req.barrier || full {
                    self.close_epoch(*conn);
                }
            }
        }

        if completion_ref == 0 {
            self.complete(dagtag, &mut out);
        }
        self.try_retire(&mut out);
        (dagtag, out)
    }

    fn idle_slot(conn: ConnectionId, state: PeerState) -> PeerSlot {
        PeerSlot {
            conn,
            state,
            epoch: 0,
            protocol: Protocol::C,
            ref_held: false,
            in_flight: false,
            acked: false,
            in_sync_done: false,
        }
    }

    /// Closes the current epoch of `conn` if it has writes. Its barrier is
    /// queued behind the last of them.
    pub fn close_epoch(&mut self, conn: ConnectionId) -> bool {
        let Some(sender) = self.senders.get_mut(&conn) else {
            return false;
        };
        let closed = sender.close_epoch();
        if closed {
            debug!(conn = %conn, epoch = sender.current - 1, "epoch closed");
        }
        closed
    }

    /// Applies `event` to request `dagtag`.
    pub fn mod_request(&mut self, dagtag: Dagtag, event: RequestEvent) -> TlOutcome {
        let mut out = TlOutcome::default();
        self.apply(dagtag, event, &mut out);
        self.try_retire(&mut out);
        out
    }

    fn apply(&mut self, dagtag: Dagtag, event: RequestEvent, out: &mut TlOutcome) {
        self.touched.insert(dagtag);
        let Some(req) = self.requests.get_mut(&dagtag) else {
            debug!(dagtag, ?event, "event for unknown request");
            return;
        };
        let (volume, span) = (req.volume, req.span);
        let mut release = 0u32;

        match event {
            RequestEvent::LocalCompletedOk | RequestEvent::LocalCompletedError => {
                if req.local != LocalSlot::Pending {
                    debug!(dagtag, ?event, local = ?req.local, "unexpected local completion");
                    return;
                }
                if event == RequestEvent::LocalCompletedOk {
                    req.local = LocalSlot::Completed;
                    for slot in req.peers.iter_mut() {
                        if Self::confirms_in_sync(slot) {
                            slot.in_sync_done = true;
                            out.in_sync.push(BitsUpdate {
                                volume,
                                conn: Some(slot.conn),
                                span,
                            });
                        }
                    }
                } else {
                    req.local = LocalSlot::Failed;
                    out.out_of_sync.push(BitsUpdate {
                        volume,
                        conn: None,
                        span,
                    });
                }
                release += 1;
            }
            RequestEvent::Sent(conn)
            | RequestEvent::RecvAcked(conn)
            | RequestEvent::WriteAcked(conn)
            | RequestEvent::NegAcked(conn)
            | RequestEvent::BarrierAcked(conn)
            | RequestEvent::ConnectionLost(conn) => {
                let local_ok = req.local == LocalSlot::Completed;
                let Some(slot) = req.peers.iter_mut().find(|p| p.conn == conn) else {
                    debug!(dagtag, ?event, "event for a peer without a slot");
                    return;
                };
                let old = slot.state;
                let new = match event {
                    RequestEvent::Sent(_) if old == PeerState::Queued => PeerState::Sent,
                    RequestEvent::RecvAcked(_) if old == PeerState::Sent => PeerState::RecvAcked,
                    RequestEvent::WriteAcked(_) if matches!(old, PeerState::Sent | PeerState::RecvAcked) => {
                        PeerState::WriteAcked
                    }
                    RequestEvent::BarrierAcked(_) if old.on_the_wire() => PeerState::Durable,
                    RequestEvent::NegAcked(_) | RequestEvent::ConnectionLost(_) if !old.is_final() => {
                        if matches!(event, RequestEvent::NegAcked(_)) {
                            PeerState::NegAcked
                        } else {
                            PeerState::ConnectionLost
                        }
                    }
                    _ => {
                        debug!(dagtag, ?event, state = ?old, "ignoring event");
                        return;
                    }
                };
                slot.state = new;
                if new == PeerState::Sent {
                    slot.in_flight = true;
                    if let Some(s) = self.senders.get_mut(&conn) {
                        s.in_flight_sectors += span.sectors;
                    }
                }
                if new.is_final() && slot.in_flight {
                    slot.in_flight = false;
                    if let Some(s) = self.senders.get_mut(&conn) {
                        s.in_flight_sectors = s.in_flight_sectors.saturating_sub(span.sectors);
                    }
                }
                if new.is_failure() {
                    out.out_of_sync.push(BitsUpdate {
                        volume,
                        conn: Some(conn),
                        span,
                    });
                } else if ack_point_reached(slot.protocol, new) {
                    slot.acked = true;
                }
                if slot.ref_held && (new.is_final() || slot.acked) {
                    slot.ref_held = false;
                    release += 1;
                }
                if local_ok && Self::confirms_in_sync(slot) {
                    slot.in_sync_done = true;
                    out.in_sync.push(BitsUpdate {
                        volume,
                        conn: Some(conn),
                        span,
                    });
                }
                if !req.peers.iter().any(|p| p.state == PeerState::Queued) {
                    req.data = Bytes::new();
                }
                trace!(dagtag, conn = %conn, from = ?old, to = ?new, "peer slot changed");
            }
        }

        if release > 0 {
            req.completion_ref = req.completion_ref.saturating_sub(release);
            if req.completion_ref == 0 {
                self.complete(dagtag, out);
            }
        }
    }

    fn confirms_in_sync(slot: &PeerSlot) -> bool {
        !slot.in_sync_done && matches!(slot.state, PeerState::WriteAcked | PeerState::Durable)
    }

    fn complete(&mut self, dagtag: Dagtag, out: &mut TlOutcome) {
        let Some(req) = self.requests.get_mut(&dagtag) else {
            return;
        };
        if req.result.is_some() {
            return;
        }
        let result = req.upstream_result();
        if let Err(e) = &result {
            warn!(dagtag, volume = %req.volume, sector = req.span.sector, error = %e, "request failed");
        }
        req.result = Some(result.clone());
        out.completed.push(Completed {
            dagtag,
            volume: req.volume,
            span: req.span,
            result,
            waiter: req.waiter.take(),
        });
    }

    /// Retires finished requests. Only requests an event touched since the
    /// last call are looked at; strict ordering retires from the oldest and
    /// stops at the first unfinished one.
    fn try_retire(&mut self, out: &mut TlOutcome) {
        let touched = std::mem::take(&mut self.touched);
        let finished: Vec<Dagtag> = if self.write_ordering == WriteOrdering::Strict {
            if touched.is_empty() {
                return;
            }
            self.requests
                .iter()
                .take_while(|(_, r)| r.is_finished())
                .map(|(d, _)| *d)
                .collect()
        } else {
            touched
                .into_iter()
                .filter(|d| self.requests.get(d).map(Request::is_finished).unwrap_or(false))
                .collect()
        };
        if finished.is_empty() {
            return;
        }
        for dagtag in finished {
            if let Some(req) = self.requests.remove(&dagtag) {
                self.retired_ahead.insert(dagtag);
                out.retired.push(Retired {
                    dagtag,
                    volume: req.volume,
                    span: req.span,
                    local: req.local != LocalSlot::NotApplicable,
                });
            }
        }
        // everything older than the oldest remaining request is gone
        let front = self.requests.keys().next().copied().unwrap_or(Dagtag::MAX);
        let still_ahead = self.retired_ahead.split_off(&front);
        let upto = std::mem::replace(&mut self.retired_ahead, still_ahead).last().copied();
        if let Some(upto) = upto.filter(|d| *d > self.peer_acked) {
            self.peer_acked = upto;
            out.peer_ack = Some(upto);
        }
    }

    /// Hands queued writes of `conn` to the wire: returns the packets in
    /// send order, with `Barrier`s between epochs, and marks the writes
    /// sent.
    pub fn process_sender_queue(&mut self, conn: ConnectionId) -> (Vec<Packet>, TlOutcome) {
        let mut packets = Vec::new();
        let mut out = TlOutcome::default();
        loop {
            let Some(sender) = self.senders.get_mut(&conn) else {
                break;
            };
            let Some(item) = sender.queue.pop_front() else {
                let upto = sender.current - 1;
                sender.flush_barriers(upto, &mut packets);
                break;
            };
            match item {
                SendItem::OutOfSync { volume, span } => packets.push(Packet::OutOfSync {
                    volume,
                    sector: span.sector,
                    sectors: span.sectors,
                }),
                SendItem::Data(dagtag) => {
                    let Some(req) = self.requests.get(&dagtag) else {
                        continue;
                    };
                    let Some(slot) = req.peer(conn) else {
                        continue;
                    };
                    if slot.state != PeerState::Queued {
                        continue;
                    }
                    sender.flush_barriers(slot.epoch.saturating_sub(1), &mut packets);
                    packets.push(Packet::Data {
                        volume: req.volume,
                        dagtag,
                        sector: req.span.sector,
                        data: req.data.clone(),
                    });
                    self.apply(dagtag, RequestEvent::Sent(conn), &mut out);
                }
            }
        }
        self.try_retire(&mut out);
        (packets, out)
    }

    /// The sender of `conn` ran out of work: closes the current epoch and
    /// returns its barrier, so that the last writes get acknowledged.
    pub fn sender_idle(&mut self, conn: ConnectionId) -> Vec<Packet> {
        let mut packets = Vec::new();
        if let Some(sender) = self.senders.get_mut(&conn) {
            if sender.queue.is_empty() {
                sender.close_epoch();
                let upto = sender.current - 1;
                sender.flush_barriers(upto, &mut packets);
            }
        }
        packets
    }

    /// `BarrierAck { nr, set_size }` from `conn`: every write of epoch `nr`
    /// is durable on the peer.
    pub fn release(&mut self, conn: ConnectionId, nr: u32, set_size: u32) -> ReplResult<TlOutcome> {
        let protocol_error = |msg: String| ReplError::Protocol { conn, msg };
        let sender = self
            .senders
            .get_mut(&conn)
            .ok_or_else(|| protocol_error(format!("barrier ack {} without writes", nr)))?;
        if nr != sender.acked.wrapping_add(1) {
            return Err(protocol_error(format!(
                "barrier ack {} out of order, expected {}",
                nr,
                sender.acked.wrapping_add(1)
            )));
        }
        let expected = sender
            .epoch_sizes
            .get(&nr)
            .copied()
            .ok_or_else(|| protocol_error(format!("barrier ack {} for an epoch never sent", nr)))?;
        if expected != set_size {
            return Err(protocol_error(format!(
                "barrier ack {}: set size {} but {} writes were sent",
                nr, set_size, expected
            )));
        }
        sender.acked = nr;
        sender.epoch_sizes.remove(&nr);

        let members: Vec<Dagtag> = self
            .requests
            .iter()
            .filter(|(_, r)| {
                r.peer(conn)
                    .map(|p| p.epoch == nr && p.state.on_the_wire())
                    .unwrap_or(false)
            })
            .map(|(d, _)| *d)
            .collect();
        let mut out = TlOutcome::default();
        for dagtag in &members {
            self.apply(*dagtag, RequestEvent::BarrierAcked(conn), &mut out);
        }
        self.try_retire(&mut out);
        debug!(conn = %conn, nr, set_size, released = members.len(), "epoch released");
        Ok(out)
    }

    /// Connection `conn` was lost: every pending slot of it fails and its
    /// sender starts over.
    pub fn clear(&mut self, conn: ConnectionId) -> TlOutcome {
        let pending: Vec<Dagtag> = self
            .requests
            .iter()
            .filter(|(_, r)| r.peer(conn).map(|p| !p.state.is_final()).unwrap_or(false))
            .map(|(d, _)| *d)
            .collect();
        let mut out = TlOutcome::default();
        for dagtag in &pending {
            self.apply(*dagtag, RequestEvent::ConnectionLost(conn), &mut out);
        }
        self.senders.remove(&conn);
        self.try_retire(&mut out);
        debug!(conn = %conn, failed = pending.len(), "transfer log cleared");
        out
    }

    /// Looks up a request.
    pub fn get(&self, dagtag: Dagtag) -> Option<&Request> {
        self.requests.get(&dagtag)
    }

    /// Dagtags in the log, oldest first.
    pub fn dagtags(&self) -> Vec<Dagtag> {
        self.requests.keys().copied().collect()
    }

    /// Requests in the log.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// No requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Sectors sent on `conn` and not yet durable.
    pub fn in_flight_sectors(&self, conn: ConnectionId) -> u64 {
        self.senders.get(&conn).map(|s| s.in_flight_sectors).unwrap_or(0)
    }

    /// Items waiting in the sender queue of `conn`.
    pub fn queued(&self, conn: ConnectionId) -> usize {
        self.senders.get(&conn).map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Current sender epoch of `conn`.
    pub fn sender_epoch(&self, conn: ConnectionId) -> u32 {
        self.senders.get(&conn).map(|s| s.current).unwrap_or(1)
    }

    /// Newest barrier-acked epoch of `conn`.
    pub fn acked_epoch(&self, conn: ConnectionId) -> u32 {
        self.senders.get(&conn).map(|s| s.acked).unwrap_or(0)
    }

    /// Newest peer-ack position.
    pub fn peer_acked(&self) -> Dagtag {
        self.peer_acked
    }

    /// Requests with a pending slot on `conn`.
    pub fn pending_on(&self, conn: ConnectionId) -> usize {
        self.requests
            .values()
            .filter(|r| r.peer(conn).map(|p| !p.state.is_final()).unwrap_or(false))
            .count()
    }
}
