//! A replicated resource: its volumes, its connections and the request lock.
//!
//! [`Resource`] owns the committed [`StateVector`], the transfer log and, per
//! volume, the out-of-sync bitmap and the activity log. Every mutation
//! happens under the request lock. Collaborator calls (lower device submits,
//! transport sends, upstream completions, event publication) are collected
//! in an `Effects` batch while the lock is held and performed once it is
//! released, so neither collaborator ever runs under the lock.
//!
//! Entry points that complete work ([`Resource::local_io_done`],
//! [`Resource::receive`]) never wait. Entry points that admit new work
//! ([`Resource::submit_write`], [`Resource::submit_read`]) are async and
//! wait on the resource's notifier.

mod handshake;
mod receiver;
mod recovery;
mod resync;
mod state;
mod write;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use blkmirror_meta::{Digest, MetaIo, MetaLayout};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, info, trace, warn};

use crate::activity_log::{ActivityLog, AlStore};
use crate::bitmap::{Bitmap, BitmapStore};
use crate::config::{DeviceConfig, ResourceConfig};
use crate::epoch::{Epoch, EpochChain};
use crate::error::{BitmapError, ReplError, ReplResult};
use crate::events::{EventBus, StateEvent};
use crate::fencing::FencingPolicy;
use crate::generation::GenerationIds;
use crate::interval::{IntervalId, IntervalSet};
use crate::lower::{IoToken, LowerDevice, LowerIo, LowerOp};
use crate::resync::{ResyncProgress, ResyncRun, VerifyRun};
use crate::state::{
    ChangeFlags, ConnState, ConnStates, DeviceStates, DiskState, PeerDeviceStates, Role, StateChange,
    StateVector,
};
use crate::transfer_log::{Completed, Dagtag, TransferLog};
use crate::transport::{Packet, Transport, VolumeHandshake};
use crate::types::{ConnectionId, PeerDeviceId, Protocol, Sector, SectorSpan, VolumeId, BM_SECT_PER_BIT};

pub use handshake::{decide, SyncDecision, SyncSide};
pub use recovery::AttachOptions;
pub use write::{ReadHandle, ReadResult, RequestHandle, WriteFlags};

/// Connection flag: the sender is congested (Ahead).
pub const CONN_CONGESTED: u32 = 0x1;
/// Connection flag: a ping is outstanding.
pub const CONN_PING_SENT: u32 = 0x2;
/// Connection flag: our handshake went out.
pub const CONN_HANDSHAKE_SENT: u32 = 0x4;

/// External collaborators of a resource.
pub struct Collaborators {
    /// Outbound network.
    pub transport: Arc<dyn Transport>,
    /// Local block storage.
    pub lower: Arc<dyn LowerDevice>,
    /// Metadata storage per volume. A volume without one keeps its bitmap
    /// and activity log in memory only.
    pub meta: BTreeMap<VolumeId, Arc<dyn MetaIo>>,
    /// Consulted on promotion.
    pub fencing: Arc<dyn FencingPolicy>,
}

/// One volume of a resource.
pub struct Device {
    volume: VolumeId,
    bitmap: Arc<Bitmap>,
    al: Mutex<ActivityLog>,
    layout: MetaLayout,
    data_sectors: u64,
    ap_bio_cnt: AtomicU32,
    local_cnt: AtomicU32,
    was_io_error: AtomicBool,
    generation: Mutex<GenerationIds>,
}

impl Device {
    fn new(
        cfg: &DeviceConfig,
        config: &ResourceConfig,
        meta: Option<Arc<dyn MetaIo>>,
    ) -> ReplResult<Self> {
        let volume = VolumeId(cfg.volume);
        let planes = cfg.max_peers.max(config.peers.len() as u32).max(1);
        let layout = MetaLayout::compute(cfg.device_sectors, planes, config.disk.al_size_4k, cfg.placement)?;
        let data_sectors = layout.data_sectors;
        let bm_store = meta.as_ref().map(|m| BitmapStore {
            meta: m.clone(),
            layout: layout.clone(),
        });
        let bitmap = Arc::new(Bitmap::new(data_sectors.div_ceil(BM_SECT_PER_BIT), planes, bm_store));
        let al_store = meta.map(|meta| AlStore {
            meta,
            layout: layout.clone(),
        });
        let al = ActivityLog::new(
            config.disk.al_extents,
            bitmap.clone(),
            al_store,
            config.resync.resync_extents,
            config.disk.al_updates,
        );
        Ok(Self {
            volume,
            bitmap,
            al: Mutex::new(al),
            layout,
            data_sectors,
            ap_bio_cnt: AtomicU32::new(0),
            local_cnt: AtomicU32::new(0),
            was_io_error: AtomicBool::new(false),
            generation: Mutex::new(GenerationIds::just_created()),
        })
    }

    /// Volume number.
    pub fn volume(&self) -> VolumeId {
        self.volume
    }

    /// Out-of-sync bitmap.
    pub fn bitmap(&self) -> &Arc<Bitmap> {
        &self.bitmap
    }

    /// Locks the activity log.
    pub fn activity_log(&self) -> MutexGuard<'_, ActivityLog> {
        self.al.lock()
    }

    /// Metadata layout.
    pub fn layout(&self) -> &MetaLayout {
        &self.layout
    }

    /// Usable data sectors.
    pub fn data_sectors(&self) -> u64 {
        self.data_sectors
    }

    /// Application requests in flight.
    pub fn ap_bio_cnt(&self) -> u32 {
        self.ap_bio_cnt.load(Ordering::Acquire)
    }

    /// Local I/Os in flight.
    pub fn local_cnt(&self) -> u32 {
        self.local_cnt.load(Ordering::Acquire)
    }

    /// Whether a local I/O error was seen since the last attach.
    pub fn was_io_error(&self) -> bool {
        self.was_io_error.load(Ordering::Acquire)
    }

    /// Data generation ids.
    pub fn generation(&self) -> GenerationIds {
        *self.generation.lock()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("volume", &self.volume)
            .field("data_sectors", &self.data_sectors)
            .field("ap_bio_cnt", &self.ap_bio_cnt())
            .field("local_cnt", &self.local_cnt())
            .finish_non_exhaustive()
    }
}

/// One peer connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    epochs: EpochChain,
    flags: AtomicU32,
}

impl Connection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            epochs: EpochChain::new(),
            flags: AtomicU32::new(0),
        }
    }

    /// Connection id (the peer's node id).
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Receive-side epochs.
    pub fn epochs(&self) -> &EpochChain {
        &self.epochs
    }

    /// `CONN_*` flags.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct ConnRuntime {
    agreed_pro_version: u32,
    protocol: Option<Protocol>,
    peer_hello: Option<(Role, Vec<VolumeHandshake>)>,
    last_received: Option<Instant>,
    ping_sent_at: Option<Instant>,
    peer_acked_dagtag: Dagtag,
}

#[derive(Debug, Default)]
struct PdRuntime {
    resync: Option<ResyncRun>,
    verify: Option<VerifyRun>,
    bitmap_sent: bool,
    bitmap_received: bool,
    deferred: VecDeque<Packet>,
}

/// What a local I/O was issued for.
#[derive(Debug)]
enum LocalIo {
    Write {
        dagtag: Dagtag,
        volume: VolumeId,
    },
    Read {
        id: u64,
    },
    PeerWrite {
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        dagtag: Dagtag,
        epoch: Arc<Epoch>,
        iv: IntervalId,
    },
    PeerRead {
        conn: ConnectionId,
        volume: VolumeId,
        id: u64,
    },
    RsRead {
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        csum: Option<Digest>,
    },
    RsWrite {
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
    },
    CsumRead {
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
    },
    OvRead {
        conn: ConnectionId,
        volume: VolumeId,
        span: SectorSpan,
        peer: Option<Digest>,
    },
}

impl LocalIo {
    fn volume(&self, reads: &HashMap<u64, AppRead>) -> Option<VolumeId> {
        match self {
            LocalIo::Read { id } => reads.get(id).map(|r| r.volume),
            LocalIo::Write { volume, .. }
            | LocalIo::PeerWrite { volume, .. }
            | LocalIo::PeerRead { volume, .. }
            | LocalIo::RsRead { volume, .. }
            | LocalIo::RsWrite { volume, .. }
            | LocalIo::CsumRead { volume, .. }
            | LocalIo::OvRead { volume, .. } => Some(*volume),
        }
    }
}

#[derive(Debug)]
struct AppRead {
    volume: VolumeId,
    span: SectorSpan,
    iv: IntervalId,
    remote: Option<ConnectionId>,
    waiter: Option<oneshot::Sender<ReadResult>>,
}

/// Everything guarded by the request lock.
pub(crate) struct ResourceInner {
    pub(crate) states: StateVector,
    tl: TransferLog,
    conns: BTreeMap<ConnectionId, ConnRuntime>,
    pds: BTreeMap<PeerDeviceId, PdRuntime>,
    local_ios: HashMap<IoToken, LocalIo>,
    reads: HashMap<u64, AppRead>,
    write_ids: HashMap<Dagtag, IntervalId>,
    write_iv: BTreeMap<VolumeId, IntervalSet>,
    read_iv: BTreeMap<VolumeId, IntervalSet>,
    outq: VecDeque<(ConnectionId, Packet)>,
    next_id: u64,
    shutdown: bool,
}

impl ResourceInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Queues `packet` for `conn`; dropped unless the connection is at
    /// least connecting.
    fn queue(&mut self, conn: ConnectionId, packet: Packet) {
        if self.states.cstate(conn) < ConnState::Connecting {
            trace!(conn = %conn, kind = packet.kind(), "dropping packet for idle connection");
            return;
        }
        self.outq.push_back((conn, packet));
    }

    fn pd(&mut self, pd: PeerDeviceId) -> &mut PdRuntime {
        self.pds.entry(pd).or_default()
    }

    fn conn(&mut self, conn: ConnectionId) -> &mut ConnRuntime {
        self.conns.entry(conn).or_default()
    }

    /// Replication protocol both sides agreed on in the last hello.
    fn protocol_of(&self, conn: ConnectionId) -> Option<Protocol> {
        self.conns.get(&conn).and_then(|c| c.protocol)
    }

    fn agreed_pro_version(&self, conn: ConnectionId) -> u32 {
        self.conns.get(&conn).map(|c| c.agreed_pro_version).unwrap_or(0)
    }

    fn io_stable(&self, volume: VolumeId) -> bool {
        self.states
            .io_stable(volume, |c| self.agreed_pro_version(c))
    }
}

/// Work that follows a batch of effects and needs the request lock again.
#[derive(Debug)]
enum Followup {
    Lost(ConnectionId, ConnState),
    IoError(VolumeId),
    MetaError(VolumeId, String),
    DetachCheck(VolumeId),
    Exchange(PeerDeviceId),
}

/// Collaborator calls collected under the request lock.
#[derive(Default)]
pub(crate) struct Effects {
    lower: Vec<LowerIo>,
    completed: Vec<Completed>,
    reads: Vec<(oneshot::Sender<ReadResult>, ReadResult)>,
    events: Vec<StateEvent>,
    flush_bitmap: BTreeSet<VolumeId>,
    followups: Vec<Followup>,
}

/// Counters of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatus {
    /// The volume.
    pub volume: VolumeId,
    /// Local disk state.
    pub disk: DiskState,
    /// Out-of-sync bits per connection.
    pub out_of_sync: Vec<(ConnectionId, u64)>,
    /// Activity log extents in use.
    pub al_used: usize,
    /// Application requests in flight.
    pub ap_bio_cnt: u32,
    /// Local I/Os in flight.
    pub local_cnt: u32,
}

/// Snapshot of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Resource name.
    pub name: String,
    /// Local node id.
    pub node_id: u32,
    /// Committed states.
    pub states: StateVector,
    /// Requests in the transfer log.
    pub requests: usize,
    /// Newest dagtag.
    pub dagtag: Dagtag,
    /// Newest dagtag durable on every peer.
    pub peer_acked: Dagtag,
    /// Per-volume counters.
    pub volumes: Vec<VolumeStatus>,
}

/// A replicated resource.
pub struct Resource {
    name: String,
    node_id: u32,
    config: ResourceConfig,
    inner: Mutex<ResourceInner>,
    send_lock: Mutex<()>,
    devices: BTreeMap<VolumeId, Arc<Device>>,
    connections: BTreeMap<ConnectionId, Arc<Connection>>,
    transport: Arc<dyn Transport>,
    lower: Arc<dyn LowerDevice>,
    fencing: Arc<dyn FencingPolicy>,
    events: EventBus,
    wake: Notify,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("node_id", &self.node_id)
            .field("devices", &self.devices)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

impl Resource {
    /// Builds a resource from `config`. Every volume starts `Diskless`,
    /// every connection `StandAlone`, the role is `Secondary`.
    pub fn new(config: ResourceConfig, collab: Collaborators) -> ReplResult<Arc<Self>> {
        config.validate()?;
        let Collaborators {
            transport,
            lower,
            mut meta,
            fencing,
        } = collab;

        let mut devices = BTreeMap::new();
        let mut states = StateVector::default();
        states.resource.role = Role::Secondary;
        let mut write_iv = BTreeMap::new();
        let mut read_iv = BTreeMap::new();
        for cfg in &config.devices {
            let volume = VolumeId(cfg.volume);
            let device = Device::new(cfg, &config, meta.remove(&volume))?;
            states.devices.insert(volume, DeviceStates::default());
            write_iv.insert(volume, IntervalSet::new());
            read_iv.insert(volume, IntervalSet::new());
            devices.insert(volume, Arc::new(device));
        }

        let mut connections = BTreeMap::new();
        let mut conns = BTreeMap::new();
        let mut pds = BTreeMap::new();
        for &peer in &config.peers {
            let conn = ConnectionId(peer);
            connections.insert(conn, Arc::new(Connection::new(conn)));
            conns.insert(conn, ConnRuntime::default());
            states.connections.insert(conn, ConnStates::default());
            for volume in devices.keys() {
                let pd = PeerDeviceId::new(conn, *volume);
                states.peer_devices.insert(pd, PeerDeviceStates::default());
                pds.insert(pd, PdRuntime::default());
            }
        }

        let inner = ResourceInner {
            states,
            tl: TransferLog::new(config.write_ordering, config.max_epoch_size),
            conns,
            pds,
            local_ios: HashMap::new(),
            reads: HashMap::new(),
            write_ids: HashMap::new(),
            write_iv,
            read_iv,
            outq: VecDeque::new(),
            next_id: 0,
            shutdown: false,
        };
        info!(
            resource = %config.name,
            node_id = config.node_id,
            volumes = devices.len(),
            peers = connections.len(),
            "resource created"
        );
        Ok(Arc::new(Self {
            name: config.name.clone(),
            node_id: config.node_id,
            inner: Mutex::new(inner),
            send_lock: Mutex::new(()),
            devices,
            connections,
            transport,
            lower,
            fencing,
            events: EventBus::default(),
            wake: Notify::new(),
            config,
        }))
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local node id.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// The configuration the resource was built with.
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Looks up a volume.
    pub fn device(&self, volume: VolumeId) -> ReplResult<&Arc<Device>> {
        self.devices
            .get(&volume)
            .ok_or(ReplError::UnknownVolume(volume))
    }

    /// Looks up a connection.
    pub fn connection(&self, conn: ConnectionId) -> ReplResult<&Arc<Connection>> {
        self.connections
            .get(&conn)
            .ok_or(ReplError::UnknownConnection(conn))
    }

    /// Volumes, in order.
    pub fn volumes(&self) -> Vec<VolumeId> {
        self.devices.keys().copied().collect()
    }

    /// Connections, in order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// A copy of the committed states.
    pub fn states(&self) -> StateVector {
        self.inner.lock().states.clone()
    }

    /// Subscribes to state events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Number of events published so far.
    pub fn events_published(&self) -> u64 {
        self.events.published()
    }

    /// Starts a state change transaction. The request lock is held until
    /// the transaction commits or aborts.
    pub fn begin_state_change(&self, flags: ChangeFlags) -> StateChange<'_> {
        StateChange::new(self, self.inner.lock(), flags)
    }

    /// Bitmap plane holding the out-of-sync bits for `conn`.
    fn plane_of(&self, conn: ConnectionId) -> u32 {
        self.config
            .peers
            .iter()
            .position(|p| *p == conn.0)
            .map(|i| i as u32)
            .unwrap_or(0)
    }

    fn planes(&self, conn: Option<ConnectionId>) -> Vec<u32> {
        match conn {
            Some(c) => vec![self.plane_of(c)],
            None => self.connections.keys().map(|c| self.plane_of(*c)).collect(),
        }
    }

    /// Out-of-sync bits `pd` currently has.
    pub fn out_of_sync(&self, pd: PeerDeviceId) -> ReplResult<u64> {
        let device = self.device(pd.volume)?;
        self.connection(pd.conn)?;
        Ok(device.bitmap.total_weight(self.plane_of(pd.conn)))
    }

    /// Progress of the resync of `pd`, if one runs.
    pub fn resync_progress(&self, pd: PeerDeviceId) -> Option<ResyncProgress> {
        let device = self.devices.get(&pd.volume)?;
        let left = device.bitmap.total_weight(self.plane_of(pd.conn));
        let inner = self.inner.lock();
        inner
            .pds
            .get(&pd)
            .and_then(|rt| rt.resync.as_ref())
            .map(|run| run.progress(Instant::now(), left))
    }

    /// Snapshot of states and counters.
    pub fn status(&self) -> ResourceStatus {
        let inner = self.inner.lock();
        let volumes = self
            .devices
            .values()
            .map(|d| VolumeStatus {
                volume: d.volume,
                disk: inner.states.disk(d.volume),
                out_of_sync: self
                    .connections
                    .keys()
                    .map(|c| (*c, d.bitmap.total_weight(self.plane_of(*c))))
                    .collect(),
                al_used: d.al.lock().used(),
                ap_bio_cnt: d.ap_bio_cnt(),
                local_cnt: d.local_cnt(),
            })
            .collect();
        ResourceStatus {
            name: self.name.clone(),
            node_id: self.node_id,
            states: inner.states.clone(),
            requests: inner.tl.len(),
            dagtag: inner.tl.current_dagtag(),
            peer_acked: inner.tl.peer_acked(),
            volumes,
        }
    }

    /// Newest dagtag the peer on `conn` announced as durable everywhere.
    pub fn peer_acked_dagtag(&self, conn: ConnectionId) -> Dagtag {
        self.inner
            .lock()
            .conns
            .get(&conn)
            .map(|c| c.peer_acked_dagtag)
            .unwrap_or(0)
    }

    /// Requests in the transfer log.
    pub fn requests_in_flight(&self) -> usize {
        self.inner.lock().tl.len()
    }

    /// Stops admitting new I/O; waiting submitters fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        info!(resource = %self.name, "resource shutting down");
        self.wake.notify_waiters();
    }

    /// Issues a local I/O for `what` and accounts it on the device.
    fn submit_lower(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        volume: VolumeId,
        sector: Sector,
        op: LowerOp,
        what: LocalIo,
    ) -> IoToken {
        let token = inner.next_id();
        if let Some(device) = self.devices.get(&volume) {
            device.local_cnt.fetch_add(1, Ordering::AcqRel);
        }
        inner.local_ios.insert(token, what);
        fx.lower.push(LowerIo {
            token,
            volume,
            sector,
            op,
        });
        token
    }

    /// A bitmap update failed. Unusable metadata fails the disk once the
    /// request lock is released; refused updates are logged.
    fn bitmap_failed(&self, fx: &mut Effects, volume: VolumeId, span: SectorSpan, e: BitmapError) {
        match e {
            BitmapError::Meta(e) => fx.followups.push(Followup::MetaError(volume, e.to_string())),
            e => warn!(volume = %volume, span = %span, error = %e, "bitmap update refused"),
        }
    }

    /// Hands queued packets to the transport. Returns connections whose
    /// send failed.
    fn flush_sends(&self) -> Vec<ConnectionId> {
        let _sending = self.send_lock.lock();
        let mut failed: Vec<ConnectionId> = Vec::new();
        loop {
            let batch: Vec<(ConnectionId, Packet)> = self.inner.lock().outq.drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for (conn, packet) in batch {
                if failed.contains(&conn) {
                    continue;
                }
                trace!(conn = %conn, kind = packet.kind(), "send");
                if let Err(e) = self.transport.send(conn, packet) {
                    warn!(conn = %conn, error = %e, "send failed");
                    failed.push(conn);
                }
            }
        }
        failed
    }

    /// Performs collected effects. Must be called without the request lock.
    pub(crate) fn run_effects(&self, mut fx: Effects) {
        for io in fx.lower.drain(..) {
            self.lower.submit(io);
        }
        let failed = self.flush_sends();
        for c in fx.completed.drain(..) {
            c.deliver();
        }
        for (tx, result) in fx.reads.drain(..) {
            let _ = tx.send(result);
        }
        for event in fx.events.drain(..) {
            self.events.publish(event);
        }
        for volume in std::mem::take(&mut fx.flush_bitmap) {
            let Some(device) = self.devices.get(&volume) else {
                continue;
            };
            match device.bitmap.write_hinted() {
                Ok(_) => {}
                Err(BitmapError::Meta(e)) => fx.followups.push(Followup::MetaError(volume, e.to_string())),
                Err(e) => debug!(volume = %volume, error = %e, "bitmap flush skipped"),
            }
        }
        self.wake.notify_waiters();

        for conn in failed {
            self.connection_lost(conn, ConnState::NetworkFailure);
        }
        for followup in fx.followups {
            match followup {
                Followup::Lost(conn, cstate) => self.connection_lost(conn, cstate),
                Followup::IoError(volume) => self.local_io_error(volume),
                Followup::MetaError(volume, msg) => self.handle_meta_error(volume, &msg),
                Followup::DetachCheck(volume) => self.maybe_finish_detach(volume),
                Followup::Exchange(pd) => self.check_bitmap_exchange(pd),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCluster;
    use blkmirror_meta::MetaError;

    const V0: VolumeId = VolumeId(0);

    #[test]
    fn test_unwritable_bitmap_fails_disk() {
        let cluster = SimCluster::new(1, 1024).unwrap();
        let node = cluster.node(0);
        let mut fx = Effects::default();
        let e = BitmapError::Meta(MetaError::DeviceError {
            sector: 8,
            reason: "write failed".to_string(),
        });
        node.bitmap_failed(&mut fx, V0, SectorSpan::new(0, 8), e);
        assert!(matches!(fx.followups[..], [Followup::MetaError(V0, _)]));
        node.run_effects(fx);
        assert!(matches!(
            node.states().disk(V0),
            DiskState::Failed | DiskState::Diskless
        ));
    }

    #[tokio::test]
    async fn test_acks_follow_the_agreed_protocol() {
        let cluster = SimCluster::with_config(2, |id| {
            let mut cfg = crate::sim::sim_config(id, 2, 1024);
            cfg.net.protocol = Protocol::B;
            cfg
        })
        .unwrap();
        cluster.connect_all().unwrap();
        cluster.promote(0).unwrap();
        assert_eq!(cluster.node(1).inner.lock().protocol_of(ConnectionId(0)), Some(Protocol::B));

        let mut h = cluster.write(0, 8, bytes::Bytes::from(vec![5u8; 4096])).await.unwrap();
        assert_eq!(h.try_result(), Some(Ok(())));
        cluster.flush();
        assert_eq!(cluster.contents(1, 8, 8).unwrap(), vec![5u8; 4096]);
        assert_eq!(cluster.node(0).out_of_sync(PeerDeviceId::new(ConnectionId(1), V0)).unwrap(), 0);
        assert_eq!(cluster.node(0).requests_in_flight(), 0);
    }

    #[test]
    fn test_refused_bitmap_update_keeps_disk() {
        let cluster = SimCluster::new(1, 1024).unwrap();
        let node = cluster.node(0);
        let mut fx = Effects::default();
        node.bitmap_failed(&mut fx, V0, SectorSpan::new(0, 8), BitmapError::NoSuchPlane(9));
        assert!(fx.followups.is_empty());
        node.run_effects(fx);
        assert_eq!(node.states().disk(V0), DiskState::UpToDate);
    }
}
