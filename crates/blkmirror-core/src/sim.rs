//! In-process cluster for tests and the demo binary.
//!
//! Every node is a [`Resource`] backed by a [`MemDisk`] and a
//! [`MemMetaIo`]. Packets travel over a shared in-memory wire, encoded and
//! decoded with bincode on the way, and are delivered only when
//! [`SimCluster::pump`] runs. Links can be cut and healed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use blkmirror_meta::{MemMetaIo, MetaIo, MetaLayout, Placement};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::ResourceConfig;
use crate::error::{ReplResult, TransportError};
use crate::fencing::DontCare;
use crate::lower::MemDisk;
use crate::resource::{AttachOptions, Collaborators, RequestHandle, Resource, WriteFlags};
use crate::state::{ConnState, ReplState, Role};
use crate::transport::{Packet, Transport};
use crate::types::{ConnectionId, PeerDeviceId, VolumeId};

/// Upper bound of deliveries per [`SimCluster::pump`] call.
const MAX_PUMP_STEPS: usize = 1_000_000;

/// A packet on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sending node.
    pub from: u32,
    /// Receiving node.
    pub to: u32,
    /// The packet.
    pub packet: Packet,
}

#[derive(Debug, Default)]
struct Wire {
    queue: Mutex<VecDeque<Envelope>>,
    cut: Mutex<BTreeSet<(u32, u32)>>,
}

fn link(a: u32, b: u32) -> (u32, u32) {
    (a.min(b), a.max(b))
}

impl Wire {
    fn is_cut(&self, a: u32, b: u32) -> bool {
        self.cut.lock().contains(&link(a, b))
    }
}

/// Transport of one node onto the shared wire.
#[derive(Debug)]
pub struct LoopbackTransport {
    node: u32,
    wire: Arc<Wire>,
}

impl Transport for LoopbackTransport {
    fn send(&self, conn: ConnectionId, packet: Packet) -> Result<(), TransportError> {
        if self.wire.is_cut(self.node, conn.0) {
            return Err(TransportError::Disconnected(conn));
        }
        let send_err = |e: bincode::Error| TransportError::Send {
            conn,
            msg: e.to_string(),
        };
        let frame = bincode::serialize(&packet).map_err(send_err)?;
        let packet: Packet = bincode::deserialize(&frame).map_err(send_err)?;
        trace!(from = self.node, to = conn.0, bytes = frame.len(), kind = packet.kind(), "wire");
        self.wire.queue.lock().push_back(Envelope {
            from: self.node,
            to: conn.0,
            packet,
        });
        Ok(())
    }
}

/// One node of a [`SimCluster`].
pub struct SimNode {
    /// The replicated resource.
    pub resource: Arc<Resource>,
    /// Its backing storage.
    pub disk: Arc<MemDisk>,
    /// Its metadata storage, per volume.
    pub meta: BTreeMap<VolumeId, Arc<MemMetaIo>>,
}

/// A set of fully meshed nodes sharing one wire.
pub struct SimCluster {
    wire: Arc<Wire>,
    nodes: Vec<SimNode>,
}

/// Test-friendly defaults: one volume of `device_sectors`, a fixed and fast
/// resync rate, external metadata.
pub fn sim_config(node_id: u32, nodes: u32, device_sectors: u64) -> ResourceConfig {
    let mut cfg = ResourceConfig {
        name: "sim".to_string(),
        node_id,
        peers: (0..nodes).filter(|n| *n != node_id).collect(),
        ..ResourceConfig::default()
    };
    cfg.resync.c_plan_ahead = 0;
    cfg.resync.resync_rate_kib = 1 << 20;
    cfg.net.ping_interval_ms = 60_000;
    cfg.net.ping_timeout_ms = 60_000;
    for d in &mut cfg.devices {
        d.device_sectors = device_sectors;
        d.placement = Placement::External { start_sector: 0 };
        d.max_peers = nodes.saturating_sub(1).max(1);
    }
    cfg
}

impl SimCluster {
    /// Builds `nodes` nodes with [`sim_config`], attaches fresh metadata and
    /// marks every disk up to date.
    pub fn new(nodes: u32, device_sectors: u64) -> ReplResult<Self> {
        Self::with_config(nodes, |id| sim_config(id, nodes, device_sectors))
    }

    /// Builds `nodes` nodes from `config(node_id)`.
    pub fn with_config(nodes: u32, config: impl Fn(u32) -> ResourceConfig) -> ReplResult<Self> {
        let wire = Arc::new(Wire::default());
        let mut built = Vec::with_capacity(nodes as usize);
        for id in 0..nodes {
            let cfg = config(id);
            let disk = Arc::new(MemDisk::new());
            let mut meta = BTreeMap::new();
            let mut meta_io: BTreeMap<VolumeId, Arc<dyn MetaIo>> = BTreeMap::new();
            for d in &cfg.devices {
                let volume = VolumeId(d.volume);
                let planes = d.max_peers.max(cfg.peers.len() as u32).max(1);
                let layout = MetaLayout::compute(d.device_sectors, planes, cfg.disk.al_size_4k, d.placement)?;
                let io = Arc::new(MemMetaIo::new(layout.md_size_sectors()));
                disk.add_volume(volume, d.device_sectors);
                meta_io.insert(volume, io.clone());
                meta.insert(volume, io);
            }
            let resource = Resource::new(
                cfg.clone(),
                Collaborators {
                    transport: Arc::new(LoopbackTransport {
                        node: id,
                        wire: wire.clone(),
                    }),
                    lower: disk.clone(),
                    meta: meta_io,
                    fencing: Arc::new(DontCare),
                },
            )?;
            for volume in resource.volumes() {
                resource.attach(
                    volume,
                    AttachOptions {
                        format: true,
                        ..AttachOptions::default()
                    },
                )?;
            }
            built.push(SimNode { resource, disk, meta });
        }
        Ok(Self { wire, nodes: built })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resource of node `i`.
    pub fn node(&self, i: u32) -> &Arc<Resource> {
        &self.nodes[i as usize].resource
    }

    /// Backing storage of node `i`.
    pub fn disk(&self, i: u32) -> &Arc<MemDisk> {
        &self.nodes[i as usize].disk
    }

    /// Metadata storage of volume 0 on node `i`.
    pub fn meta(&self, i: u32) -> Option<&Arc<MemMetaIo>> {
        self.nodes[i as usize].meta.get(&VolumeId(0))
    }

    /// Replication state of node `a` towards node `b`, volume 0.
    pub fn repl(&self, a: u32, b: u32) -> ReplState {
        self.node(a).states().repl(PeerDeviceId::new(ConnectionId(b), VolumeId(0)))
    }

    /// Connection state of node `a` towards node `b`.
    pub fn cstate(&self, a: u32, b: u32) -> ConnState {
        self.node(a).states().cstate(ConnectionId(b))
    }

    /// Makes node `i` primary.
    pub fn promote(&self, i: u32) -> ReplResult<()> {
        self.node(i).set_role(Role::Primary, false)
    }

    /// Starts every connection and delivers until the wire is quiet.
    pub fn connect_all(&self) -> ReplResult<()> {
        for node in &self.nodes {
            for conn in node.resource.connection_ids() {
                node.resource.connect(conn)?;
            }
        }
        self.pump();
        Ok(())
    }

    /// Delivers packets and lower-device completions until nothing moves.
    /// Returns the number of deliveries.
    pub fn pump(&self) -> usize {
        let mut steps = 0usize;
        while steps < MAX_PUMP_STEPS {
            let mut progressed = false;
            for node in &self.nodes {
                for done in node.disk.take_completions() {
                    node.resource.local_io_done(done.token, done.result);
                    progressed = true;
                    steps += 1;
                }
            }
            let next = self.wire.queue.lock().pop_front();
            if let Some(env) = next {
                progressed = true;
                steps += 1;
                if self.wire.is_cut(env.from, env.to) {
                    trace!(from = env.from, to = env.to, "packet lost on a cut link");
                } else if let Some(node) = self.nodes.get(env.to as usize) {
                    if let Err(e) = node.resource.receive(ConnectionId(env.from), env.packet) {
                        debug!(from = env.from, to = env.to, error = %e, "delivery failed");
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        steps
    }

    /// One timer round on every node: barriers, keepalive, resync.
    pub fn tick(&self, now: Instant) {
        for node in &self.nodes {
            node.resource.send_barriers();
            node.resource.ping_tick(now);
            node.resource.resync_tick(now);
        }
    }

    /// Ticks and pumps until no peer device exchanges bitmaps or resyncs,
    /// at most `max_ticks` times. Returns whether it settled.
    pub fn run_resync(&self, max_ticks: usize) -> bool {
        for _ in 0..max_ticks {
            self.tick(Instant::now());
            self.pump();
            if self.settled() {
                return true;
            }
        }
        false
    }

    fn settled(&self) -> bool {
        self.nodes.iter().all(|n| {
            n.resource
                .states()
                .peer_devices
                .values()
                .all(|p| !p.repl.is_resync() && !p.repl.is_starting())
        })
    }

    /// Cuts the link between `a` and `b`: packets in flight are lost and
    /// both sides see a network failure.
    pub fn cut(&self, a: u32, b: u32) {
        self.wire.cut.lock().insert(link(a, b));
        self.wire
            .queue
            .lock()
            .retain(|e| link(e.from, e.to) != link(a, b));
        self.node(a).connection_lost(ConnectionId(b), ConnState::NetworkFailure);
        self.node(b).connection_lost(ConnectionId(a), ConnState::NetworkFailure);
        self.pump();
    }

    /// Restores the link between `a` and `b` and reconnects both sides.
    pub fn heal(&self, a: u32, b: u32) -> ReplResult<()> {
        self.wire.cut.lock().remove(&link(a, b));
        self.node(a).connect(ConnectionId(b))?;
        self.node(b).connect(ConnectionId(a))?;
        self.pump();
        Ok(())
    }

    /// Submits a write of `data` on node `i`, volume 0, and delivers
    /// everything that follows.
    pub async fn write(&self, i: u32, sector: u64, data: Bytes) -> ReplResult<RequestHandle> {
        let handle = self
            .node(i)
            .submit_write(VolumeId(0), sector, data, WriteFlags::default())
            .await?;
        self.pump();
        Ok(handle)
    }

    /// Closes open epochs everywhere and delivers the barrier traffic.
    pub fn flush(&self) {
        for node in &self.nodes {
            node.resource.send_barriers();
        }
        self.pump();
    }

    /// Raw contents of volume 0 on node `i`.
    pub fn contents(&self, i: u32, sector: u64, sectors: u64) -> Option<Vec<u8>> {
        self.disk(i)
            .read_raw(VolumeId(0), crate::types::SectorSpan::new(sector, sectors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_pair_connects_established() {
        let cluster = SimCluster::new(2, 1024).unwrap();
        cluster.connect_all().unwrap();
        assert_eq!(cluster.cstate(0, 1), ConnState::Connected);
        assert_eq!(cluster.cstate(1, 0), ConnState::Connected);
        assert_eq!(cluster.repl(0, 1), ReplState::Established);
        assert_eq!(cluster.repl(1, 0), ReplState::Established);
    }

    #[test]
    fn test_cut_and_heal() {
        let cluster = SimCluster::new(2, 1024).unwrap();
        cluster.connect_all().unwrap();
        cluster.cut(0, 1);
        assert_eq!(cluster.cstate(0, 1), ConnState::Unconnected);
        assert_eq!(cluster.repl(1, 0), ReplState::Off);
        cluster.heal(0, 1).unwrap();
        assert_eq!(cluster.cstate(0, 1), ConnState::Connected);
        assert_eq!(cluster.repl(0, 1), ReplState::Established);
    }

    #[test]
    fn test_loopback_refuses_cut_link() {
        let wire = Arc::new(Wire::default());
        let t = LoopbackTransport { node: 0, wire: wire.clone() };
        t.send(ConnectionId(1), Packet::Ping).unwrap();
        wire.cut.lock().insert(link(1, 0));
        assert_eq!(
            t.send(ConnectionId(1), Packet::Ping),
            Err(TransportError::Disconnected(ConnectionId(1)))
        );
        assert_eq!(wire.queue.lock().len(), 1);
    }
}
