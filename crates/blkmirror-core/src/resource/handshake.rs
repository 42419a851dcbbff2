//! Connection lifecycle: connect, handshake, state announcements, bitmap
//! exchange, keepalive and loss.
//!
//! Of the two nodes of a connection, the one with the lower node id leads:
//! once it holds the peer's hello it decides, per volume, whether and in
//! which direction to resync, and commits `Connected` together with that
//! decision. The follower mirrors the decision when the leader's state
//! announcement arrives.

use std::cmp::Reverse;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{Effects, Followup, Resource, ResourceInner, CONN_HANDSHAKE_SENT, CONN_PING_SENT};
use crate::bitmap::BmLockFlags;
use crate::config::PRO_VERSION_MIN;
use crate::error::{ReplError, ReplResult};
use crate::events::StateEvent;
use crate::generation::{compare, GenerationIds, GenerationOrder};
use crate::state::{ChangeFlags, ConnState, DiskState, ReplState, Role};
use crate::transport::{Packet, VolumeHandshake};
use crate::types::{ConnectionId, PeerDeviceId, Protocol, VolumeId};

/// Bitmap words per `Bitmap` packet.
pub const BITMAP_CHUNK_WORDS: usize = 512;

/// One node's view of a volume at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSide {
    /// Local disk state.
    pub disk: DiskState,
    /// Whether the node is primary.
    pub primary: bool,
    /// Bits out of sync towards the other node.
    pub weight: u64,
    /// Node id.
    pub node_id: u32,
    /// Data generation ids.
    pub gen: GenerationIds,
}

/// Outcome of the sync handshake for one volume, from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDecision {
    /// `Established`, `WfBitmapS` or `WfBitmapT`.
    pub repl: ReplState,
    /// The target's disk is inconsistent: every block is resynced.
    pub full: bool,
}

/// Decides the resync direction between `local` and `peer`.
///
/// Nothing is synced when either disk is unusable or both are
/// inconsistent. A side whose consistent data moved on to a newer
/// generation is the source. Otherwise the source is the side with the
/// better disk, then the primary, then the one with more out-of-sync bits,
/// then the lower node id. Equal disks with clean bitmaps need no resync.
pub fn decide(local: SyncSide, peer: SyncSide) -> SyncDecision {
    let established = SyncDecision {
        repl: ReplState::Established,
        full: false,
    };
    if !local.disk.is_usable() || !peer.disk.is_usable() {
        return established;
    }
    if local.disk == DiskState::Inconsistent && peer.disk == DiskState::Inconsistent {
        return established;
    }
    let by_generation = match compare(&local.gen, &peer.gen) {
        GenerationOrder::LocalNewer { full } if local.disk > DiskState::Inconsistent => Some((true, full)),
        GenerationOrder::PeerNewer { full } if peer.disk > DiskState::Inconsistent => Some((false, full)),
        _ => None,
    };
    if let Some((local_source, full)) = by_generation {
        let target = if local_source { peer } else { local };
        return SyncDecision {
            repl: if local_source {
                ReplState::WfBitmapS
            } else {
                ReplState::WfBitmapT
            },
            full: full || target.disk == DiskState::Inconsistent,
        };
    }
    let key = |s: &SyncSide| (s.disk, s.primary, s.weight, Reverse(s.node_id));
    let local_source = key(&local) > key(&peer);
    let (source, target) = if local_source { (local, peer) } else { (peer, local) };
    if source.disk == target.disk && local.weight == 0 && peer.weight == 0 {
        return established;
    }
    SyncDecision {
        repl: if local_source {
            ReplState::WfBitmapS
        } else {
            ReplState::WfBitmapT
        },
        full: target.disk == DiskState::Inconsistent,
    }
}

impl Resource {
    fn hello(&self, inner: &ResourceInner, conn: ConnectionId) -> Packet {
        let plane = self.plane_of(conn);
        let volumes = self
            .devices
            .values()
            .map(|d| VolumeHandshake {
                volume: d.volume,
                disk: inner.states.disk(d.volume),
                weight: d.bitmap.total_weight(plane),
                gen: d.generation(),
            })
            .collect();
        Packet::Handshake {
            node_id: self.node_id,
            pro_version: self.config.net.pro_version_max,
            protocol: self.config.net.protocol,
            role: inner.states.resource.role,
            volumes,
        }
    }

    fn send_hello(&self, inner: &mut ResourceInner, conn: ConnectionId) {
        let hello = self.hello(inner, conn);
        inner.queue(conn, hello);
        if let Some(c) = self.connections.get(&conn) {
            c.set_flag(CONN_HANDSHAKE_SENT);
        }
    }

    /// Starts connecting to the peer on `conn`.
    pub fn connect(&self, conn: ConnectionId) -> ReplResult<()> {
        self.connection(conn)?;
        let mut fx = Effects::default();
        let result = {
            let mut inner = self.inner.lock();
            if inner.states.cstate(conn) >= ConnState::Connecting {
                return Ok(());
            }
            let result = self.change_locked(&mut inner, &mut fx, ChangeFlags::VERBOSE, |s| {
                if let Some(c) = s.connections.get_mut(&conn) {
                    c.cstate = ConnState::Connecting;
                }
            });
            if result.is_ok() {
                self.send_hello(&mut inner, conn);
            }
            result
        };
        self.run_effects(fx);
        result?;
        Ok(())
    }

    /// Tears the connection down and stops reconnecting.
    pub fn disconnect(&self, conn: ConnectionId) -> ReplResult<()> {
        self.connection(conn)?;
        self.change(ChangeFlags::VERBOSE, |s| {
            if let Some(c) = s.connections.get_mut(&conn) {
                c.cstate = ConnState::Disconnecting;
            }
        })?;
        self.change(ChangeFlags::HARD, |s| {
            if let Some(c) = s.connections.get_mut(&conn) {
                c.cstate = ConnState::StandAlone;
            }
        })?;
        info!(resource = %self.name, conn = %conn, "disconnected");
        Ok(())
    }

    /// The link to `conn` failed with `cstate`. Passes through the failure
    /// state and ends `Unconnected`, from where the keepalive tick
    /// reconnects.
    pub fn connection_lost(&self, conn: ConnectionId, cstate: ConnState) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.states.cstate(conn) < ConnState::Connecting {
                return;
            }
            warn!(resource = %self.name, conn = %conn, reason = ?cstate, "connection lost");
            for to in [cstate, ConnState::Unconnected] {
                let r = self.change_locked(&mut inner, &mut fx, ChangeFlags::HARD, |s| {
                    if let Some(c) = s.connections.get_mut(&conn) {
                        c.cstate = to;
                    }
                });
                if let Err(e) = r {
                    warn!(conn = %conn, error = %e, "cannot take connection down");
                }
            }
        }
        self.run_effects(fx);
    }

    /// Handles the peer's hello.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn receive_handshake(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        conn: ConnectionId,
        node_id: u32,
        pro_version: u32,
        protocol: Protocol,
        role: Role,
        volumes: Vec<VolumeHandshake>,
    ) -> ReplResult<()> {
        match inner.states.cstate(conn) {
            ConnState::StandAlone | ConnState::Disconnecting => {
                debug!(conn = %conn, "hello while standalone, ignored");
                return Ok(());
            }
            ConnState::Connected => {
                debug!(conn = %conn, "duplicate hello ignored");
                return Ok(());
            }
            ConnState::Connecting => {}
            _ => {
                self.change_locked(inner, fx, ChangeFlags::HARD, |s| {
                    if let Some(c) = s.connections.get_mut(&conn) {
                        c.cstate = ConnState::Connecting;
                    }
                })?;
            }
        }

        let protocol_error = |msg: String| ReplError::Protocol { conn, msg };
        if node_id != conn.0 {
            return Err(protocol_error(format!("hello from node {} on connection {}", node_id, conn)));
        }
        if protocol != self.config.net.protocol {
            return Err(protocol_error(format!(
                "peer uses protocol {:?}, we use {:?}",
                protocol, self.config.net.protocol
            )));
        }
        if pro_version < PRO_VERSION_MIN {
            return Err(protocol_error(format!("protocol version {} too old", pro_version)));
        }
        let agreed = pro_version.min(self.config.net.pro_version_max);
        let diverged = self.diverged_volumes(inner, conn, &volumes);
        if !diverged.is_empty() {
            for volume in diverged {
                fx.events.push(StateEvent::SplitBrain {
                    peer: PeerDeviceId::new(conn, volume),
                });
            }
            self.change_locked(inner, fx, ChangeFlags::HARD, |s| {
                if let Some(c) = s.connections.get_mut(&conn) {
                    c.cstate = ConnState::StandAlone;
                }
            })?;
            return Ok(());
        }
        {
            let rt = inner.conn(conn);
            rt.agreed_pro_version = agreed;
            rt.protocol = Some(protocol);
            rt.peer_hello = Some((role, volumes));
        }
        debug!(conn = %conn, agreed, peer_role = ?role, "hello received");

        if self.node_id < conn.0 {
            self.lead_handshake(inner, fx, conn)
        } else {
            let sent = self
                .connections
                .get(&conn)
                .map(|c| c.flags() & CONN_HANDSHAKE_SENT != 0)
                .unwrap_or(false);
            if !sent {
                self.send_hello(inner, conn);
            }
            Ok(())
        }
    }

    /// Volumes where both sides hold consistent data of generations that
    /// split from each other, or share none.
    fn diverged_volumes(
        &self,
        inner: &ResourceInner,
        conn: ConnectionId,
        volumes: &[VolumeHandshake],
    ) -> Vec<VolumeId> {
        volumes
            .iter()
            .filter_map(|v| {
                let device = self.devices.get(&v.volume)?;
                if inner.states.disk(v.volume) <= DiskState::Inconsistent || v.disk <= DiskState::Inconsistent {
                    return None;
                }
                let ours = device.generation();
                let pd = PeerDeviceId::new(conn, v.volume);
                match compare(&ours, &v.gen) {
                    order @ (GenerationOrder::SplitBrain | GenerationOrder::Unrelated) => {
                        error!(
                            peer = %pd,
                            ?order,
                            ours = ?ours,
                            theirs = ?v.gen,
                            "split brain detected, dropping connection"
                        );
                        Some(v.volume)
                    }
                    _ => None,
                }
            })
            .collect()
    }

    fn lead_handshake(&self, inner: &mut ResourceInner, fx: &mut Effects, conn: ConnectionId) -> ReplResult<()> {
        let Some((peer_role, peer_volumes)) = inner.conn(conn).peer_hello.clone() else {
            return Ok(());
        };
        let hello = self.hello(inner, conn);
        inner.queue(conn, hello);

        let plane = self.plane_of(conn);
        let primary = inner.states.resource.role == Role::Primary;
        let mut staged = inner.states.clone();
        if let Some(c) = staged.connections.get_mut(&conn) {
            c.cstate = ConnState::Connected;
            c.peer_role = peer_role;
        }
        for device in self.devices.values() {
            let pd = PeerDeviceId::new(conn, device.volume);
            let theirs = peer_volumes.iter().find(|v| v.volume == device.volume);
            let peer = SyncSide {
                disk: theirs.map(|v| v.disk).unwrap_or(DiskState::Diskless),
                primary: peer_role == Role::Primary,
                weight: theirs.map(|v| v.weight).unwrap_or(0),
                node_id: conn.0,
                gen: theirs.map(|v| v.gen).unwrap_or_default(),
            };
            let local = SyncSide {
                disk: inner.states.disk(device.volume),
                primary,
                weight: device.bitmap.total_weight(plane),
                node_id: self.node_id,
                gen: device.generation(),
            };
            let decision = decide(local, peer);
            info!(peer = %pd, ?local, ?peer, repl = ?decision.repl, full = decision.full, "sync handshake");
            if decision.full {
                self.full_sync(device.volume, plane, conn)?;
            }
            if let Some(p) = staged.peer_devices.get_mut(&pd) {
                p.repl = decision.repl;
                p.peer_disk = peer.disk;
            }
        }
        self.commit_staged(inner, staged, ChangeFlags::VERBOSE, true, fx)?;
        Ok(())
    }

    fn full_sync(&self, volume: VolumeId, plane: u32, conn: ConnectionId) -> ReplResult<()> {
        let device = self.device(volume)?;
        let guard = device.bitmap.lock("full sync", BmLockFlags::NONE, Some(conn.0));
        let set = guard.set_all(plane)?;
        debug!(volume = %volume, conn = %conn, bits = set, "bitmap set for full sync");
        Ok(())
    }

    /// Handles a state announcement from the peer.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn receive_state(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        conn: ConnectionId,
        role: Role,
        volume: Option<VolumeId>,
        disk: Option<DiskState>,
        repl: Option<ReplState>,
        resync_susp: Option<bool>,
    ) -> ReplResult<()> {
        let cstate = inner.states.cstate(conn);
        if cstate < ConnState::Connecting {
            return Ok(());
        }
        let Some(volume) = volume else {
            if cstate == ConnState::Connected {
                self.change_locked(inner, fx, ChangeFlags::NONE, |s| {
                    if let Some(c) = s.connections.get_mut(&conn) {
                        c.peer_role = role;
                    }
                })?;
            }
            return Ok(());
        };
        self.device(volume)?;
        let pd = PeerDeviceId::new(conn, volume);
        let ours = inner.states.repl(pd);

        if ours == ReplState::Off {
            let Some(theirs) = repl.filter(|r| *r != ReplState::Off) else {
                return Ok(());
            };
            return self.follow_handshake(inner, fx, pd, role, disk, theirs, resync_susp);
        }

        let next = match (repl, ours) {
            (Some(ReplState::Established), o) if o.is_sync_source() || o.is_verify() => Some(ReplState::Established),
            (Some(ReplState::VerifyS), ReplState::Established) => Some(ReplState::VerifyT),
            (Some(ReplState::Ahead), ReplState::Established) => Some(ReplState::Behind),
            (Some(ReplState::SyncSource), ReplState::Behind) => Some(ReplState::SyncTarget),
            (Some(ReplState::StartingSyncS | ReplState::WfBitmapS), ReplState::Established) => {
                Some(ReplState::WfBitmapT)
            }
            (Some(ReplState::StartingSyncT | ReplState::WfBitmapT), ReplState::Established) => {
                Some(ReplState::WfBitmapS)
            }
            _ => None,
        };
        let result = self.change_locked(inner, fx, ChangeFlags::NONE, |s| {
            if let Some(c) = s.connections.get_mut(&conn) {
                c.peer_role = role;
            }
            if let Some(p) = s.peer_devices.get_mut(&pd) {
                if let Some(d) = disk {
                    p.peer_disk = d;
                }
                if let Some(on) = resync_susp {
                    p.resync_susp_peer = on;
                }
                if let Some(r) = next {
                    p.repl = r;
                }
            }
        });
        if let Err(e) = result {
            debug!(peer = %pd, theirs = ?repl, ours = ?ours, error = %e, "peer state not applied");
        }
        Ok(())
    }

    /// Mirrors the leader's handshake decision for `pd`.
    #[allow(clippy::too_many_arguments)]
    fn follow_handshake(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        pd: PeerDeviceId,
        role: Role,
        disk: Option<DiskState>,
        theirs: ReplState,
        resync_susp: Option<bool>,
    ) -> ReplResult<()> {
        let mine = match theirs {
            ReplState::WfBitmapS => ReplState::WfBitmapT,
            ReplState::WfBitmapT => ReplState::WfBitmapS,
            ReplState::Ahead => ReplState::Behind,
            _ => ReplState::Established,
        };
        let peer_disk = disk.unwrap_or(DiskState::Unknown);
        let target_disk = match mine {
            ReplState::WfBitmapT => Some(inner.states.disk(pd.volume)),
            ReplState::WfBitmapS => Some(peer_disk),
            _ => None,
        };
        if target_disk == Some(DiskState::Inconsistent) {
            self.full_sync(pd.volume, self.plane_of(pd.conn), pd.conn)?;
        }
        info!(peer = %pd, leader = ?theirs, repl = ?mine, "following sync handshake");
        let mut staged = inner.states.clone();
        if let Some(c) = staged.connections.get_mut(&pd.conn) {
            c.cstate = ConnState::Connected;
            c.peer_role = role;
        }
        if let Some(p) = staged.peer_devices.get_mut(&pd) {
            p.repl = mine;
            p.peer_disk = peer_disk;
            p.resync_susp_peer = resync_susp.unwrap_or(false);
        }
        self.commit_staged(inner, staged, ChangeFlags::VERBOSE, true, fx)?;
        Ok(())
    }

    /// Queues our out-of-sync bitmap for `pd` to the peer.
    pub(super) fn send_bitmap(&self, inner: &mut ResourceInner, pd: PeerDeviceId) {
        let Some(device) = self.devices.get(&pd.volume) else {
            return;
        };
        let plane = self.plane_of(pd.conn);
        let total = device.bitmap.words();
        let mut offset = 0u64;
        let mut chunks = 0usize;
        loop {
            let count = (total - offset).min(BITMAP_CHUNK_WORDS as u64) as usize;
            let words = match device.bitmap.get_words(plane, offset, count) {
                Ok(w) => w,
                Err(e) => {
                    warn!(peer = %pd, offset, error = %e, "bitmap unreadable, sending all set");
                    vec![u64::MAX; count]
                }
            };
            let last = offset + count as u64 >= total;
            inner.queue(
                pd.conn,
                Packet::Bitmap {
                    volume: pd.volume,
                    offset,
                    words,
                    last,
                },
            );
            chunks += 1;
            if last {
                break;
            }
            offset += count as u64;
        }
        inner.pd(pd).bitmap_sent = true;
        debug!(peer = %pd, chunks, words = total, "bitmap sent");
    }

    /// Merges a bitmap chunk from the peer into our plane for it.
    pub(super) fn receive_bitmap(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        conn: ConnectionId,
        volume: VolumeId,
        offset: u64,
        words: &[u64],
        last: bool,
    ) -> ReplResult<()> {
        let device = self.device(volume)?;
        let pd = PeerDeviceId::new(conn, volume);
        let repl = inner.states.repl(pd);
        if !matches!(repl, ReplState::WfBitmapS | ReplState::WfBitmapT) {
            return Err(ReplError::Protocol {
                conn,
                msg: format!("bitmap for {} in {:?}", volume, repl),
            });
        }
        let merged = {
            let guard = device.bitmap.lock("receive bitmap", BmLockFlags::NONE, Some(conn.0));
            guard
                .merge_words(self.plane_of(conn), offset, words)
                .map_err(|e| ReplError::Protocol {
                    conn,
                    msg: format!("bad bitmap chunk at word {}: {}", offset, e),
                })?
        };
        fx.flush_bitmap.insert(volume);
        if last {
            inner.pd(pd).bitmap_received = true;
            fx.followups.push(Followup::Exchange(pd));
            debug!(peer = %pd, merged, "bitmap received");
        }
        Ok(())
    }

    /// Advances `pd` once bitmaps went both ways.
    pub(super) fn check_bitmap_exchange(&self, pd: PeerDeviceId) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            let done = inner
                .pds
                .get(&pd)
                .map(|rt| rt.bitmap_sent && rt.bitmap_received)
                .unwrap_or(false);
            if !done {
                return;
            }
            let next = match inner.states.repl(pd) {
                ReplState::WfBitmapS => ReplState::SyncSource,
                ReplState::WfBitmapT => ReplState::WfSyncUuid,
                _ => return,
            };
            let result = self.change_locked(&mut inner, &mut fx, ChangeFlags::NONE, |s| {
                if let Some(p) = s.peer_devices.get_mut(&pd) {
                    p.repl = next;
                }
            });
            match result {
                Ok(()) if next == ReplState::SyncSource => {
                    inner.queue(pd.conn, Packet::SyncUuid { volume: pd.volume });
                }
                Ok(()) => {}
                Err(e) => warn!(peer = %pd, error = %e, "cannot leave bitmap exchange"),
            }
        }
        self.run_effects(fx);
    }

    /// The source is ready: start pulling.
    pub(super) fn receive_sync_uuid(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        conn: ConnectionId,
        volume: VolumeId,
    ) -> ReplResult<()> {
        self.device(volume)?;
        let pd = PeerDeviceId::new(conn, volume);
        let repl = inner.states.repl(pd);
        if !matches!(repl, ReplState::WfSyncUuid | ReplState::WfBitmapT) {
            debug!(peer = %pd, repl = ?repl, "sync uuid ignored");
            return Ok(());
        }
        self.change_locked(inner, fx, ChangeFlags::NONE, |s| {
            if let Some(p) = s.peer_devices.get_mut(&pd) {
                p.repl = ReplState::SyncTarget;
            }
        })?;
        Ok(())
    }

    /// Keepalive: pings idle connections, times out silent ones, resends
    /// the hello while connecting and reconnects unconnected ones.
    pub fn ping_tick(&self, now: Instant) {
        let interval = Duration::from_millis(self.config.net.ping_interval_ms);
        let timeout = Duration::from_millis(self.config.net.ping_timeout_ms);
        let fx = Effects::default();
        let mut lost = Vec::new();
        let mut reconnect = Vec::new();
        {
            let mut inner = self.inner.lock();
            for conn in self.connection_ids() {
                match inner.states.cstate(conn) {
                    ConnState::Unconnected => reconnect.push(conn),
                    ConnState::Connecting => self.send_hello(&mut inner, conn),
                    ConnState::Connected => {
                        let rt = inner.conn(conn);
                        if let Some(sent) = rt.ping_sent_at {
                            if now.saturating_duration_since(sent) >= timeout {
                                lost.push(conn);
                            }
                            continue;
                        }
                        let idle = rt
                            .last_received
                            .map(|t| now.saturating_duration_since(t) >= interval)
                            .unwrap_or(true);
                        if idle {
                            rt.ping_sent_at = Some(now);
                            inner.queue(conn, Packet::Ping);
                            if let Some(c) = self.connections.get(&conn) {
                                c.set_flag(CONN_PING_SENT);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        self.run_effects(fx);
        for conn in lost {
            self.connection_lost(conn, ConnState::Timeout);
        }
        for conn in reconnect {
            if let Err(e) = self.connect(conn) {
                debug!(conn = %conn, error = %e, "reconnect failed");
            }
        }
    }

    /// The peer answered our ping.
    pub(super) fn receive_ping_ack(&self, inner: &mut ResourceInner, conn: ConnectionId) {
        inner.conn(conn).ping_sent_at = None;
        if let Some(c) = self.connections.get(&conn) {
            c.clear_flag(CONN_PING_SENT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(disk: DiskState, primary: bool, weight: u64, node_id: u32) -> SyncSide {
        SyncSide {
            disk,
            primary,
            weight,
            node_id,
            gen: GenerationIds::just_created(),
        }
    }

    #[test]
    fn test_decide_clean_peers() {
        let d = decide(
            side(DiskState::UpToDate, true, 0, 1),
            side(DiskState::UpToDate, false, 0, 2),
        );
        assert_eq!(d.repl, ReplState::Established);
        assert!(!d.full);
    }

    #[test]
    fn test_decide_inconsistent_target_full_sync() {
        let d = decide(
            side(DiskState::UpToDate, true, 0, 1),
            side(DiskState::Inconsistent, false, 0, 2),
        );
        assert_eq!(d, SyncDecision { repl: ReplState::WfBitmapS, full: true });
        let d = decide(
            side(DiskState::Inconsistent, false, 0, 2),
            side(DiskState::UpToDate, true, 0, 1),
        );
        assert_eq!(d, SyncDecision { repl: ReplState::WfBitmapT, full: true });
    }

    #[test]
    fn test_decide_primary_wins_ties() {
        let d = decide(
            side(DiskState::UpToDate, false, 10, 1),
            side(DiskState::UpToDate, true, 3, 2),
        );
        assert_eq!(d, SyncDecision { repl: ReplState::WfBitmapT, full: false });
    }

    #[test]
    fn test_decide_weight_then_node() {
        let d = decide(
            side(DiskState::UpToDate, false, 10, 2),
            side(DiskState::UpToDate, false, 3, 1),
        );
        assert_eq!(d.repl, ReplState::WfBitmapS);
        let d = decide(
            side(DiskState::UpToDate, false, 5, 2),
            side(DiskState::UpToDate, false, 5, 1),
        );
        assert_eq!(d.repl, ReplState::WfBitmapT);
    }

    #[test]
    fn test_decide_no_usable_pair() {
        let d = decide(
            side(DiskState::Diskless, true, 0, 1),
            side(DiskState::UpToDate, false, 7, 2),
        );
        assert_eq!(d.repl, ReplState::Established);
        let d = decide(
            side(DiskState::Inconsistent, false, 7, 1),
            side(DiskState::Inconsistent, false, 7, 2),
        );
        assert_eq!(d.repl, ReplState::Established);
    }

    #[test]
    fn test_decide_newer_generation_is_source() {
        let mut newer = side(DiskState::UpToDate, false, 4, 2);
        newer.gen.new_current(77);
        let older = side(DiskState::UpToDate, true, 0, 1);
        assert_eq!(decide(newer, older), SyncDecision { repl: ReplState::WfBitmapS, full: false });
        assert_eq!(decide(older, newer), SyncDecision { repl: ReplState::WfBitmapT, full: false });

        // a generation found only in history means the bitmap is not enough
        newer.gen.clear_bitmap();
        newer.gen.new_current(78);
        newer.gen.clear_bitmap();
        let d = decide(older, newer);
        assert_eq!(d, SyncDecision { repl: ReplState::WfBitmapT, full: true });
    }

    #[test]
    fn test_decide_inconsistent_newer_side_is_not_source() {
        let mut newer = side(DiskState::Inconsistent, false, 0, 2);
        newer.gen.new_current(77);
        let older = side(DiskState::UpToDate, false, 0, 1);
        let d = decide(older, newer);
        assert_eq!(d, SyncDecision { repl: ReplState::WfBitmapS, full: true });
    }

    #[test]
    fn test_decide_outdated_peer_resyncs_bitmap() {
        let d = decide(
            side(DiskState::UpToDate, false, 0, 1),
            side(DiskState::Outdated, false, 0, 2),
        );
        assert_eq!(d, SyncDecision { repl: ReplState::WfBitmapS, full: false });
    }
}
