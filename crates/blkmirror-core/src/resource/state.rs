//! Committing state changes and their after-effects.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::{
    Effects, Followup, Resource, ResourceInner, CONN_CONGESTED, CONN_HANDSHAKE_SENT, CONN_PING_SENT,
};
use crate::error::{IoFailure, ReplResult, StateChangeError};
use crate::events::StateEvent;
use crate::generation::fresh_id;
use crate::resync::ResyncRun;
use crate::state::sanitize::sanitize;
use crate::state::validate::{validate, ValidateContext};
use crate::state::{ChangeFlags, ConnState, DiskState, ReplState, Role, StateVector};
use crate::transport::Packet;
use crate::types::{ConnectionId, PeerDeviceId};

impl Resource {
    /// Sanitizes and validates `staged` against the committed states and,
    /// if accepted, swaps it in and collects the after-effects.
    pub(crate) fn commit_staged(
        &self,
        inner: &mut ResourceInner,
        mut staged: StateVector,
        flags: ChangeFlags,
        handshake: bool,
        fx: &mut Effects,
    ) -> Result<(), StateChangeError> {
        sanitize(&inner.states, &mut staged);
        let ctx = ValidateContext {
            flags,
            handshake,
            allow_two_primaries: self.config.allow_two_primaries,
            fencing: self.fencing.as_ref(),
        };
        if let Err(e) = validate(&inner.states, &staged, &ctx) {
            if flags.contains(ChangeFlags::VERBOSE) {
                warn!(resource = %self.name, flags = %flags, error = %e, "state change rejected");
            } else {
                debug!(resource = %self.name, flags = %flags, error = %e, "state change rejected");
            }
            return Err(e);
        }
        if staged == inner.states {
            return Ok(());
        }
        let old = std::mem::replace(&mut inner.states, staged);
        self.after_state_change(inner, &old, flags, fx);
        Ok(())
    }

    /// Stages a change with `stage` and commits it, lock held.
    pub(super) fn change_locked(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        flags: ChangeFlags,
        stage: impl FnOnce(&mut StateVector),
    ) -> Result<(), StateChangeError> {
        let mut staged = inner.states.clone();
        stage(&mut staged);
        self.commit_staged(inner, staged, flags, false, fx)
    }

    /// Takes the request lock, commits a change and runs its effects.
    pub(super) fn change(
        &self,
        flags: ChangeFlags,
        stage: impl FnOnce(&mut StateVector),
    ) -> Result<(), StateChangeError> {
        let mut fx = Effects::default();
        let result = {
            let mut inner = self.inner.lock();
            self.change_locked(&mut inner, &mut fx, flags, stage)
        };
        self.run_effects(fx);
        result
    }

    fn after_state_change(
        &self,
        inner: &mut ResourceInner,
        old: &StateVector,
        flags: ChangeFlags,
        fx: &mut Effects,
    ) {
        let new = inner.states.clone();
        self.collect_events(old, &new, fx);
        self.maybe_new_generation(old, &new);

        for (conn, cs) in &new.connections {
            if old.cstate(*conn) >= ConnState::Connecting && cs.cstate < ConnState::Connecting {
                self.tl_clear_locked(inner, *conn, fx);
            }
        }
        if !flags.contains(ChangeFlags::LOCAL_ONLY) {
            self.announce(inner, old, &new);
        }
        let now = Instant::now();
        for (pd, p) in &new.peer_devices {
            let from = old.repl(*pd);
            if from != p.repl {
                self.repl_changed(inner, *pd, from, p.repl, now, fx);
            }
        }
        for (volume, d) in &new.devices {
            if matches!(d.disk, DiskState::Failed | DiskState::Detaching) {
                fx.followups.push(Followup::DetachCheck(*volume));
            }
        }
    }

    /// A primary that goes on without one of its peers starts a new data
    /// generation on every up-to-date disk.
    fn maybe_new_generation(&self, old: &StateVector, new: &StateVector) {
        if new.resource.role != Role::Primary || new.connections.is_empty() {
            return;
        }
        let promoted_alone = old.resource.role != Role::Primary
            && new.connections.values().any(|c| c.cstate != ConnState::Connected);
        let lost_peer = old.resource.role == Role::Primary
            && new
                .connections
                .iter()
                .any(|(conn, c)| old.cstate(*conn) == ConnState::Connected && c.cstate != ConnState::Connected);
        if !promoted_alone && !lost_peer {
            return;
        }
        for device in self.devices.values() {
            if new.disk(device.volume) != DiskState::UpToDate {
                continue;
            }
            let mut gen = device.generation.lock();
            gen.new_current(fresh_id());
            info!(volume = %device.volume, current = gen.current, bitmap = gen.bitmap, "new data generation");
        }
    }

    fn collect_events(&self, old: &StateVector, new: &StateVector, fx: &mut Effects) {
        let resource = self.name.as_str();
        if old.resource.role != new.resource.role {
            info!(resource, old = ?old.resource.role, new = ?new.resource.role, "role changed");
            fx.events.push(StateEvent::RoleChanged {
                old: old.resource.role,
                new: new.resource.role,
            });
        }
        if old.resource.suspended() != new.resource.suspended() {
            info!(resource, suspended = new.resource.suspended(), "I/O suspension changed");
            fx.events.push(StateEvent::SuspendChanged {
                suspended: new.resource.suspended(),
            });
        }
        for (volume, d) in &new.devices {
            let was = old.disk(*volume);
            if was != d.disk {
                info!(resource, volume = %volume, old = ?was, new = ?d.disk, "disk state changed");
                fx.events.push(StateEvent::DiskChanged {
                    volume: *volume,
                    old: was,
                    new: d.disk,
                });
            }
        }
        for (conn, c) in &new.connections {
            let was = old.connections.get(conn).cloned().unwrap_or_default();
            if was.cstate != c.cstate {
                info!(resource, conn = %conn, old = ?was.cstate, new = ?c.cstate, "connection state changed");
                fx.events.push(StateEvent::ConnChanged {
                    conn: *conn,
                    old: was.cstate,
                    new: c.cstate,
                });
            }
            if was.peer_role != c.peer_role {
                fx.events.push(StateEvent::PeerRoleChanged {
                    conn: *conn,
                    old: was.peer_role,
                    new: c.peer_role,
                });
            }
        }
        for (pd, p) in &new.peer_devices {
            let was = old.peer_devices.get(pd).cloned().unwrap_or_default();
            if was.repl != p.repl {
                info!(resource, peer = %pd, old = ?was.repl, new = ?p.repl, "replication state changed");
                fx.events.push(StateEvent::ReplChanged {
                    peer: *pd,
                    old: was.repl,
                    new: p.repl,
                });
            }
            if was.peer_disk != p.peer_disk {
                debug!(resource, peer = %pd, old = ?was.peer_disk, new = ?p.peer_disk, "peer disk state changed");
                fx.events.push(StateEvent::PeerDiskChanged {
                    peer: *pd,
                    old: was.peer_disk,
                    new: p.peer_disk,
                });
            }
        }
    }

    /// Tells connected peers about changes they care about.
    fn announce(&self, inner: &mut ResourceInner, old: &StateVector, new: &StateVector) {
        let role = new.resource.role;
        for (conn, cs) in &new.connections {
            if cs.cstate != ConnState::Connected {
                continue;
            }
            let fresh = old.cstate(*conn) != ConnState::Connected;
            let mut sent = false;
            for (pd, p) in new.peer_devices_of(*conn) {
                let changed = fresh
                    || old.disk(pd.volume) != new.disk(pd.volume)
                    || old
                        .peer_devices
                        .get(pd)
                        .map(|o| o.repl != p.repl || o.resync_susp_user != p.resync_susp_user)
                        .unwrap_or(true);
                if changed {
                    inner.queue(
                        *conn,
                        Packet::State {
                            role,
                            volume: Some(pd.volume),
                            disk: Some(new.disk(pd.volume)),
                            repl: Some(p.repl),
                            resync_susp: Some(p.resync_susp_user),
                        },
                    );
                    sent = true;
                }
            }
            if !sent && (fresh || old.resource.role != role) {
                inner.queue(
                    *conn,
                    Packet::State {
                        role,
                        volume: None,
                        disk: None,
                        repl: None,
                        resync_susp: None,
                    },
                );
            }
        }
    }

    /// Resync, verify and bitmap exchange bookkeeping of one peer device.
    fn repl_changed(
        &self,
        inner: &mut ResourceInner,
        pd: PeerDeviceId,
        from: ReplState,
        to: ReplState,
        now: Instant,
        fx: &mut Effects,
    ) {
        let Some(device) = self.devices.get(&pd.volume) else {
            return;
        };
        let plane = self.plane_of(pd.conn);
        let left = device.bitmap.total_weight(plane);

        if from.is_resync() && !to.is_resync() {
            let failed = inner.pd(pd).resync.as_ref().map(|run| run.rs_failed).unwrap_or(0);
            if to == ReplState::Established && left == 0 && failed == 0 {
                self.resync_done_generation(inner, pd, from.is_sync_target());
            }
            if let Some(run) = inner.pd(pd).resync.take() {
                info!(
                    peer = %pd,
                    rs_total = run.rs_total,
                    rs_failed = run.rs_failed,
                    left,
                    "resync finished"
                );
                fx.events.push(StateEvent::ResyncFinished {
                    peer: pd,
                    rs_total: run.rs_total,
                    rs_failed: run.rs_failed,
                    rs_same_csum: run.rs_same_csum,
                    duration_ms: run.elapsed(now).as_millis() as u64,
                });
            }
            inner.pd(pd).deferred.clear();
            device.al.lock().rs_cancel_all(plane);
            fx.flush_bitmap.insert(pd.volume);
        }
        if to.is_resync() && !from.is_resync() {
            info!(peer = %pd, bits = left, source = to.is_sync_source(), "resync started");
            let mut run = ResyncRun::new(left, &self.config.resync, now);
            if matches!(to, ReplState::PausedSyncS | ReplState::PausedSyncT) {
                run.pause(now);
            }
            inner.pd(pd).resync = Some(run);
        }
        match (from, to) {
            (ReplState::SyncSource, ReplState::PausedSyncS)
            | (ReplState::SyncTarget, ReplState::PausedSyncT) => {
                if let Some(run) = inner.pd(pd).resync.as_mut() {
                    run.pause(now);
                }
            }
            (ReplState::PausedSyncS, ReplState::SyncSource)
            | (ReplState::PausedSyncT, ReplState::SyncTarget) => {
                if let Some(run) = inner.pd(pd).resync.as_mut() {
                    run.resume(now, left);
                }
            }
            _ => {}
        }

        if from.is_verify() && !to.is_verify() {
            if let Some(verify) = inner.pd(pd).verify.take() {
                info!(peer = %pd, verified = verify.verified, out_of_sync = verify.out_of_sync, "online verify finished");
                fx.events.push(StateEvent::VerifyFinished {
                    peer: pd,
                    verified: verify.verified,
                    out_of_sync: verify.out_of_sync,
                });
            }
            fx.flush_bitmap.insert(pd.volume);
        }

        if to == ReplState::Off || (from.is_starting() && !to.is_starting()) {
            let rt = inner.pd(pd);
            rt.bitmap_sent = false;
            rt.bitmap_received = false;
        }
        if matches!(to, ReplState::WfBitmapS | ReplState::WfBitmapT)
            && !matches!(from, ReplState::WfBitmapS | ReplState::WfBitmapT)
        {
            self.send_bitmap(inner, pd);
            fx.followups.push(Followup::Exchange(pd));
        }
        if from == ReplState::Ahead && to != ReplState::Ahead {
            if let Some(c) = self.connections.get(&pd.conn) {
                c.clear_flag(CONN_CONGESTED);
            }
        }
    }

    /// A clean resync ended. The target takes over the source's generation;
    /// the source forgets its bitmap base once no peer is behind.
    fn resync_done_generation(&self, inner: &mut ResourceInner, pd: PeerDeviceId, target: bool) {
        let Some(device) = self.devices.get(&pd.volume) else {
            return;
        };
        if target {
            let theirs = inner
                .conn(pd.conn)
                .peer_hello
                .as_ref()
                .and_then(|(_, volumes)| volumes.iter().find(|v| v.volume == pd.volume).map(|v| v.gen));
            if let Some(theirs) = theirs {
                device.generation.lock().adopt(&theirs);
            }
            return;
        }
        let behind = (0..device.bitmap.planes()).any(|plane| device.bitmap.total_weight(plane) > 0);
        if !behind {
            device.generation.lock().clear_bitmap();
        }
    }

    /// Connection `conn` went away: fails its pending requests, drops its
    /// epochs and queued packets, and fails reads it was serving.
    pub(super) fn tl_clear_locked(&self, inner: &mut ResourceInner, conn: ConnectionId, fx: &mut Effects) {
        let out = inner.tl.clear(conn);
        self.apply_tl_outcome(inner, out, fx);
        let dropped = self
            .connections
            .get(&conn)
            .map(|c| {
                c.clear_flag(CONN_CONGESTED | CONN_PING_SENT | CONN_HANDSHAKE_SENT);
                c.epochs.cleanup()
            })
            .unwrap_or(0);
        inner.outq.retain(|(c, _)| *c != conn);
        if let Some(rt) = inner.conns.get_mut(&conn) {
            *rt = Default::default();
        }
        let reads: Vec<u64> = inner
            .reads
            .iter()
            .filter(|(_, r)| r.remote == Some(conn))
            .map(|(id, _)| *id)
            .collect();
        for id in reads {
            self.finish_read(inner, id, Err(IoFailure::ConnectionLost), fx);
        }
        for volume in self.devices.keys() {
            fx.flush_bitmap.insert(*volume);
        }
        warn!(resource = %self.name, conn = %conn, epochs = dropped, "connection cleared");
    }

    /// Clears the transfer log of `conn` after a connection loss.
    pub fn tl_clear(&self, conn: ConnectionId) -> ReplResult<()> {
        self.connection(conn)?;
        let mut fx = Effects::default();
        self.tl_clear_locked(&mut self.inner.lock(), conn, &mut fx);
        self.run_effects(fx);
        Ok(())
    }

    /// Changes the local role. Promotion is subject to the soft checks
    /// unless `force` is set.
    pub fn set_role(&self, role: Role, force: bool) -> ReplResult<()> {
        let flags = if force {
            ChangeFlags::HARD | ChangeFlags::VERBOSE
        } else {
            ChangeFlags::VERBOSE
        };
        self.change(flags, |s| s.resource.role = role)?;
        Ok(())
    }

    /// Suspends application I/O; new requests wait until resumed.
    pub fn suspend_io(&self) -> ReplResult<()> {
        self.change(ChangeFlags::NONE, |s| s.resource.susp = true)?;
        Ok(())
    }

    /// Resumes application I/O.
    pub fn resume_io(&self) -> ReplResult<()> {
        self.change(ChangeFlags::NONE, |s| s.resource.susp = false)?;
        Ok(())
    }
}
