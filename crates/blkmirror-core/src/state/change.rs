//! The state change transaction.

use parking_lot::MutexGuard;

use super::{ChangeFlags, ConnState, DiskState, ReplState, Role, StateVector};
use crate::error::StateChangeError;
use crate::resource::{Resource, ResourceInner};
use crate::types::{ConnectionId, PeerDeviceId, VolumeId};

/// A staged change of the resource states.
///
/// Holds the request lock from [`Resource::begin_state_change`] until
/// [`commit`](Self::commit) or [`abort`](Self::abort); dropping it aborts.
/// Setters naming an entity the resource does not have make the commit fail
/// with the matching `Unknown*` error.
pub struct StateChange<'a> {
    resource: &'a Resource,
    guard: MutexGuard<'a, ResourceInner>,
    staged: StateVector,
    flags: ChangeFlags,
    handshake: bool,
    error: Option<StateChangeError>,
}

impl<'a> StateChange<'a> {
    pub(crate) fn new(
        resource: &'a Resource,
        guard: MutexGuard<'a, ResourceInner>,
        flags: ChangeFlags,
    ) -> Self {
        let staged = guard.states.clone();
        Self {
            resource,
            guard,
            staged,
            flags,
            handshake: false,
            error: None,
        }
    }

    /// Flags the change was started with.
    pub fn flags(&self) -> ChangeFlags {
        self.flags
    }

    /// The staged states as set so far (before sanitizing).
    pub fn staged(&self) -> &StateVector {
        &self.staged
    }

    /// The committed states.
    pub fn committed(&self) -> &StateVector {
        &self.guard.states
    }

    fn fail(&mut self, e: StateChangeError) {
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    /// Stages the local role.
    pub fn role(&mut self, role: Role) -> &mut Self {
        self.staged.resource.role = role;
        self
    }

    /// Stages the user suspend flag.
    pub fn susp(&mut self, susp: bool) -> &mut Self {
        self.staged.resource.susp = susp;
        self
    }

    /// Stages the local disk state of `volume`.
    pub fn disk(&mut self, volume: VolumeId, disk: DiskState) -> &mut Self {
        match self.staged.devices.get_mut(&volume) {
            Some(d) => d.disk = disk,
            None => self.fail(StateChangeError::UnknownVolume(volume)),
        }
        self
    }

    /// Stages the connection state of `conn`.
    pub fn cstate(&mut self, conn: ConnectionId, cstate: ConnState) -> &mut Self {
        match self.staged.connections.get_mut(&conn) {
            Some(c) => c.cstate = cstate,
            None => self.fail(StateChangeError::UnknownConnection(conn)),
        }
        self
    }

    /// Stages the role of the peer on `conn`.
    pub fn peer_role(&mut self, conn: ConnectionId, role: Role) -> &mut Self {
        match self.staged.connections.get_mut(&conn) {
            Some(c) => c.peer_role = role,
            None => self.fail(StateChangeError::UnknownConnection(conn)),
        }
        self
    }

    /// Stages the replication state of `pd`.
    pub fn repl(&mut self, pd: PeerDeviceId, repl: ReplState) -> &mut Self {
        match self.staged.peer_devices.get_mut(&pd) {
            Some(p) => p.repl = repl,
            None => self.fail(StateChangeError::UnknownPeerDevice(pd)),
        }
        self
    }

    /// Stages the peer disk state of `pd`.
    pub fn peer_disk(&mut self, pd: PeerDeviceId, disk: DiskState) -> &mut Self {
        match self.staged.peer_devices.get_mut(&pd) {
            Some(p) => p.peer_disk = disk,
            None => self.fail(StateChangeError::UnknownPeerDevice(pd)),
        }
        self
    }

    /// Stages the user resync-suspend flag of `pd`.
    pub fn resync_susp_user(&mut self, pd: PeerDeviceId, on: bool) -> &mut Self {
        match self.staged.peer_devices.get_mut(&pd) {
            Some(p) => p.resync_susp_user = on,
            None => self.fail(StateChangeError::UnknownPeerDevice(pd)),
        }
        self
    }

    /// Stages the peer resync-suspend flag of `pd`.
    pub fn resync_susp_peer(&mut self, pd: PeerDeviceId, on: bool) -> &mut Self {
        match self.staged.peer_devices.get_mut(&pd) {
            Some(p) => p.resync_susp_peer = on,
            None => self.fail(StateChangeError::UnknownPeerDevice(pd)),
        }
        self
    }

    /// Marks the change as the result of a sync handshake.
    pub(crate) fn handshake(&mut self) -> &mut Self {
        self.handshake = true;
        self
    }

    /// Sanitizes, validates and commits the staged states. On rejection
    /// nothing changes. After-state-change effects run once the request lock
    /// is released.
    pub fn commit(self) -> Result<(), StateChangeError> {
        let StateChange {
            resource,
            mut guard,
            staged,
            flags,
            handshake,
            error,
        } = self;
        if let Some(e) = error {
            return Err(e);
        }
        let mut fx = Default::default();
        let result = resource.commit_staged(&mut guard, staged, flags, handshake, &mut fx);
        drop(guard);
        resource.run_effects(fx);
        result
    }

    /// Discards the staged states.
    pub fn abort(self) {}
}

impl std::fmt::Debug for StateChange<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChange")
            .field("flags", &self.flags)
            .field("staged", &self.staged)
            .finish_non_exhaustive()
    }
}
