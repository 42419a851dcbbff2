//! Replication state machine: state axes, the committed state vector, and
//! the two-phase change transaction.
//!
//! Four state axes are tracked: the resource role, the local disk state per
//! volume, the connection state per peer, and the replication state per peer
//! device. Readers outside a transition only ever see the committed
//! [`StateVector`]. A change stages a full copy, [`sanitize`] applies implied
//! side effects, [`validate`] rejects illegal transitions with a typed
//! [`StateChangeError`](crate::error::StateChangeError), and only then is the
//! staged copy swapped in.

pub mod change;
pub mod sanitize;
pub mod validate;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, PeerDeviceId, VolumeId};

pub use change::StateChange;

/// Node role within the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Role {
    /// Not known (peer not connected).
    #[default]
    Unknown,
    /// May submit application I/O.
    Primary,
    /// Receives replicated writes only.
    Secondary,
}

/// State of a local (or peer) backing disk, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum DiskState {
    /// No backing disk.
    #[default]
    Diskless,
    /// Reading metadata and replaying the activity log.
    Attaching,
    /// Waiting for local I/O to drain before going diskless.
    Detaching,
    /// An I/O error was seen; the disk is not used any more.
    Failed,
    /// Attached, waiting for the peer handshake.
    Negotiating,
    /// Data is not usable (resync target, never synced).
    Inconsistent,
    /// Consistent but known to be older than a peer.
    Outdated,
    /// Peer disk of a disconnected peer.
    Unknown,
    /// Consistent, freshness unknown.
    Consistent,
    /// Consistent and current.
    UpToDate,
}

impl DiskState {
    /// Whether application and replicated I/O may use this disk.
    pub fn is_usable(self) -> bool {
        self >= DiskState::Inconsistent && self != DiskState::Unknown
    }

    /// Attaching or negotiating; role changes are refused meanwhile.
    pub fn is_transient(self) -> bool {
        matches!(self, DiskState::Attaching | DiskState::Negotiating)
    }
}

/// Connection state, ordered from idle to established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum ConnState {
    /// Not trying to connect.
    #[default]
    StandAlone,
    /// Tearing down on request.
    Disconnecting,
    /// Will connect when asked.
    Unconnected,
    /// Ping timeout.
    Timeout,
    /// Peer closed the link.
    BrokenPipe,
    /// Link error.
    NetworkFailure,
    /// Peer violated the protocol.
    ProtocolError,
    /// Tearing down after a failure.
    TearDown,
    /// Handshake in progress.
    Connecting,
    /// Established.
    Connected,
}

impl ConnState {
    /// Failure states reached when a link is lost.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ConnState::Timeout
                | ConnState::BrokenPipe
                | ConnState::NetworkFailure
                | ConnState::ProtocolError
                | ConnState::TearDown
        )
    }
}

/// Replication state of one peer device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum ReplState {
    /// No replication.
    #[default]
    Off,
    /// Connected and in sync.
    Established,
    /// Full sync requested locally, about to exchange bitmaps as source.
    StartingSyncS,
    /// Full sync requested locally, about to exchange bitmaps as target.
    StartingSyncT,
    /// Exchanging bitmaps, will become sync source.
    WfBitmapS,
    /// Exchanging bitmaps, will become sync target.
    WfBitmapT,
    /// Bitmap received, waiting for the source to start.
    WfSyncUuid,
    /// Sending resync data.
    SyncSource,
    /// Receiving resync data.
    SyncTarget,
    /// Online verify, driving side.
    VerifyS,
    /// Online verify, answering side.
    VerifyT,
    /// Resync source, paused.
    PausedSyncS,
    /// Resync target, paused.
    PausedSyncT,
    /// Congested: writes are only recorded out-of-sync.
    Ahead,
    /// Peer is ahead of us.
    Behind,
}

impl ReplState {
    /// Active or paused resync, either side.
    pub fn is_resync(self) -> bool {
        matches!(
            self,
            ReplState::SyncSource
                | ReplState::SyncTarget
                | ReplState::PausedSyncS
                | ReplState::PausedSyncT
        )
    }

    /// Resync source side (active or paused).
    pub fn is_sync_source(self) -> bool {
        matches!(self, ReplState::SyncSource | ReplState::PausedSyncS)
    }

    /// Resync target side (active or paused).
    pub fn is_sync_target(self) -> bool {
        matches!(self, ReplState::SyncTarget | ReplState::PausedSyncT)
    }

    /// Online verify, either side.
    pub fn is_verify(self) -> bool {
        matches!(self, ReplState::VerifyS | ReplState::VerifyT)
    }

    /// Bitmap exchange or resync start in progress.
    pub fn is_starting(self) -> bool {
        matches!(
            self,
            ReplState::StartingSyncS
                | ReplState::StartingSyncT
                | ReplState::WfBitmapS
                | ReplState::WfBitmapT
                | ReplState::WfSyncUuid
        )
    }

    /// States that need a local disk to run.
    pub fn needs_local_disk(self) -> bool {
        self.is_resync() || self.is_verify() || self.is_starting()
    }

    /// States from which a failed local disk falls back to `Established`.
    pub fn is_transfer(self) -> bool {
        self.needs_local_disk() || matches!(self, ReplState::Ahead | ReplState::Behind)
    }
}

/// Resource-level states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceStates {
    /// Local role.
    pub role: Role,
    /// Application I/O suspended by request.
    pub susp: bool,
    /// Suspended because no data is accessible.
    pub susp_nod: bool,
    /// Suspended by the fencing policy.
    pub susp_fen: bool,
}

impl ResourceStates {
    /// Any suspend flag set.
    pub fn suspended(&self) -> bool {
        self.susp || self.susp_nod || self.susp_fen
    }
}

/// Per-connection states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnStates {
    /// Connection state.
    pub cstate: ConnState,
    /// Role of the peer.
    pub peer_role: Role,
}

/// Per-volume states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceStates {
    /// Local disk state.
    pub disk: DiskState,
}

/// Per-peer-device states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PeerDeviceStates {
    /// Replication state.
    pub repl: ReplState,
    /// Disk state of the peer.
    pub peer_disk: DiskState,
    /// Resync paused by the local user.
    pub resync_susp_user: bool,
    /// Resync paused by the peer.
    pub resync_susp_peer: bool,
    /// Resync paused behind another resync.
    pub resync_susp_dependency: bool,
}

impl PeerDeviceStates {
    /// Any resync-suspend flag set.
    pub fn resync_suspended(&self) -> bool {
        self.resync_susp_user || self.resync_susp_peer || self.resync_susp_dependency
    }
}

/// Every state of a resource: the committed copy, or a staged copy inside a
/// [`StateChange`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StateVector {
    /// Resource states.
    pub resource: ResourceStates,
    /// Connection states.
    pub connections: BTreeMap<ConnectionId, ConnStates>,
    /// Local disk states.
    pub devices: BTreeMap<VolumeId, DeviceStates>,
    /// Peer device states.
    pub peer_devices: BTreeMap<PeerDeviceId, PeerDeviceStates>,
}

impl StateVector {
    /// Connection state of `conn`, `StandAlone` if unknown.
    pub fn cstate(&self, conn: ConnectionId) -> ConnState {
        self.connections
            .get(&conn)
            .map(|c| c.cstate)
            .unwrap_or_default()
    }

    /// Local disk state of `volume`, `Diskless` if unknown.
    pub fn disk(&self, volume: VolumeId) -> DiskState {
        self.devices
            .get(&volume)
            .map(|d| d.disk)
            .unwrap_or_default()
    }

    /// Replication state of `pd`, `Off` if unknown.
    pub fn repl(&self, pd: PeerDeviceId) -> ReplState {
        self.peer_devices
            .get(&pd)
            .map(|p| p.repl)
            .unwrap_or_default()
    }

    /// Peer disk state of `pd`, `Diskless` if unknown.
    pub fn peer_disk(&self, pd: PeerDeviceId) -> DiskState {
        self.peer_devices
            .get(&pd)
            .map(|p| p.peer_disk)
            .unwrap_or_default()
    }

    /// Peer devices belonging to `conn`.
    pub fn peer_devices_of(
        &self,
        conn: ConnectionId,
    ) -> impl Iterator<Item = (&PeerDeviceId, &PeerDeviceStates)> {
        self.peer_devices.iter().filter(move |(id, _)| id.conn == conn)
    }

    /// Whether application I/O may be admitted on `volume` given
    /// `agreed_pro_version(conn)`.
    ///
    /// Unstable while the disk attaches or negotiates and while a peer
    /// device waits for a bitmap or the sync start, except that a bitmap
    /// source on protocol 96 or later allows concurrent I/O.
    pub fn io_stable(&self, volume: VolumeId, agreed_pro_version: impl Fn(ConnectionId) -> u32) -> bool {
        if self.resource.suspended() {
            return false;
        }
        if matches!(
            self.disk(volume),
            DiskState::Attaching | DiskState::Negotiating | DiskState::Detaching
        ) {
            return false;
        }
        self.peer_devices
            .iter()
            .filter(|(id, _)| id.volume == volume)
            .all(|(id, pd)| match pd.repl {
                ReplState::WfBitmapT | ReplState::WfSyncUuid => false,
                ReplState::WfBitmapS => agreed_pro_version(id.conn) >= 96,
                _ => true,
            })
    }
}

/// Flags controlling a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeFlags(u32);

impl ChangeFlags {
    /// No flags.
    pub const NONE: ChangeFlags = ChangeFlags(0);
    /// Bypass soft validation.
    pub const HARD: ChangeFlags = ChangeFlags(0x1);
    /// Log rejections at warn level.
    pub const VERBOSE: ChangeFlags = ChangeFlags(0x2);
    /// Serialize with other cluster-wide changes (informational).
    pub const SERIALIZE: ChangeFlags = ChangeFlags(0x4);
    /// Do not tell peers about the change.
    pub const LOCAL_ONLY: ChangeFlags = ChangeFlags(0x8);

    /// Whether every flag in `other` is set.
    pub fn contains(self, other: ChangeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ChangeFlags {
    type Output = ChangeFlags;

    fn bitor(self, rhs: ChangeFlags) -> ChangeFlags {
        ChangeFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for ChangeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (ChangeFlags::HARD, "hard"),
            (ChangeFlags::VERBOSE, "verbose"),
            (ChangeFlags::SERIALIZE, "serialize"),
            (ChangeFlags::LOCAL_ONLY, "local-only"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        write!(f, "[{}]", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(DiskState::Diskless < DiskState::Failed);
        assert!(DiskState::Failed < DiskState::Inconsistent);
        assert!(DiskState::Consistent < DiskState::UpToDate);
        assert!(ConnState::Unconnected < ConnState::Connected);
        assert!(ConnState::NetworkFailure < ConnState::Connecting);
        assert!(ReplState::Off < ReplState::Established);
        assert!(ReplState::WfBitmapS < ReplState::WfBitmapT);
        assert!(ReplState::PausedSyncT < ReplState::Ahead);
    }

    #[test]
    fn test_disk_usable() {
        assert!(!DiskState::Failed.is_usable());
        assert!(!DiskState::Negotiating.is_usable());
        assert!(DiskState::Inconsistent.is_usable());
        assert!(DiskState::UpToDate.is_usable());
        assert!(!DiskState::Unknown.is_usable());
    }

    #[test]
    fn test_repl_classes() {
        assert!(ReplState::PausedSyncS.is_sync_source());
        assert!(ReplState::SyncTarget.is_resync());
        assert!(!ReplState::Established.needs_local_disk());
        assert!(ReplState::WfSyncUuid.needs_local_disk());
        assert!(ReplState::Ahead.is_transfer());
    }

    #[test]
    fn test_io_stable() {
        let mut sv = StateVector::default();
        let pd = PeerDeviceId::new(ConnectionId(1), VolumeId(0));
        sv.devices.insert(VolumeId(0), DeviceStates { disk: DiskState::UpToDate });
        sv.peer_devices.insert(pd, PeerDeviceStates::default());
        assert!(sv.io_stable(VolumeId(0), |_| 120));

        sv.peer_devices.get_mut(&pd).unwrap().repl = ReplState::WfBitmapS;
        assert!(sv.io_stable(VolumeId(0), |_| 120));
        assert!(!sv.io_stable(VolumeId(0), |_| 95));

        sv.peer_devices.get_mut(&pd).unwrap().repl = ReplState::WfSyncUuid;
        assert!(!sv.io_stable(VolumeId(0), |_| 120));

        sv.peer_devices.get_mut(&pd).unwrap().repl = ReplState::Established;
        sv.devices.get_mut(&VolumeId(0)).unwrap().disk = DiskState::Attaching;
        assert!(!sv.io_stable(VolumeId(0), |_| 120));

        sv.devices.get_mut(&VolumeId(0)).unwrap().disk = DiskState::UpToDate;
        sv.resource.susp = true;
        assert!(!sv.io_stable(VolumeId(0), |_| 120));
    }

    #[test]
    fn test_change_flags() {
        let flags = ChangeFlags::HARD | ChangeFlags::VERBOSE;
        assert!(flags.contains(ChangeFlags::HARD));
        assert!(!flags.contains(ChangeFlags::LOCAL_ONLY));
        assert_eq!(flags.to_string(), "[hard,verbose]");
    }
}
