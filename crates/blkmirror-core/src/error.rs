//! Error types for the replication core.

use blkmirror_meta::MetaError;
use thiserror::Error;

use crate::state::{ConnState, DiskState, ReplState};
use crate::types::{ConnectionId, PeerDeviceId, VolumeId};

/// Result type alias for replication core operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Why a requested state change was refused. Nothing was mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateChangeError {
    /// The change names a connection the resource does not have.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The change names a volume the resource does not have.
    #[error("unknown volume {0}")]
    UnknownVolume(VolumeId),

    /// The change names a peer device that does not exist.
    #[error("unknown peer device {0}")]
    UnknownPeerDevice(PeerDeviceId),

    /// The disk state cannot move from `from` to `to`.
    #[error("{volume}: illegal disk state transition {from:?} -> {to:?}")]
    IllegalDiskTransition {
        /// The volume.
        volume: VolumeId,
        /// Committed disk state.
        from: DiskState,
        /// Requested disk state.
        to: DiskState,
    },

    /// A peer device would leave `Off` without a sync handshake having
    /// reconciled the bitmaps.
    #[error("{peer}: {from:?} -> {to:?} without bitmap reconciliation")]
    NoBitmapReconcile {
        /// The peer device.
        peer: PeerDeviceId,
        /// Committed repl state.
        from: ReplState,
        /// Requested repl state.
        to: ReplState,
    },

    /// A repl state above `Off` needs an established connection.
    #[error("{peer}: repl state {repl:?} needs a connection (cstate {cstate:?})")]
    NeedConnection {
        /// The peer device.
        peer: PeerDeviceId,
        /// Requested repl state.
        repl: ReplState,
        /// Connection state.
        cstate: ConnState,
    },

    /// Resync or verify cannot run without a usable local disk.
    #[error("{peer}: cannot resync with local disk {disk:?}")]
    SyncingDiskless {
        /// The peer device.
        peer: PeerDeviceId,
        /// Local disk state.
        disk: DiskState,
    },

    /// Promotion needs an up-to-date disk, locally or on a connected peer.
    #[error("no up-to-date disk")]
    NoUpToDateDisk,

    /// Promotion while a connected peer is primary.
    #[error("peer {0} is primary and two primaries are not allowed")]
    TwoPrimaries(ConnectionId),

    /// The fencing policy refused the promotion.
    #[error("fencing policy refused: {0}")]
    FencingRefused(String),

    /// A disk is attaching or negotiating.
    #[error("{0} is in a transient disk state")]
    InTransientState(VolumeId),

    /// The connection is already stand-alone.
    #[error("{0} is already stand-alone")]
    AlreadyStandAlone(ConnectionId),
}

impl StateChangeError {
    /// Whether forcing (`HARD`) can override this rejection.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            StateChangeError::NoUpToDateDisk
                | StateChangeError::TwoPrimaries(_)
                | StateChangeError::FencingRefused(_)
                | StateChangeError::InTransientState(_)
                | StateChangeError::AlreadyStandAlone(_)
        )
    }
}

/// Errors from the out-of-sync bitmap.
#[derive(Debug, Error)]
pub enum BitmapError {
    /// The bitmap is locked for a bulk operation that forbids this access.
    #[error("bitmap locked by \"{why}\", {op} not allowed")]
    Locked {
        /// Reason recorded by the lock holder.
        why: String,
        /// The refused operation.
        op: &'static str,
    },

    /// A bit index beyond the end of the bitmap.
    #[error("bit {bit} out of range ({bits} bits)")]
    OutOfRange {
        /// The offending bit.
        bit: u64,
        /// Bits per plane.
        bits: u64,
    },

    /// No such bitmap plane.
    #[error("no bitmap plane {0}")]
    NoSuchPlane(u32),

    /// Persisting or loading the bitmap failed.
    #[error("bitmap I/O: {0}")]
    Meta(#[from] MetaError),
}

/// Errors from the activity log.
#[derive(Debug, Error)]
pub enum AlError {
    /// Every slot is pinned; the caller has to wait for a `complete_io`.
    #[error("activity log full: all {0} extents in use")]
    NoFreeSlot(usize),

    /// A resync extent covering the region refuses new writes.
    #[error("extent {enr} locked by resync")]
    ResyncLocked {
        /// The bitmap (resync) extent.
        enr: u64,
    },

    /// Too many changes staged for one transaction.
    #[error("too many pending activity log updates")]
    TooManyPending,

    /// Activity logging is suspended.
    #[error("activity log suspended")]
    Suspended,

    /// The operation needs an idle activity log.
    #[error("activity log busy: {0} extents in use")]
    NotIdle(usize),

    /// The on-disk log cannot be replayed.
    #[error("activity log corrupt: {0}")]
    Corrupt(String),

    /// Writing or reading a transaction failed.
    #[error("activity log I/O: {0}")]
    Meta(#[from] MetaError),
}

/// Errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The link is gone.
    #[error("connection {0} is down")]
    Disconnected(ConnectionId),

    /// The packet could not be handed to the link.
    #[error("send to {conn} failed: {msg}")]
    Send {
        /// The connection.
        conn: ConnectionId,
        /// Description.
        msg: String,
    },
}

/// Why an upstream I/O failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoFailure {
    /// The local disk failed and no peer took the write.
    #[error("local disk error")]
    LocalDisk,

    /// A peer refused or failed the request.
    #[error("peer {0} error")]
    Peer(ConnectionId),

    /// The connection was lost before the peer acknowledged.
    #[error("connection lost")]
    ConnectionLost,

    /// Neither a local disk nor a peer could serve the request.
    #[error("no usable disk")]
    NoUsableDisk,
}

/// Top-level error type of the replication core.
#[derive(Debug, Error)]
pub enum ReplError {
    /// A state change was rejected.
    #[error("state change rejected: {0}")]
    State(#[from] StateChangeError),

    /// Bitmap error.
    #[error(transparent)]
    Bitmap(#[from] BitmapError),

    /// Activity log error.
    #[error(transparent)]
    ActivityLog(#[from] AlError),

    /// Metadata I/O error.
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An upstream I/O failed.
    #[error("I/O failed: {0}")]
    Io(#[from] IoFailure),

    /// Unknown volume.
    #[error("unknown volume {0}")]
    UnknownVolume(VolumeId),

    /// Unknown connection.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Unknown peer device.
    #[error("unknown peer device {0}")]
    UnknownPeerDevice(PeerDeviceId),

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The peer violated the protocol.
    #[error("protocol error on {conn}: {msg}")]
    Protocol {
        /// The connection.
        conn: ConnectionId,
        /// Description.
        msg: String,
    },

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The resource is shutting down.
    #[error("resource shut down")]
    Shutdown,
}
