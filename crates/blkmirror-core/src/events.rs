//! State change notifications.
//!
//! Every committed transition and a few engine milestones are published on a
//! broadcast channel so that an external layer can relay them to management
//! tooling.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::{ConnState, DiskState, ReplState, Role};
use crate::types::{ConnectionId, PeerDeviceId, VolumeId};

/// A structured notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateEvent {
    /// The local role changed.
    RoleChanged {
        /// Previous role.
        old: Role,
        /// New role.
        new: Role,
    },
    /// The resource was suspended or resumed.
    SuspendChanged {
        /// Whether application I/O is now suspended.
        suspended: bool,
    },
    /// A local disk state changed.
    DiskChanged {
        /// The volume.
        volume: VolumeId,
        /// Previous state.
        old: DiskState,
        /// New state.
        new: DiskState,
    },
    /// A connection state changed.
    ConnChanged {
        /// The connection.
        conn: ConnectionId,
        /// Previous state.
        old: ConnState,
        /// New state.
        new: ConnState,
    },
    /// A peer's role changed.
    PeerRoleChanged {
        /// The connection.
        conn: ConnectionId,
        /// Previous role.
        old: Role,
        /// New role.
        new: Role,
    },
    /// A replication state changed.
    ReplChanged {
        /// The peer device.
        peer: PeerDeviceId,
        /// Previous state.
        old: ReplState,
        /// New state.
        new: ReplState,
    },
    /// A peer disk state changed.
    PeerDiskChanged {
        /// The peer device.
        peer: PeerDeviceId,
        /// Previous state.
        old: DiskState,
        /// New state.
        new: DiskState,
    },
    /// A resync run ended.
    ResyncFinished {
        /// The peer device.
        peer: PeerDeviceId,
        /// Bits out of sync when the run started.
        rs_total: u64,
        /// Bits that could not be resynced.
        rs_failed: u64,
        /// Bits skipped because checksums matched.
        rs_same_csum: u64,
        /// Wall time of the run, pauses excluded.
        duration_ms: u64,
    },
    /// An online verify run ended.
    VerifyFinished {
        /// The peer device.
        peer: PeerDeviceId,
        /// Blocks compared.
        verified: u64,
        /// Blocks found to differ.
        out_of_sync: u64,
    },
    /// A local I/O error downgraded a disk.
    IoError {
        /// The volume.
        volume: VolumeId,
    },
    /// Both sides wrote independently; the connection went standalone.
    SplitBrain {
        /// The peer device.
        peer: PeerDeviceId,
    },
}

/// Broadcast hub for [`StateEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<StateEvent>,
    published: AtomicU64,
}

impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per slow receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: StateEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(event);
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.sender.subscribe()
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(StateEvent::RoleChanged {
            old: Role::Secondary,
            new: Role::Primary,
        });
        let ev = rx.recv().await.unwrap();
        assert_eq!(
            ev,
            StateEvent::RoleChanged {
                old: Role::Secondary,
                new: Role::Primary
            }
        );
        assert_eq!(bus.published(), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(StateEvent::IoError { volume: VolumeId(0) });
        assert_eq!(bus.published(), 1);
    }

    #[test]
    fn test_event_serializes() {
        let ev = StateEvent::ResyncFinished {
            peer: PeerDeviceId::new(ConnectionId(1), VolumeId(0)),
            rs_total: 10,
            rs_failed: 0,
            rs_same_csum: 2,
            duration_ms: 5,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: StateEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
