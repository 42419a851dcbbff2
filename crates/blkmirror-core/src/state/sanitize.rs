//! Implied side effects of a staged state change.
//!
//! Applied to the staged copy before validation so that the validated state
//! is the one that gets committed.

use super::{ConnState, DiskState, ReplState, Role, StateVector};

/// Rewrites `new` so that it carries every state implied by the requested
/// change relative to `old`.
pub fn sanitize(old: &StateVector, new: &mut StateVector) {
    // lost connections take their peer devices down
    let down: Vec<_> = new
        .connections
        .iter()
        .filter(|(_, c)| c.cstate < ConnState::Connected)
        .map(|(id, _)| *id)
        .collect();
    for conn in &down {
        if let Some(c) = new.connections.get_mut(conn) {
            c.peer_role = Role::Unknown;
        }
    }

    let volumes_disk: Vec<_> = new.devices.iter().map(|(v, d)| (*v, d.disk)).collect();
    let mut force_inconsistent = Vec::new();

    for (id, pd) in new.peer_devices.iter_mut() {
        if down.contains(&id.conn) {
            pd.repl = ReplState::Off;
        }
        if pd.repl == ReplState::Off {
            pd.peer_disk = DiskState::Unknown;
            pd.resync_susp_peer = false;
            continue;
        }

        let disk = volumes_disk
            .iter()
            .find(|(v, _)| *v == id.volume)
            .map(|(_, d)| *d)
            .unwrap_or_default();
        if disk <= DiskState::Failed && pd.repl.is_transfer() {
            pd.repl = ReplState::Established;
        }

        let suspended = pd.resync_suspended();
        pd.repl = match pd.repl {
            ReplState::SyncSource if suspended => ReplState::PausedSyncS,
            ReplState::SyncTarget if suspended => ReplState::PausedSyncT,
            ReplState::PausedSyncS if !suspended => ReplState::SyncSource,
            ReplState::PausedSyncT if !suspended => ReplState::SyncTarget,
            other => other,
        };

        let old_repl = old.repl(*id);
        if pd.repl.is_sync_source() && !old_repl.is_sync_source() && pd.peer_disk > DiskState::Inconsistent
        {
            pd.peer_disk = DiskState::Inconsistent;
        }
        if pd.repl.is_sync_target() && !old_repl.is_sync_target() && disk > DiskState::Inconsistent {
            force_inconsistent.push(id.volume);
        }
    }

    for volume in force_inconsistent {
        if let Some(d) = new.devices.get_mut(&volume) {
            d.disk = DiskState::Inconsistent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ConnStates, DeviceStates, PeerDeviceStates};
    use crate::types::{ConnectionId, PeerDeviceId, VolumeId};

    fn pd() -> PeerDeviceId {
        PeerDeviceId::new(ConnectionId(1), VolumeId(0))
    }

    fn connected(repl: ReplState, disk: DiskState) -> StateVector {
        let mut sv = StateVector::default();
        sv.resource.role = Role::Primary;
        sv.connections.insert(
            ConnectionId(1),
            ConnStates {
                cstate: ConnState::Connected,
                peer_role: Role::Secondary,
            },
        );
        sv.devices.insert(VolumeId(0), DeviceStates { disk });
        sv.peer_devices.insert(
            pd(),
            PeerDeviceStates {
                repl,
                peer_disk: DiskState::UpToDate,
                ..Default::default()
            },
        );
        sv
    }

    #[test]
    fn test_connection_loss_forces_off() {
        let old = connected(ReplState::SyncSource, DiskState::UpToDate);
        let mut new = old.clone();
        new.connections.get_mut(&ConnectionId(1)).unwrap().cstate = ConnState::BrokenPipe;
        sanitize(&old, &mut new);
        assert_eq!(new.repl(pd()), ReplState::Off);
        assert_eq!(new.peer_disk(pd()), DiskState::Unknown);
        assert_eq!(new.connections[&ConnectionId(1)].peer_role, Role::Unknown);
    }

    #[test]
    fn test_failed_disk_stops_resync() {
        let old = connected(ReplState::SyncSource, DiskState::UpToDate);
        let mut new = old.clone();
        new.devices.get_mut(&VolumeId(0)).unwrap().disk = DiskState::Failed;
        sanitize(&old, &mut new);
        assert_eq!(new.repl(pd()), ReplState::Established);
        assert_eq!(new.resource.role, Role::Primary);
    }

    #[test]
    fn test_pause_and_resume() {
        let old = connected(ReplState::SyncSource, DiskState::UpToDate);
        let mut new = old.clone();
        new.peer_devices.get_mut(&pd()).unwrap().resync_susp_user = true;
        sanitize(&old, &mut new);
        assert_eq!(new.repl(pd()), ReplState::PausedSyncS);

        let old = new.clone();
        new.peer_devices.get_mut(&pd()).unwrap().resync_susp_user = false;
        sanitize(&old, &mut new);
        assert_eq!(new.repl(pd()), ReplState::SyncSource);
    }

    #[test]
    fn test_entering_sync_downgrades_disks() {
        let old = connected(ReplState::WfSyncUuid, DiskState::UpToDate);
        let mut new = old.clone();
        new.peer_devices.get_mut(&pd()).unwrap().repl = ReplState::SyncTarget;
        sanitize(&old, &mut new);
        assert_eq!(new.disk(VolumeId(0)), DiskState::Inconsistent);

        let old = connected(ReplState::WfBitmapS, DiskState::UpToDate);
        let mut new = old.clone();
        new.peer_devices.get_mut(&pd()).unwrap().repl = ReplState::SyncSource;
        sanitize(&old, &mut new);
        assert_eq!(new.peer_disk(pd()), DiskState::Inconsistent);
        assert_eq!(new.disk(VolumeId(0)), DiskState::UpToDate);
    }
}
