//! Validation of a sanitized, staged state vector.
//!
//! Hard checks can never be bypassed. Soft checks are skipped when the
//! change carries [`ChangeFlags::HARD`].

use super::{ChangeFlags, ConnState, DiskState, ReplState, Role, StateVector};
use crate::error::StateChangeError;
use crate::fencing::{FencingPolicy, PromotionView};

/// Inputs to validation besides the two state vectors.
pub struct ValidateContext<'a> {
    /// Change flags.
    pub flags: ChangeFlags,
    /// The change was produced by a sync handshake, which reconciles bitmaps.
    pub handshake: bool,
    /// Two primaries are allowed.
    pub allow_two_primaries: bool,
    /// Consulted on promotion.
    pub fencing: &'a dyn FencingPolicy,
}

/// Whether the local disk may move from `from` to `to`.
pub fn disk_transition_allowed(from: DiskState, to: DiskState) -> bool {
    if from == to {
        return true;
    }
    match from {
        DiskState::Failed => matches!(to, DiskState::Diskless | DiskState::Detaching),
        DiskState::Diskless => to == DiskState::Attaching,
        DiskState::Attaching => matches!(
            to,
            DiskState::Negotiating
                | DiskState::Failed
                | DiskState::Diskless
                | DiskState::Inconsistent
                | DiskState::Outdated
                | DiskState::Consistent
                | DiskState::UpToDate
        ),
        DiskState::Detaching => matches!(to, DiskState::Diskless | DiskState::Failed),
        _ => to != DiskState::Unknown,
    }
}

/// Checks `new` against `old`. Returns the first violated rule.
pub fn validate(
    old: &StateVector,
    new: &StateVector,
    ctx: &ValidateContext<'_>,
) -> Result<(), StateChangeError> {
    validate_hard(old, new, ctx)?;
    if !ctx.flags.contains(ChangeFlags::HARD) {
        validate_soft(old, new, ctx)?;
    }
    Ok(())
}

fn validate_hard(
    old: &StateVector,
    new: &StateVector,
    ctx: &ValidateContext<'_>,
) -> Result<(), StateChangeError> {
    for (volume, d) in &new.devices {
        let from = old.disk(*volume);
        if !disk_transition_allowed(from, d.disk) {
            return Err(StateChangeError::IllegalDiskTransition {
                volume: *volume,
                from,
                to: d.disk,
            });
        }
    }

    for (id, pd) in &new.peer_devices {
        if !new.connections.contains_key(&id.conn) {
            return Err(StateChangeError::UnknownConnection(id.conn));
        }
        if !new.devices.contains_key(&id.volume) {
            return Err(StateChangeError::UnknownVolume(id.volume));
        }

        let from = old.repl(*id);
        if from == ReplState::Off && pd.repl != ReplState::Off && !ctx.handshake {
            return Err(StateChangeError::NoBitmapReconcile {
                peer: *id,
                from,
                to: pd.repl,
            });
        }

        let cstate = new.cstate(id.conn);
        if pd.repl != ReplState::Off && cstate != ConnState::Connected {
            return Err(StateChangeError::NeedConnection {
                peer: *id,
                repl: pd.repl,
                cstate,
            });
        }

        let disk = new.disk(id.volume);
        if pd.repl.needs_local_disk() && disk < DiskState::Inconsistent {
            return Err(StateChangeError::SyncingDiskless { peer: *id, disk });
        }
    }
    Ok(())
}

fn validate_soft(
    old: &StateVector,
    new: &StateVector,
    ctx: &ValidateContext<'_>,
) -> Result<(), StateChangeError> {
    let promoting = old.resource.role != Role::Primary && new.resource.role == Role::Primary;
    let role_changed = old.resource.role != new.resource.role;

    if role_changed {
        if let Some((volume, _)) = new.devices.iter().find(|(_, d)| d.disk.is_transient()) {
            return Err(StateChangeError::InTransientState(*volume));
        }
    }

    if promoting {
        for volume in new.devices.keys() {
            let local = new.disk(*volume) == DiskState::UpToDate;
            let remote = new.peer_devices.iter().any(|(id, pd)| {
                id.volume == *volume
                    && new.cstate(id.conn) == ConnState::Connected
                    && pd.peer_disk == DiskState::UpToDate
            });
            if !local && !remote {
                return Err(StateChangeError::NoUpToDateDisk);
            }
        }

        if !ctx.allow_two_primaries {
            if let Some((conn, _)) = new
                .connections
                .iter()
                .find(|(_, c)| c.cstate == ConnState::Connected && c.peer_role == Role::Primary)
            {
                return Err(StateChangeError::TwoPrimaries(*conn));
            }
        }

        if !ctx.fencing.may_promote(&PromotionView::from_states(new)) {
            return Err(StateChangeError::FencingRefused(
                "promotion refused by fencing policy".to_string(),
            ));
        }
    }

    for (conn, c) in &new.connections {
        if old.cstate(*conn) == ConnState::StandAlone && c.cstate == ConnState::Disconnecting {
            return Err(StateChangeError::AlreadyStandAlone(*conn));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fencing::{DontCare, ResourceAndStonith};
    use crate::state::{ConnStates, DeviceStates, PeerDeviceStates};
    use crate::types::{ConnectionId, PeerDeviceId, VolumeId};

    fn pd() -> PeerDeviceId {
        PeerDeviceId::new(ConnectionId(1), VolumeId(0))
    }

    fn base(disk: DiskState, cstate: ConnState) -> StateVector {
        let mut sv = StateVector::default();
        sv.resource.role = Role::Secondary;
        sv.connections.insert(
            ConnectionId(1),
            ConnStates {
                cstate,
                peer_role: Role::Secondary,
            },
        );
        sv.devices.insert(VolumeId(0), DeviceStates { disk });
        sv.peer_devices.insert(pd(), PeerDeviceStates::default());
        sv
    }

    fn ctx(flags: ChangeFlags, handshake: bool) -> ValidateContext<'static> {
        ValidateContext {
            flags,
            handshake,
            allow_two_primaries: false,
            fencing: &DontCare,
        }
    }

    #[test]
    fn test_disk_transitions() {
        assert!(disk_transition_allowed(DiskState::Failed, DiskState::Diskless));
        assert!(!disk_transition_allowed(DiskState::Failed, DiskState::UpToDate));
        assert!(!disk_transition_allowed(DiskState::Diskless, DiskState::UpToDate));
        assert!(disk_transition_allowed(DiskState::Diskless, DiskState::Attaching));
        assert!(disk_transition_allowed(DiskState::Attaching, DiskState::UpToDate));
        assert!(disk_transition_allowed(DiskState::UpToDate, DiskState::Failed));
        assert!(disk_transition_allowed(DiskState::UpToDate, DiskState::Inconsistent));
    }

    #[test]
    fn test_illegal_disk_transition_is_hard() {
        let old = base(DiskState::Failed, ConnState::StandAlone);
        let mut new = old.clone();
        new.devices.get_mut(&VolumeId(0)).unwrap().disk = DiskState::UpToDate;
        let err = validate(&old, &new, &ctx(ChangeFlags::HARD, false)).unwrap_err();
        assert!(matches!(err, StateChangeError::IllegalDiskTransition { .. }));
    }

    #[test]
    fn test_off_to_established_needs_handshake() {
        let old = base(DiskState::UpToDate, ConnState::Connected);
        let mut new = old.clone();
        new.peer_devices.get_mut(&pd()).unwrap().repl = ReplState::Established;
        let err = validate(&old, &new, &ctx(ChangeFlags::HARD, false)).unwrap_err();
        assert!(matches!(err, StateChangeError::NoBitmapReconcile { .. }));
        assert!(validate(&old, &new, &ctx(ChangeFlags::NONE, true)).is_ok());
    }

    #[test]
    fn test_repl_needs_connection() {
        let old = base(DiskState::UpToDate, ConnState::Connecting);
        let mut new = old.clone();
        new.peer_devices.get_mut(&pd()).unwrap().repl = ReplState::Established;
        let err = validate(&old, &new, &ctx(ChangeFlags::NONE, true)).unwrap_err();
        assert!(matches!(err, StateChangeError::NeedConnection { .. }));
    }

    #[test]
    fn test_syncing_diskless() {
        let mut old = base(DiskState::Diskless, ConnState::Connected);
        old.peer_devices.get_mut(&pd()).unwrap().repl = ReplState::Established;
        let mut new = old.clone();
        new.peer_devices.get_mut(&pd()).unwrap().repl = ReplState::SyncTarget;
        let err = validate(&old, &new, &ctx(ChangeFlags::NONE, false)).unwrap_err();
        assert!(matches!(err, StateChangeError::SyncingDiskless { .. }));
    }

    #[test]
    fn test_promotion_needs_up_to_date() {
        let old = base(DiskState::Inconsistent, ConnState::StandAlone);
        let mut new = old.clone();
        new.resource.role = Role::Primary;
        let err = validate(&old, &new, &ctx(ChangeFlags::NONE, false)).unwrap_err();
        assert_eq!(err, StateChangeError::NoUpToDateDisk);
        assert!(validate(&old, &new, &ctx(ChangeFlags::HARD, false)).is_ok());
    }

    #[test]
    fn test_two_primaries() {
        let mut old = base(DiskState::UpToDate, ConnState::Connected);
        old.connections.get_mut(&ConnectionId(1)).unwrap().peer_role = Role::Primary;
        let mut new = old.clone();
        new.resource.role = Role::Primary;
        let err = validate(&old, &new, &ctx(ChangeFlags::NONE, false)).unwrap_err();
        assert_eq!(err, StateChangeError::TwoPrimaries(ConnectionId(1)));
        let allow = ValidateContext {
            allow_two_primaries: true,
            ..ctx(ChangeFlags::NONE, false)
        };
        assert!(validate(&old, &new, &allow).is_ok());
    }

    #[test]
    fn test_fencing_refuses() {
        let old = base(DiskState::UpToDate, ConnState::Unconnected);
        let mut new = old.clone();
        new.resource.role = Role::Primary;
        let fenced = ValidateContext {
            fencing: &ResourceAndStonith,
            ..ctx(ChangeFlags::NONE, false)
        };
        let err = validate(&old, &new, &fenced).unwrap_err();
        assert!(matches!(err, StateChangeError::FencingRefused(_)));
    }

    #[test]
    fn test_transient_state_blocks_role_change() {
        let old = base(DiskState::Attaching, ConnState::StandAlone);
        let mut new = old.clone();
        new.resource.role = Role::Primary;
        let err = validate(&old, &new, &ctx(ChangeFlags::NONE, false)).unwrap_err();
        assert_eq!(err, StateChangeError::InTransientState(VolumeId(0)));
    }

    #[test]
    fn test_already_standalone() {
        let old = base(DiskState::UpToDate, ConnState::StandAlone);
        let mut new = old.clone();
        new.connections.get_mut(&ConnectionId(1)).unwrap().cstate = ConnState::Disconnecting;
        let err = validate(&old, &new, &ctx(ChangeFlags::NONE, false)).unwrap_err();
        assert_eq!(err, StateChangeError::AlreadyStandAlone(ConnectionId(1)));
    }
}
