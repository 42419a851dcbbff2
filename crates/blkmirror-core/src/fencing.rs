//! Fencing policy consulted before promotion.

use serde::{Deserialize, Serialize};

use crate::state::{ConnState, DiskState, StateVector};
use crate::types::ConnectionId;

/// What a fencing policy sees when asked whether promotion may proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionView {
    /// Every local volume has an up-to-date disk.
    pub local_up_to_date: bool,
    /// Per configured connection: its state and the best peer disk state.
    pub peers: Vec<(ConnectionId, ConnState, DiskState)>,
}

impl PromotionView {
    /// Builds the view from a staged state vector.
    pub fn from_states(states: &StateVector) -> Self {
        let local_up_to_date = states
            .devices
            .values()
            .all(|d| d.disk == DiskState::UpToDate);
        let peers = states
            .connections
            .iter()
            .map(|(id, c)| {
                let best = states
                    .peer_devices_of(*id)
                    .map(|(_, pd)| pd.peer_disk)
                    .max()
                    .unwrap_or(DiskState::Unknown);
                (*id, c.cstate, best)
            })
            .collect();
        Self {
            local_up_to_date,
            peers,
        }
    }

    /// Connections that are not established.
    pub fn unreachable(&self) -> usize {
        self.peers
            .iter()
            .filter(|(_, c, _)| *c != ConnState::Connected)
            .count()
    }
}

/// Decides whether a promotion may go ahead.
pub trait FencingPolicy: Send + Sync {
    /// Returns false to refuse the promotion.
    fn may_promote(&self, view: &PromotionView) -> bool;
}

/// Never refuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DontCare;

impl FencingPolicy for DontCare {
    fn may_promote(&self, _view: &PromotionView) -> bool {
        true
    }
}

/// Refuses promotion while any configured peer is unreachable, unless the
/// local data is known to be current.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceOnly;

impl FencingPolicy for ResourceOnly {
    fn may_promote(&self, view: &PromotionView) -> bool {
        view.unreachable() == 0 || view.local_up_to_date
    }
}

/// Refuses promotion while any configured peer is unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceAndStonith;

impl FencingPolicy for ResourceAndStonith {
    fn may_promote(&self, view: &PromotionView) -> bool {
        view.unreachable() == 0
    }
}
