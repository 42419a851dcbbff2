#![warn(missing_docs)]

//! blkmirror replication core: replication state machine, transfer log, out-of-sync bitmap, activity log, resync
//!
//! A [`Resource`] mirrors one or more block volumes to its peers. Writes
//! are ordered by dagtag and grouped into epochs separated by barriers;
//! blocks a peer misses are tracked in a per-peer bitmap plane and brought
//! back by resync. The activity log bounds what has to be resynced after a
//! crash. Storage and network are collaborators behind the [`LowerDevice`]
//! and [`Transport`] traits; [`sim`] wires them up in memory.

pub mod activity_log;
pub mod bitmap;
pub mod config;
pub mod epoch;
pub mod error;
pub mod events;
pub mod fencing;
pub mod generation;
pub mod interval;
pub mod lower;
pub mod lru;
pub mod resource;
pub mod resync;
pub mod runner;
pub mod sim;
pub mod state;
pub mod transfer_log;
pub mod transport;
pub mod types;

pub use config::ResourceConfig;
pub use error::{ReplError, ReplResult};
pub use events::StateEvent;
pub use lower::{LowerDevice, MemDisk};
pub use resource::{AttachOptions, Collaborators, Resource, ResourceStatus, WriteFlags};
pub use runner::ResourceRunner;
pub use state::{ConnState, DiskState, ReplState, Role};
pub use transport::{Packet, Transport};
pub use types::{ConnectionId, PeerDeviceId, VolumeId};
