//! Network transport collaborator.
//!
//! The core hands packets to a [`Transport`] and is fed inbound packets
//! through [`Resource::receive`](crate::resource::Resource::receive). The
//! transport must deliver reliably and in order per connection and report
//! link loss explicitly. Framing and encoding are the transport's business;
//! [`Packet`] is serde-serializable for that purpose.

use std::collections::VecDeque;

use blkmirror_meta::Digest;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::generation::GenerationIds;
use crate::state::{DiskState, ReplState, Role};
use crate::types::{ConnectionId, Protocol, VolumeId};

/// Per-volume part of the connection handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHandshake {
    /// The volume.
    pub volume: VolumeId,
    /// Sender's local disk state.
    pub disk: DiskState,
    /// Bits the sender has out of sync for the receiver.
    pub weight: u64,
    /// Sender's data generation ids.
    pub gen: GenerationIds,
}

/// Everything exchanged between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Connection handshake.
    Handshake {
        /// Sender's node id.
        node_id: u32,
        /// Highest protocol version the sender speaks.
        pro_version: u32,
        /// Sender's replication protocol.
        protocol: Protocol,
        /// Sender's role.
        role: Role,
        /// Per-volume state.
        volumes: Vec<VolumeHandshake>,
    },
    /// State announcement after a local change.
    State {
        /// Sender's role.
        role: Role,
        /// The volume, if the packet carries volume states.
        volume: Option<VolumeId>,
        /// Sender's local disk state of that volume.
        disk: Option<DiskState>,
        /// Sender's replication state towards the receiver.
        repl: Option<ReplState>,
        /// Whether the sender's user paused the resync with the receiver.
        resync_susp: Option<bool>,
    },
    /// A chunk of the sender's out-of-sync bitmap for the receiver.
    Bitmap {
        /// The volume.
        volume: VolumeId,
        /// Offset in 64-bit words.
        offset: u64,
        /// Bitmap words.
        words: Vec<u64>,
        /// Final chunk.
        last: bool,
    },
    /// Bitmap exchange finished on the source; the target may start.
    SyncUuid {
        /// The volume.
        volume: VolumeId,
    },
    /// Replicated application write.
    Data {
        /// The volume.
        volume: VolumeId,
        /// Request id on the sender.
        dagtag: u64,
        /// First sector.
        sector: u64,
        /// Payload.
        data: Bytes,
    },
    /// Closes epoch `nr` on the receiver.
    Barrier {
        /// Barrier number.
        nr: u32,
    },
    /// Every write of epoch `nr` is durable on the receiver.
    BarrierAck {
        /// Barrier number.
        nr: u32,
        /// Writes in the epoch.
        set_size: u32,
    },
    /// Protocol B acknowledgement.
    RecvAck {
        /// The volume.
        volume: VolumeId,
        /// Request id.
        dagtag: u64,
    },
    /// Protocol C acknowledgement.
    WriteAck {
        /// The volume.
        volume: VolumeId,
        /// Request id.
        dagtag: u64,
    },
    /// The receiver failed the write.
    NegAck {
        /// The volume.
        volume: VolumeId,
        /// Request id.
        dagtag: u64,
    },
    /// A range written while not replicating (Ahead).
    OutOfSync {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
    },
    /// Every request up to `dagtag` is durable on all peers.
    PeerAck {
        /// Newest fully acknowledged request.
        dagtag: u64,
    },
    /// Application read served by the peer.
    DataRequest {
        /// The volume.
        volume: VolumeId,
        /// Read id.
        id: u64,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
    },
    /// Answer to a `DataRequest`.
    DataReply {
        /// The volume.
        volume: VolumeId,
        /// Read id.
        id: u64,
        /// Payload.
        data: Bytes,
    },
    /// The peer could not serve a `DataRequest`.
    NegDReply {
        /// The volume.
        volume: VolumeId,
        /// Read id.
        id: u64,
    },
    /// Resync target asks for a range.
    RsDataRequest {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
    },
    /// Resync target asks for a range unless the checksum matches.
    CsumRsRequest {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
        /// Digest of the target's data.
        digest: Digest,
    },
    /// Resync data.
    RsDataReply {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Payload.
        data: Bytes,
    },
    /// The checksums matched; nothing to transfer.
    RsIsInSync {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
    },
    /// The source could not read the range.
    NegRsDReply {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
    },
    /// The target wrote resync data.
    RsWriteAck {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
    },
    /// The target failed to write resync data.
    RsNegAck {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
    },
    /// Online verify request.
    OvRequest {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
        /// Digest of the source's data.
        digest: Digest,
    },
    /// Online verify answer.
    OvReply {
        /// The volume.
        volume: VolumeId,
        /// First sector.
        sector: u64,
        /// Length.
        sectors: u64,
        /// Digests matched.
        in_sync: bool,
    },
    /// Keep-alive.
    Ping,
    /// Keep-alive answer.
    PingAck,
}

impl Packet {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Handshake { .. } => "handshake",
            Packet::State { .. } => "state",
            Packet::Bitmap { .. } => "bitmap",
            Packet::SyncUuid { .. } => "sync-uuid",
            Packet::Data { .. } => "data",
            Packet::Barrier { .. } => "barrier",
            Packet::BarrierAck { .. } => "barrier-ack",
            Packet::RecvAck { .. } => "recv-ack",
            Packet::WriteAck { .. } => "write-ack",
            Packet::NegAck { .. } => "neg-ack",
            Packet::OutOfSync { .. } => "out-of-sync",
            Packet::PeerAck { .. } => "peer-ack",
            Packet::DataRequest { .. } => "data-request",
            Packet::DataReply { .. } => "data-reply",
            Packet::NegDReply { .. } => "neg-dreply",
            Packet::RsDataRequest { .. } => "rs-data-request",
            Packet::CsumRsRequest { .. } => "csum-rs-request",
            Packet::RsDataReply { .. } => "rs-data-reply",
            Packet::RsIsInSync { .. } => "rs-is-in-sync",
            Packet::NegRsDReply { .. } => "neg-rs-dreply",
            Packet::RsWriteAck { .. } => "rs-write-ack",
            Packet::RsNegAck { .. } => "rs-neg-ack",
            Packet::OvRequest { .. } => "ov-request",
            Packet::OvReply { .. } => "ov-reply",
            Packet::Ping => "ping",
            Packet::PingAck => "ping-ack",
        }
    }
}

/// Outbound side of the network.
pub trait Transport: Send + Sync {
    /// Queues `packet` on `conn`. Must not block on the peer.
    fn send(&self, conn: ConnectionId, packet: Packet) -> Result<(), TransportError>;
}

/// Transport that records every packet; for tests.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<VecDeque<(ConnectionId, Packet)>>,
    down: Mutex<Vec<ConnectionId>>,
}

impl RecordingTransport {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sends on `conn` fail (or succeed again).
    pub fn set_down(&self, conn: ConnectionId, down: bool) {
        let mut list = self.down.lock();
        list.retain(|c| *c != conn);
        if down {
            list.push(conn);
        }
    }

    /// Removes and returns everything sent so far.
    pub fn take(&self) -> Vec<(ConnectionId, Packet)> {
        self.sent.lock().drain(..).collect()
    }

    /// Number of packets recorded and not yet taken.
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    /// Nothing recorded.
    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, conn: ConnectionId, packet: Packet) -> Result<(), TransportError> {
        if self.down.lock().contains(&conn) {
            return Err(TransportError::Disconnected(conn));
        }
        self.sent.lock().push_back((conn, packet));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_transport() {
        let t = RecordingTransport::new();
        t.send(ConnectionId(1), Packet::Ping).unwrap();
        t.send(ConnectionId(1), Packet::Barrier { nr: 3 }).unwrap();
        assert_eq!(t.len(), 2);
        let sent = t.take();
        assert_eq!(sent[1], (ConnectionId(1), Packet::Barrier { nr: 3 }));
        assert!(t.is_empty());
    }

    #[test]
    fn test_recording_transport_down() {
        let t = RecordingTransport::new();
        t.set_down(ConnectionId(2), true);
        assert_eq!(
            t.send(ConnectionId(2), Packet::Ping),
            Err(TransportError::Disconnected(ConnectionId(2)))
        );
        t.set_down(ConnectionId(2), false);
        assert!(t.send(ConnectionId(2), Packet::Ping).is_ok());
    }

    #[test]
    fn test_packet_bincode_roundtrip() {
        let p = Packet::Data {
            volume: VolumeId(0),
            dagtag: 42,
            sector: 8,
            data: Bytes::from(vec![7u8; 512]),
        };
        let encoded = bincode::serialize(&p).unwrap();
        let decoded: Packet = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decoded.kind(), "data");
    }
}
