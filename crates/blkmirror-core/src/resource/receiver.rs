//! Inbound packet dispatch.

use std::time::Instant;

use tracing::{debug, trace, warn};

use super::{Effects, Followup, LocalIo, Resource, ResourceInner};
use crate::error::{IoFailure, ReplError, ReplResult};
use crate::lower::LowerOp;
use crate::state::{ChangeFlags, ConnState, DiskState, ReplState};
use crate::transfer_log::{Dagtag, RequestEvent};
use crate::transport::Packet;
use crate::types::{ConnectionId, PeerDeviceId, SectorSpan, VolumeId, SECTOR_SIZE};

impl Resource {
    /// Feeds a packet received on `conn`.
    ///
    /// A packet that breaks the protocol takes the connection down with
    /// `ProtocolError`; the error is returned as well.
    pub fn receive(&self, conn: ConnectionId, packet: Packet) -> ReplResult<()> {
        self.connection(conn)?;
        let mut fx = Effects::default();
        let result = {
            let mut inner = self.inner.lock();
            let cstate = inner.states.cstate(conn);
            let hello = matches!(packet, Packet::Handshake { .. });
            if cstate <= ConnState::Disconnecting || (cstate < ConnState::Connecting && !hello) {
                trace!(conn = %conn, kind = packet.kind(), cstate = ?cstate, "packet dropped");
                return Ok(());
            }
            inner.conn(conn).last_received = Some(Instant::now());
            self.dispatch(&mut inner, &mut fx, conn, packet)
        };
        if let Err(e) = &result {
            warn!(resource = %self.name, conn = %conn, error = %e, "protocol error");
            fx.followups.push(Followup::Lost(conn, ConnState::ProtocolError));
        }
        self.run_effects(fx);
        result
    }

    fn dispatch(&self, inner: &mut ResourceInner, fx: &mut Effects, conn: ConnectionId, packet: Packet) -> ReplResult<()> {
        trace!(conn = %conn, kind = packet.kind(), "receive");
        match packet {
            Packet::Handshake {
                node_id,
                pro_version,
                protocol,
                role,
                volumes,
            } => self.receive_handshake(inner, fx, conn, node_id, pro_version, protocol, role, volumes),
            Packet::State {
                role,
                volume,
                disk,
                repl,
                resync_susp,
            } => self.receive_state(inner, fx, conn, role, volume, disk, repl, resync_susp),
            Packet::Bitmap {
                volume,
                offset,
                words,
                last,
            } => self.receive_bitmap(inner, fx, conn, volume, offset, &words, last),
            Packet::SyncUuid { volume } => self.receive_sync_uuid(inner, fx, conn, volume),
            Packet::Data {
                volume,
                dagtag,
                sector,
                data,
            } => self.receive_data(inner, fx, conn, volume, dagtag, sector, data),
            Packet::Barrier { nr } => {
                let connection = self.connection(conn)?;
                for ack in connection.epochs.got_barrier(nr) {
                    inner.queue(
                        conn,
                        Packet::BarrierAck {
                            nr: ack.barrier_nr,
                            set_size: ack.set_size,
                        },
                    );
                }
                Ok(())
            }
            Packet::BarrierAck { nr, set_size } => {
                let out = inner.tl.release(conn, nr, set_size)?;
                self.apply_tl_outcome(inner, out, fx);
                self.maybe_stop_ahead(inner, fx, conn);
                Ok(())
            }
            Packet::RecvAck { dagtag, .. } => self.ack(inner, fx, dagtag, RequestEvent::RecvAcked(conn)),
            Packet::WriteAck { dagtag, .. } => self.ack(inner, fx, dagtag, RequestEvent::WriteAcked(conn)),
            Packet::NegAck { volume, dagtag } => {
                warn!(conn = %conn, volume = %volume, dagtag, "peer failed a write");
                self.ack(inner, fx, dagtag, RequestEvent::NegAcked(conn))
            }
            Packet::OutOfSync { volume, sector, sectors } => {
                let device = self.device(volume)?;
                device
                    .bitmap
                    .set_out_of_sync(self.plane_of(conn), SectorSpan::new(sector, sectors))?;
                Ok(())
            }
            Packet::PeerAck { dagtag } => {
                let rt = inner.conn(conn);
                rt.peer_acked_dagtag = rt.peer_acked_dagtag.max(dagtag);
                Ok(())
            }
            Packet::DataRequest {
                volume,
                id,
                sector,
                sectors,
            } => {
                let device = self.device(volume)?;
                let span = SectorSpan::new(sector, sectors);
                if inner.states.disk(volume) != DiskState::UpToDate || span.end() > device.data_sectors {
                    inner.queue(conn, Packet::NegDReply { volume, id });
                } else {
                    self.submit_lower(inner, fx, volume, sector, LowerOp::Read { sectors }, LocalIo::PeerRead { conn, volume, id });
                }
                Ok(())
            }
            Packet::DataReply { id, data, .. } => {
                if inner.reads.get(&id).and_then(|r| r.remote) == Some(conn) {
                    self.finish_read(inner, id, Ok(data), fx);
                }
                Ok(())
            }
            Packet::NegDReply { id, .. } => {
                if inner.reads.get(&id).and_then(|r| r.remote) == Some(conn) {
                    self.finish_read(inner, id, Err(IoFailure::Peer(conn)), fx);
                }
                Ok(())
            }
            Packet::RsDataRequest { volume, sector, sectors } => {
                self.handle_rs_request(inner, fx, conn, volume, SectorSpan::new(sector, sectors), None)
            }
            Packet::CsumRsRequest {
                volume,
                sector,
                sectors,
                digest,
            } => self.handle_rs_request(inner, fx, conn, volume, SectorSpan::new(sector, sectors), Some(digest)),
            Packet::RsDataReply { volume, sector, data } => self.receive_rs_data(inner, fx, conn, volume, sector, data),
            Packet::RsIsInSync { volume, sector, sectors } => {
                self.target_rs_done(inner, conn, volume, SectorSpan::new(sector, sectors), true)
            }
            Packet::NegRsDReply { volume, sector, sectors } => {
                self.target_rs_done(inner, conn, volume, SectorSpan::new(sector, sectors), false)
            }
            Packet::RsWriteAck { volume, sector, sectors } => {
                self.source_rs_acked(inner, conn, volume, SectorSpan::new(sector, sectors), true)
            }
            Packet::RsNegAck { volume, sector, sectors } => {
                self.source_rs_acked(inner, conn, volume, SectorSpan::new(sector, sectors), false)
            }
            Packet::OvRequest {
                volume,
                sector,
                sectors,
                digest,
            } => self.receive_ov_request(inner, fx, conn, volume, SectorSpan::new(sector, sectors), digest),
            Packet::OvReply {
                volume,
                sector,
                sectors,
                in_sync,
            } => self.receive_ov_reply(inner, conn, volume, SectorSpan::new(sector, sectors), in_sync),
            Packet::Ping => {
                inner.queue(conn, Packet::PingAck);
                Ok(())
            }
            Packet::PingAck => {
                self.receive_ping_ack(inner, conn);
                Ok(())
            }
        }
    }

    fn ack(&self, inner: &mut ResourceInner, fx: &mut Effects, dagtag: Dagtag, event: RequestEvent) -> ReplResult<()> {
        let out = inner.tl.mod_request(dagtag, event);
        self.apply_tl_outcome(inner, out, fx);
        Ok(())
    }

    /// A replicated write from the primary.
    #[allow(clippy::too_many_arguments)]
    fn receive_data(
        &self,
        inner: &mut ResourceInner,
        fx: &mut Effects,
        conn: ConnectionId,
        volume: VolumeId,
        dagtag: Dagtag,
        sector: u64,
        data: bytes::Bytes,
    ) -> ReplResult<()> {
        let device = self.device(volume)?;
        let connection = self.connection(conn)?;
        if data.is_empty() || data.len() as u64 % SECTOR_SIZE != 0 {
            return Err(ReplError::Protocol {
                conn,
                msg: format!("write of {} bytes", data.len()),
            });
        }
        let span = SectorSpan::from_bytes(sector, data.len() as u64);
        let epoch = connection.epochs.add_request();
        if !inner.states.disk(volume).is_usable() || span.end() > device.data_sectors {
            debug!(conn = %conn, volume = %volume, dagtag, "refusing replicated write");
            inner.queue(conn, Packet::NegAck { volume, dagtag });
            for ack in connection.epochs.put(&epoch) {
                inner.queue(
                    conn,
                    Packet::BarrierAck {
                        nr: ack.barrier_nr,
                        set_size: ack.set_size,
                    },
                );
            }
            return Ok(());
        }
        if inner.protocol_of(conn).unwrap_or(self.config.net.protocol) == crate::types::Protocol::B {
            inner.queue(conn, Packet::RecvAck { volume, dagtag });
        }
        let iv = inner.next_id();
        if let Some(set) = inner.write_iv.get_mut(&volume) {
            set.insert(iv, span);
        }
        self.submit_lower(
            inner,
            fx,
            volume,
            sector,
            LowerOp::Write { data },
            LocalIo::PeerWrite {
                conn,
                volume,
                span,
                dagtag,
                epoch,
                iv,
            },
        );
        Ok(())
    }

    /// Leaves `Ahead` once every write sent to `conn` is acknowledged.
    fn maybe_stop_ahead(&self, inner: &mut ResourceInner, fx: &mut Effects, conn: ConnectionId) {
        if inner.tl.in_flight_sectors(conn) > 0 {
            return;
        }
        let ahead: Vec<PeerDeviceId> = inner
            .states
            .peer_devices_of(conn)
            .filter(|(_, p)| p.repl == ReplState::Ahead)
            .map(|(pd, _)| *pd)
            .collect();
        if ahead.is_empty() {
            return;
        }
        debug!(conn = %conn, "congestion cleared, resyncing");
        let result = self.change_locked(inner, fx, ChangeFlags::NONE, |s| {
            for pd in &ahead {
                if let Some(p) = s.peer_devices.get_mut(pd) {
                    p.repl = ReplState::SyncSource;
                }
            }
        });
        if let Err(e) = result {
            warn!(conn = %conn, error = %e, "cannot leave ahead");
        }
    }
}
