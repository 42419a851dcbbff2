//! Property tests over the transfer log, the activity log and resync.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use blkmirror_core::activity_log::ActivityLog;
use blkmirror_core::bitmap::Bitmap;
use blkmirror_core::sim::SimCluster;
use blkmirror_core::transfer_log::{Dagtag, NewRequest, PeerPlan, PeerState, RequestEvent, TransferLog};
use blkmirror_core::transport::Packet;
use blkmirror_core::types::{
    ConnectionId, PeerDeviceId, Protocol, SectorSpan, VolumeId, WriteOrdering, AL_BITS_PER_EXT,
    AL_SECT_PER_EXT,
};
use bytes::Bytes;
use proptest::prelude::*;

const C1: ConnectionId = ConnectionId(1);

fn request(sector: u64, sectors: u64, local: bool, protocol: Protocol, barrier: bool) -> NewRequest {
    NewRequest {
        volume: VolumeId(0),
        span: SectorSpan::new(sector, sectors),
        data: Bytes::from(vec![0u8; (sectors * 512) as usize]),
        local,
        peers: vec![PeerPlan::Replicate { conn: C1, protocol }],
        barrier,
        waiter: None,
    }
}

fn barrier_numbers(packets: &[Packet]) -> Vec<u32> {
    packets
        .iter()
        .filter_map(|p| match p {
            Packet::Barrier { nr } => Some(*nr),
            _ => None,
        })
        .collect()
}

fn epoch_sizes(tl: &TransferLog, dagtags: &[Dagtag]) -> BTreeMap<u32, u32> {
    let mut sizes = BTreeMap::new();
    for d in dagtags {
        if let Some(slot) = tl.get(*d).and_then(|r| r.peer(C1)) {
            *sizes.entry(slot.epoch).or_insert(0) += 1;
        }
    }
    sizes
}

proptest! {
    #[test]
    fn prop_dagtags_strictly_increase(sizes in prop::collection::vec(0u64..64, 1..50)) {
        let mut tl = TransferLog::new(WriteOrdering::Barrier, 16);
        let mut last = tl.current_dagtag();
        for (i, sectors) in sizes.iter().enumerate() {
            let (d, _) = tl.insert(request(i as u64 * 64, *sectors, true, Protocol::C, false));
            prop_assert!(d > last);
            prop_assert_eq!(d - last, (*sectors).max(1));
            last = d;
        }
    }

    #[test]
    fn prop_barrier_ack_covers_exactly_its_epoch(
        barriers in prop::collection::vec(any::<bool>(), 1..40),
        acked in 0usize..8,
    ) {
        let mut tl = TransferLog::new(WriteOrdering::Barrier, 1000);
        let dagtags: Vec<Dagtag> = barriers
            .iter()
            .enumerate()
            .map(|(i, b)| tl.insert(request(i as u64 * 8, 8, true, Protocol::A, *b)).0)
            .collect();
        let (packets, _) = tl.process_sender_queue(C1);
        let mut nrs = barrier_numbers(&packets);
        nrs.extend(barrier_numbers(&tl.sender_idle(C1)));
        let sizes = epoch_sizes(&tl, &dagtags);

        let released: Vec<u32> = nrs.iter().copied().take(acked).collect();
        for nr in &released {
            tl.release(C1, *nr, sizes[nr]).unwrap();
        }
        let upto = released.last().copied().unwrap_or(0);
        for d in &dagtags {
            let slot = tl.get(*d).and_then(|r| r.peer(C1)).unwrap();
            prop_assert_eq!(slot.state == PeerState::Durable, slot.epoch <= upto);
        }
    }

    #[test]
    fn prop_every_request_leaves_the_log(
        writes in prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 1..40),
    ) {
        let mut tl = TransferLog::new(WriteOrdering::Barrier, 8);
        let dagtags: Vec<Dagtag> = writes
            .iter()
            .enumerate()
            .map(|(i, (barrier, _, _))| tl.insert(request(i as u64 * 8, 8, true, Protocol::C, *barrier)).0)
            .collect();
        let (packets, _) = tl.process_sender_queue(C1);
        let mut nrs = barrier_numbers(&packets);
        for (d, (_, ack_first, local_ok)) in dagtags.iter().zip(&writes) {
            let local = if *local_ok {
                RequestEvent::LocalCompletedOk
            } else {
                RequestEvent::LocalCompletedError
            };
            if *ack_first {
                tl.mod_request(*d, RequestEvent::WriteAcked(C1));
                tl.mod_request(*d, local);
            } else {
                tl.mod_request(*d, local);
                tl.mod_request(*d, RequestEvent::WriteAcked(C1));
            }
        }
        nrs.extend(barrier_numbers(&tl.sender_idle(C1)));
        let sizes = epoch_sizes(&tl, &dagtags);
        for nr in nrs {
            tl.release(C1, nr, sizes[&nr]).unwrap();
        }
        prop_assert!(tl.is_empty());
        prop_assert_eq!(tl.in_flight_sectors(C1), 0);
    }

    #[test]
    fn prop_evicted_extents_are_out_of_sync(
        touches in prop::collection::vec(0u64..24, 1..120),
        slots in 7usize..12,
    ) {
        let bitmap = Arc::new(Bitmap::new(24 * AL_BITS_PER_EXT, 1, None));
        let mut al = ActivityLog::new(slots, bitmap.clone(), None, 4, false);
        let mut seen = BTreeSet::new();
        for enr in touches {
            let span = SectorSpan::new(enr * AL_SECT_PER_EXT, 8);
            al.begin_io(span, &[0]).unwrap();
            al.complete_io(span);
            seen.insert(enr);
            let hot = al.extents();
            prop_assert!(hot.len() <= slots);
            for e in &seen {
                prop_assert!(hot.contains(e) || bitmap.test_bit(0, e * AL_BITS_PER_EXT).unwrap());
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_resync_converges(blocks in prop::collection::btree_set(0u64..256, 1..48)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let cluster = SimCluster::new(2, 2048).unwrap();
            cluster.connect_all().unwrap();
            cluster.promote(0).unwrap();
            cluster.cut(0, 1);
            for b in &blocks {
                cluster.write(0, b * 8, Bytes::from(vec![*b as u8 ^ 0x5a; 4096])).await.unwrap();
            }
            cluster.flush();
            let pd = PeerDeviceId::new(ConnectionId(1), VolumeId(0));
            assert_eq!(cluster.node(0).out_of_sync(pd).unwrap(), blocks.len() as u64);

            cluster.heal(0, 1).unwrap();
            assert!(cluster.run_resync(1000));
            assert_eq!(cluster.node(0).out_of_sync(pd).unwrap(), 0);
            assert_eq!(cluster.contents(0, 0, 2048), cluster.contents(1, 0, 2048));
        });
    }
}
