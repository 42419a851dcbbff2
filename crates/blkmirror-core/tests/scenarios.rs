//! Small scenarios across the bitmap, the transfer log and the activity log.

use std::sync::Arc;

use blkmirror_core::activity_log::ActivityLog;
use blkmirror_core::bitmap::Bitmap;
use blkmirror_core::error::IoFailure;
use blkmirror_core::transfer_log::{Completed, NewRequest, PeerPlan, PeerState, TransferLog};
use blkmirror_core::types::{
    ConnectionId, Protocol, SectorSpan, VolumeId, WriteOrdering, AL_BITS_PER_EXT, AL_SECT_PER_EXT,
};
use bytes::Bytes;
use tokio::sync::oneshot;

const C1: ConnectionId = ConnectionId(1);

#[test]
fn test_bitmap_range_weight() {
    let bitmap = Bitmap::new(10_000, 1, None);
    assert_eq!(bitmap.set_bits(0, 100, 199).unwrap(), 100);
    assert_eq!(bitmap.total_weight(0), 100);
    assert_eq!(bitmap.clear_bits(0, 100, 149).unwrap(), 50);
    assert_eq!(bitmap.total_weight(0), 50);
    assert!(!bitmap.test_bit(0, 149).unwrap());
    assert!(bitmap.test_bit(0, 150).unwrap());
    // setting again changes nothing
    assert_eq!(bitmap.set_bits(0, 150, 199).unwrap(), 0);
}

fn replicated(sector: u64, barrier: bool) -> (NewRequest, oneshot::Receiver<Result<(), IoFailure>>) {
    let (tx, rx) = oneshot::channel();
    let req = NewRequest {
        volume: VolumeId(0),
        span: SectorSpan::new(sector, 8),
        data: Bytes::from(vec![1u8; 4096]),
        local: false,
        peers: vec![PeerPlan::Replicate {
            conn: C1,
            protocol: Protocol::C,
        }],
        barrier,
        waiter: Some(tx),
    };
    (req, rx)
}

#[test]
fn test_connection_loss_before_barrier_ack() {
    let mut tl = TransferLog::new(WriteOrdering::Barrier, 100);
    let (r1, mut w1) = replicated(0, true);
    let (r2, mut w2) = replicated(8, false);
    let (r3, mut w3) = replicated(16, false);
    let (d1, _) = tl.insert(r1);
    let (d2, _) = tl.insert(r2);
    let (d3, _) = tl.insert(r3);
    assert!(d1 < d2 && d2 < d3);

    let (packets, _) = tl.process_sender_queue(C1);
    assert_eq!(packets.len(), 4);
    for d in [d1, d2, d3] {
        assert_eq!(tl.get(d).unwrap().peer(C1).unwrap().state, PeerState::Sent);
    }

    let out = tl.clear(C1);
    assert_eq!(out.completed.len(), 3);
    assert_eq!(out.out_of_sync.len(), 3);
    assert!(out.completed.iter().all(|c| c.result == Err(IoFailure::ConnectionLost)));
    out.completed.into_iter().for_each(Completed::deliver);
    for w in [&mut w1, &mut w2, &mut w3] {
        assert_eq!(w.try_recv(), Ok(Err(IoFailure::ConnectionLost)));
    }
    assert!(tl.is_empty());
    assert_eq!(tl.in_flight_sectors(C1), 0);
}

#[test]
fn test_activity_log_eviction_marks_old_extent() {
    let n = 7usize;
    let bitmap = Arc::new(Bitmap::new((n as u64 + 2) * AL_BITS_PER_EXT, 2, None));
    let mut al = ActivityLog::new(n, bitmap.clone(), None, 4, false);
    let extent = |enr: u64| SectorSpan::new(enr * AL_SECT_PER_EXT, 8);

    for enr in 0..n as u64 {
        al.begin_io(extent(enr), &[1]).unwrap();
        al.complete_io(extent(enr));
    }
    assert_eq!(al.used(), n);
    assert_eq!(bitmap.total_weight(1), 0);

    al.begin_io(extent(n as u64), &[1]).unwrap();
    assert!(!al.extents().contains(&0));
    // the whole 4 MiB of extent 0, for the unreplicated plane only
    assert_eq!(bitmap.total_weight(0), 0);
    assert_eq!(bitmap.total_weight(1), AL_BITS_PER_EXT);
    assert!(bitmap.test_bit(1, 0).unwrap());
    assert!(bitmap.test_bit(1, AL_BITS_PER_EXT - 1).unwrap());
    assert!(!bitmap.test_bit(1, AL_BITS_PER_EXT).unwrap());
}
