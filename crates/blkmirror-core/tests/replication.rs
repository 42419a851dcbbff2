//! End-to-end replication runs on the in-memory cluster.

use std::time::{Duration, Instant};

use blkmirror_core::config::OnIoError;
use blkmirror_core::events::StateEvent;
use blkmirror_core::generation::GenerationIds;
use blkmirror_core::resource::AttachOptions;
use blkmirror_core::sim::{sim_config, SimCluster};
use blkmirror_core::types::{
    ConnectionId, PeerDeviceId, Protocol, SectorSpan, VolumeId, AL_BITS_PER_EXT, AL_SECT_PER_EXT,
};
use blkmirror_core::{ConnState, DiskState, ReplState};
use bytes::Bytes;

const V0: VolumeId = VolumeId(0);

fn pd(conn: u32) -> PeerDeviceId {
    PeerDeviceId::new(ConnectionId(conn), V0)
}

fn block(fill: u8) -> Bytes {
    Bytes::from(vec![fill; 4096])
}

fn generation(cluster: &SimCluster, i: u32) -> GenerationIds {
    cluster.node(i).device(V0).unwrap().generation()
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<StateEvent>) -> Vec<StateEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

async fn established_pair(sectors: u64) -> SimCluster {
    let cluster = SimCluster::new(2, sectors).unwrap();
    cluster.connect_all().unwrap();
    cluster.promote(0).unwrap();
    assert_eq!(cluster.repl(0, 1), ReplState::Established);
    cluster
}

#[tokio::test]
async fn test_replicated_write_lands_on_both_disks() {
    let cluster = established_pair(2048).await;
    let mut h = cluster.write(0, 16, block(0x5a)).await.unwrap();
    assert_eq!(h.try_result(), Some(Ok(())));
    cluster.flush();

    let expected = vec![0x5a; 4096];
    assert_eq!(cluster.contents(0, 16, 8).unwrap(), expected);
    assert_eq!(cluster.contents(1, 16, 8).unwrap(), expected);
    assert_eq!(cluster.node(0).out_of_sync(pd(1)).unwrap(), 0);
    assert_eq!(cluster.node(0).requests_in_flight(), 0);
}

#[tokio::test]
async fn test_disconnected_writes_resync_after_heal() {
    let cluster = established_pair(4096).await;
    cluster.cut(0, 1);
    assert!(cluster.cstate(0, 1) < ConnState::Connected);

    for i in 0..32u64 {
        let mut h = cluster.write(0, 512 + i * 8, block(i as u8 + 1)).await.unwrap();
        assert_eq!(h.try_result(), Some(Ok(())));
    }
    cluster.flush();
    // the primary went on alone
    assert_ne!(generation(&cluster, 0).current, generation(&cluster, 1).current);
    assert_eq!(generation(&cluster, 0).bitmap, generation(&cluster, 1).current);
    assert_eq!(cluster.node(0).out_of_sync(pd(1)).unwrap(), 32);
    assert_ne!(cluster.contents(0, 512, 256), cluster.contents(1, 512, 256));

    cluster.heal(0, 1).unwrap();
    assert!(cluster.run_resync(1000));
    assert_eq!(cluster.repl(0, 1), ReplState::Established);
    assert_eq!(cluster.repl(1, 0), ReplState::Established);
    assert_eq!(cluster.node(0).out_of_sync(pd(1)).unwrap(), 0);
    assert_eq!(cluster.node(1).out_of_sync(pd(0)).unwrap(), 0);
    assert_eq!(cluster.contents(0, 0, 4096), cluster.contents(1, 0, 4096));
    assert_eq!(cluster.node(1).states().disk(V0), DiskState::UpToDate);
    assert_eq!(generation(&cluster, 0), generation(&cluster, 1));
    assert_eq!(generation(&cluster, 0).bitmap, 0);
}

#[tokio::test]
async fn test_split_brain_refuses_resync() {
    let cluster = established_pair(1024).await;
    cluster.cut(0, 1);
    cluster.write(0, 0, block(0xaa)).await.unwrap();
    cluster.promote(1).unwrap();
    cluster.write(1, 0, block(0xbb)).await.unwrap();
    cluster.flush();

    let mut events = cluster.node(0).subscribe();
    cluster.heal(0, 1).unwrap();
    assert_eq!(cluster.cstate(0, 1), ConnState::StandAlone);
    assert_eq!(cluster.cstate(1, 0), ConnState::StandAlone);
    assert_eq!(cluster.repl(0, 1), ReplState::Off);
    // neither side overwrote the other
    assert_eq!(cluster.contents(0, 0, 8).unwrap(), vec![0xaa; 4096]);
    assert_eq!(cluster.contents(1, 0, 8).unwrap(), vec![0xbb; 4096]);
    assert!(drain(&mut events).contains(&StateEvent::SplitBrain { peer: pd(1) }));

    // standalone stays put across keepalive ticks
    cluster.tick(Instant::now());
    cluster.pump();
    assert_eq!(cluster.cstate(0, 1), ConnState::StandAlone);
}

#[tokio::test]
async fn test_idle_disconnect_only_moves_generations() {
    let cluster = established_pair(1024).await;
    cluster.cut(0, 1);
    cluster.heal(0, 1).unwrap();
    assert_eq!(cluster.cstate(0, 1), ConnState::Connected);
    assert!(cluster.run_resync(100));
    assert_eq!(cluster.repl(0, 1), ReplState::Established);
    assert_eq!(generation(&cluster, 0), generation(&cluster, 1));

    // the next disconnect starts from the synced generation
    cluster.cut(0, 1);
    cluster.write(0, 0, block(1)).await.unwrap();
    cluster.heal(0, 1).unwrap();
    assert_eq!(cluster.cstate(1, 0), ConnState::Connected);
    assert!(cluster.run_resync(1000));
    assert_eq!(cluster.contents(0, 0, 8), cluster.contents(1, 0, 8));
}

#[tokio::test]
async fn test_mismatched_protocols_never_connect() {
    let cluster = SimCluster::with_config(2, |id| {
        let mut cfg = sim_config(id, 2, 1024);
        cfg.net.protocol = if id == 0 { Protocol::C } else { Protocol::A };
        cfg
    })
    .unwrap();
    cluster.connect_all().unwrap();
    assert_ne!(cluster.cstate(0, 1), ConnState::Connected);
    assert_ne!(cluster.cstate(1, 0), ConnState::Connected);
    assert_eq!(cluster.repl(0, 1), ReplState::Off);

    // writes stay local and are tracked for later
    cluster.promote(0).unwrap();
    let mut h = cluster.write(0, 0, block(4)).await.unwrap();
    assert_eq!(h.try_result(), Some(Ok(())));
    assert_eq!(cluster.node(0).out_of_sync(pd(1)).unwrap(), 1);
}

#[tokio::test]
async fn test_online_verify_finds_injected_difference() {
    let cluster = established_pair(1024).await;
    let mut events = cluster.node(0).subscribe();
    for i in 0..16u64 {
        cluster.write(0, i * 8, block(7)).await.unwrap();
    }
    cluster.flush();
    // bypass replication on the peer: block 8 now differs
    assert!(cluster.disk(1).write_raw(V0, 64, &[0xff; 4096]));

    cluster.node(0).start_verify(pd(1), 0, 1024).unwrap();
    assert_eq!(cluster.repl(0, 1), ReplState::VerifyS);
    for _ in 0..100 {
        cluster.tick(Instant::now());
        cluster.pump();
        if cluster.repl(0, 1) == ReplState::Established {
            break;
        }
    }
    assert_eq!(cluster.repl(0, 1), ReplState::Established);
    assert_eq!(cluster.node(0).out_of_sync(pd(1)).unwrap(), 1);

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let StateEvent::VerifyFinished { verified, out_of_sync, .. } = event {
            finished = Some((verified, out_of_sync));
        }
    }
    assert_eq!(finished, Some((128, 1)));
}

#[tokio::test]
async fn test_verify_rejects_idle_peer() {
    let cluster = SimCluster::new(2, 1024).unwrap();
    assert!(cluster.node(0).start_verify(pd(1), 0, 1024).is_err());
    cluster.connect_all().unwrap();
    assert!(cluster.node(0).start_verify(pd(1), 1024, 2048).is_err());
}

#[tokio::test]
async fn test_forced_full_resync() {
    let cluster = established_pair(1024).await;
    for i in 0..4u64 {
        cluster.write(0, i * 8, block(3)).await.unwrap();
    }
    cluster.flush();
    assert!(cluster.disk(1).write_raw(V0, 512, &[9; 4096]));

    cluster.node(0).start_resync(pd(1), true).unwrap();
    cluster.pump();
    assert!(cluster.run_resync(1000));
    assert_eq!(cluster.repl(0, 1), ReplState::Established);
    assert_eq!(cluster.contents(0, 0, 1024), cluster.contents(1, 0, 1024));
    assert_eq!(cluster.node(1).states().disk(V0), DiskState::UpToDate);
}

#[tokio::test]
async fn test_refused_resync_leaves_bitmap_alone() {
    let cluster = established_pair(1024).await;
    cluster.node(1).detach(V0).unwrap();
    cluster.pump();
    assert_eq!(cluster.node(1).states().disk(V0), DiskState::Diskless);
    assert_eq!(cluster.repl(1, 0), ReplState::Established);

    assert!(cluster.node(1).start_resync(pd(0), false).is_err());
    assert_eq!(cluster.node(1).out_of_sync(pd(0)).unwrap(), 0);
    assert_eq!(cluster.repl(1, 0), ReplState::Established);
    assert_eq!(cluster.repl(0, 1), ReplState::Established);
}

#[tokio::test]
async fn test_paused_resync_makes_no_progress() {
    let cluster = established_pair(4096).await;
    cluster.cut(0, 1);
    for i in 0..16u64 {
        cluster.write(0, i * 8, block(0xc3)).await.unwrap();
    }
    cluster.flush();
    cluster.heal(0, 1).unwrap();
    assert_eq!(cluster.repl(1, 0), ReplState::SyncTarget);

    cluster.node(1).pause_resync(pd(0)).unwrap();
    assert_eq!(cluster.repl(1, 0), ReplState::PausedSyncT);
    let left = cluster.node(0).out_of_sync(pd(1)).unwrap();
    assert_eq!(left, 16);
    for _ in 0..5 {
        cluster.tick(Instant::now());
        cluster.pump();
    }
    assert_eq!(cluster.node(0).out_of_sync(pd(1)).unwrap(), left);
    assert!(cluster.node(1).resync_progress(pd(0)).map(|p| p.paused).unwrap_or(false));

    cluster.node(1).resume_resync(pd(0)).unwrap();
    assert!(cluster.run_resync(1000));
    assert_eq!(cluster.node(0).out_of_sync(pd(1)).unwrap(), 0);
    assert_eq!(cluster.contents(0, 0, 128), cluster.contents(1, 0, 128));
}

#[tokio::test]
async fn test_unclean_attach_marks_hot_extents() {
    let cluster = SimCluster::new(1, 4 * AL_SECT_PER_EXT).unwrap();
    cluster.promote(0).unwrap();
    for enr in 0..3u64 {
        let mut h = cluster.write(0, enr * AL_SECT_PER_EXT, block(1)).await.unwrap();
        assert_eq!(h.try_result(), Some(Ok(())));
    }
    let node = cluster.node(0);
    let bitmap = node.device(V0).unwrap().bitmap().clone();
    assert_eq!(bitmap.total_weight(0), 0);

    node.set_role(blkmirror_core::Role::Secondary, false).unwrap();
    node.detach(V0).unwrap();
    assert_eq!(node.states().disk(V0), DiskState::Diskless);
    node.attach(
        V0,
        AttachOptions {
            clean: false,
            ..AttachOptions::default()
        },
    )
    .unwrap();
    assert_eq!(node.states().disk(V0), DiskState::UpToDate);
    assert_eq!(bitmap.total_weight(0), 3 * AL_BITS_PER_EXT);
    for enr in 0..3u64 {
        assert!(bitmap.test_bit(0, enr * AL_BITS_PER_EXT).unwrap());
    }
    assert!(!bitmap.test_bit(0, 3 * AL_BITS_PER_EXT).unwrap());
}

#[tokio::test]
async fn test_local_error_fails_disk_once() {
    let cluster = established_pair(2048).await;
    let mut events = cluster.node(0).subscribe();
    cluster.disk(0).fail_range(V0, SectorSpan::new(0, 64));

    let node = cluster.node(0);
    let mut a = node
        .submit_write(V0, 0, block(1), Default::default())
        .await
        .unwrap();
    let mut b = node
        .submit_write(V0, 32, block(2), Default::default())
        .await
        .unwrap();
    cluster.pump();
    // the peer still holds the data
    assert_eq!(a.try_result(), Some(Ok(())));
    assert_eq!(b.try_result(), Some(Ok(())));
    assert!(matches!(
        node.states().disk(V0),
        DiskState::Failed | DiskState::Diskless
    ));
    assert!(node.device(V0).unwrap().was_io_error());

    let mut io_errors = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, StateEvent::IoError { volume } if volume == V0) {
            io_errors += 1;
        }
    }
    assert_eq!(io_errors, 1);

    // later writes skip the failed disk
    cluster.disk(0).clear_failures();
    let mut c = cluster.write(0, 128, block(3)).await.unwrap();
    assert_eq!(c.try_result(), Some(Ok(())));
    assert_eq!(cluster.contents(1, 128, 8).unwrap(), vec![3; 4096]);
    assert_ne!(node.states().disk(V0), DiskState::UpToDate);
}

#[tokio::test]
async fn test_ping_timeout_drops_connection() {
    let cluster = SimCluster::with_config(2, |id| {
        let mut cfg = sim_config(id, 2, 1024);
        cfg.net.ping_interval_ms = 100;
        cfg.net.ping_timeout_ms = 500;
        cfg
    })
    .unwrap();
    cluster.connect_all().unwrap();
    assert_eq!(cluster.cstate(0, 1), ConnState::Connected);

    let now = Instant::now();
    // the ping goes out but is never delivered
    cluster.node(0).ping_tick(now + Duration::from_secs(1));
    assert_eq!(cluster.cstate(0, 1), ConnState::Connected);
    cluster.node(0).ping_tick(now + Duration::from_secs(2));
    assert!(cluster.cstate(0, 1) < ConnState::Connected);
    assert_eq!(cluster.repl(0, 1), ReplState::Off);
}

#[tokio::test]
async fn test_error_on_sync_target_fails_its_disk() {
    let cluster = established_pair(4096).await;
    cluster.cut(0, 1);
    for i in 0..16u64 {
        cluster.write(0, i * 8, block(0x3c)).await.unwrap();
    }
    cluster.flush();
    cluster.heal(0, 1).unwrap();
    assert_eq!(cluster.repl(1, 0), ReplState::SyncTarget);
    assert_eq!(cluster.node(1).states().disk(V0), DiskState::Inconsistent);

    let mut events = cluster.node(1).subscribe();
    cluster.disk(1).fail_range(V0, SectorSpan::new(0, 4096));
    for _ in 0..20 {
        cluster.tick(Instant::now());
        cluster.pump();
    }
    assert!(matches!(
        cluster.node(1).states().disk(V0),
        DiskState::Failed | DiskState::Diskless
    ));
    assert_ne!(cluster.repl(1, 0), ReplState::SyncTarget);
    let io_errors = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, StateEvent::IoError { .. }))
        .count();
    assert_eq!(io_errors, 1);
    // the target never caught up, so it keeps its old generation
    assert_ne!(generation(&cluster, 1).current, generation(&cluster, 0).current);
}

#[tokio::test]
async fn test_pass_on_downgrades_to_inconsistent() {
    let cluster = SimCluster::with_config(2, |id| {
        let mut cfg = sim_config(id, 2, 2048);
        cfg.disk.on_io_error = OnIoError::PassOn;
        cfg
    })
    .unwrap();
    cluster.connect_all().unwrap();
    cluster.promote(0).unwrap();
    let mut events = cluster.node(0).subscribe();
    cluster.disk(0).fail_range(V0, SectorSpan::new(0, 8));

    let mut h = cluster.write(0, 0, block(6)).await.unwrap();
    assert_eq!(h.try_result(), Some(Ok(())));
    assert_eq!(cluster.node(0).states().disk(V0), DiskState::Inconsistent);
    assert_eq!(cluster.contents(1, 0, 8).unwrap(), vec![6; 4096]);

    // a second error leaves the disk where it is
    cluster.write(0, 0, block(7)).await.unwrap();
    assert_eq!(cluster.node(0).states().disk(V0), DiskState::Inconsistent);
    let io_errors = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, StateEvent::IoError { volume } if *volume == V0))
        .count();
    assert_eq!(io_errors, 1);
}

#[tokio::test]
async fn test_meta_failure_during_verify_fails_disk() {
    let cluster = established_pair(1024).await;
    for i in 0..16u64 {
        cluster.write(0, i * 8, block(2)).await.unwrap();
    }
    cluster.flush();
    assert!(cluster.disk(1).write_raw(V0, 8, &[0xee; 4096]));
    cluster.meta(0).unwrap().set_fail_writes(true);

    cluster.node(0).start_verify(pd(1), 0, 1024).unwrap();
    for _ in 0..100 {
        cluster.tick(Instant::now());
        cluster.pump();
        if cluster.repl(0, 1) != ReplState::VerifyS {
            break;
        }
    }
    assert_ne!(cluster.repl(0, 1), ReplState::VerifyS);
    assert!(matches!(
        cluster.node(0).states().disk(V0),
        DiskState::Failed | DiskState::Diskless
    ));
}
