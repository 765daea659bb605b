mod common;

use std::collections::HashMap;
use std::f32::consts::PI;
use std::time::Duration;

use glam::{Quat, Vec3};
use octree_stream::frustum::ViewFrustum;
use octree_stream::{NackMessage, PassStatus, SequenceStats, StreamConfig, TraversalKind, ViewerQuery};
use serde_json::json;
use tokio::time::Instant;

use common::{data_packets, line_tree, props, query_at, wall_tree, Rig};

const NEXT_INTERVAL: Duration = Duration::from_millis(17);

fn two_per_interval() -> StreamConfig {
    StreamConfig {
        packets_per_second_per_viewer: 120,
        ..StreamConfig::default()
    }
}

#[test_timeout::tokio_timeout_test(paused)]
async fn idle_view_consumes_no_budget() {
    let rig = Rig::new(line_tree(20), StreamConfig::default(), 1);
    let mut viewer = rig.viewer(9000);
    viewer.inbox.post_query(query_at(Vec3::new(0.0, 0.0, 10.0)));
    let first = viewer.worker.distribution_pass(Instant::now());
    assert!(first.scene_completed);
    let sent_before = rig.transport.len();

    for _ in 0..5 {
        tokio::time::advance(NEXT_INTERVAL).await;
        viewer.inbox.post_query(query_at(Vec3::new(0.0, 0.0, 10.0)));
        let now = Instant::now();
        let summary = viewer.worker.distribution_pass(now);
        assert_eq!(summary.status, PassStatus::Ran);
        assert_eq!(summary.packets_sent, 0);
        assert_eq!(summary.datagrams_sent, 0);
        assert_eq!(rig.context.server_budget.used(now), 0);
    }
    assert_eq!(rig.transport.len(), sent_before);
}

fn crowded_config() -> StreamConfig {
    StreamConfig {
        packets_per_second_per_viewer: 50 * 60,
        packets_per_second_total: 100 * 60,
        traversal_budget_us: 1_000_000,
        ..StreamConfig::default()
    }
}

fn per_viewer_datagrams(rig: &Rig) -> HashMap<std::net::SocketAddr, usize> {
    let mut counts = HashMap::new();
    for (addr, _) in rig.transport.sent() {
        *counts.entry(addr).or_insert(0) += 1;
    }
    counts
}

#[test_timeout::tokio_timeout_test(paused)]
async fn server_budget_is_shared_between_viewers() {
    let rig = Rig::new(wall_tree(20), crowded_config(), 3);
    let mut viewers: Vec<_> = (0..3).map(|n| rig.viewer(9100 + n)).collect();
    let now = Instant::now();
    for viewer in viewers.iter_mut() {
        let mut query = query_at(Vec3::new(0.0, 0.0, 10.0));
        query.max_packets_per_second = 50 * 60;
        viewer.inbox.post_query(query);
        viewer.worker.distribution_pass(now);
    }

    let counts = per_viewer_datagrams(&rig);
    let total: usize = counts.values().sum();
    assert!(total <= 100, "sent {total} datagrams in one interval");
    assert!(counts.values().all(|count| *count <= 50), "{counts:?}");
    assert_eq!(counts.len(), 3, "every viewer gets a share");
}

#[test_timeout::tokio_timeout_test(paused)]
async fn server_budget_holds_when_fair_share_overestimates() {
    // Viewer count lags behind: every worker believes it may use its full cap.
    let rig = Rig::new(wall_tree(20), crowded_config(), 1);
    let mut viewers: Vec<_> = (0..3).map(|n| rig.viewer(9200 + n)).collect();
    let now = Instant::now();
    for viewer in viewers.iter_mut() {
        viewer.inbox.post_query(query_at(Vec3::new(0.0, 0.0, 10.0)));
        viewer.worker.distribution_pass(now);
    }

    let counts = per_viewer_datagrams(&rig);
    let total: usize = counts.values().sum();
    assert_eq!(total, 100);
    assert!(counts.values().all(|count| *count <= 50), "{counts:?}");
    assert_eq!(rig.context.server_budget.remaining(now), 0);

    tokio::time::advance(NEXT_INTERVAL).await;
    let now = Instant::now();
    assert_eq!(rig.context.server_budget.remaining(now), 100);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn view_change_mid_traversal_restarts_in_priority_order() {
    let rig = Rig::new(line_tree(20), two_per_interval(), 1);
    let mut viewer = rig.viewer(9300);
    viewer.inbox.post_query(query_at(Vec3::new(0.0, 0.0, 10.0)));
    let first = viewer.worker.distribution_pass(Instant::now());
    assert_eq!(first.traversal, Some(TraversalKind::First));
    assert!(!first.scene_completed);
    let first_round = data_packets(&rig.transport.sent_to(viewer.addr));
    assert_eq!(first_round[0].1[0], 0);
    rig.transport.take();

    // Turn around and look back up the line from its far end.
    viewer.inbox.post_query(ViewerQuery {
        frustums: vec![ViewFrustum {
            position: Vec3::new(0.0, 0.0, -60.0),
            orientation: Quat::from_rotation_y(PI),
            ..ViewFrustum::default()
        }],
        ..ViewerQuery::default()
    });
    tokio::time::advance(NEXT_INTERVAL).await;
    let second = viewer.worker.distribution_pass(Instant::now());
    assert_eq!(second.traversal, Some(TraversalKind::Differential));

    let ids: Vec<u64> = data_packets(&rig.transport.sent_to(viewer.addr))
        .into_iter()
        .flat_map(|(_, ids)| ids)
        .collect();
    assert_eq!(ids[0], 19);
    assert!(ids.windows(2).all(|pair| pair[0] > pair[1]), "{ids:?}");
    let already_sent: Vec<u64> = first_round.into_iter().flat_map(|(_, ids)| ids).collect();
    assert!(ids.iter().all(|id| !already_sent.contains(id)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn duplicate_packets_are_suppressed_until_the_resend_floor() {
    let rig = Rig::new(line_tree(20), StreamConfig::default(), 1);
    let mut viewer = rig.viewer(9400);
    viewer.inbox.post_query(query_at(Vec3::new(0.0, 0.0, 10.0)));
    viewer.worker.distribution_pass(Instant::now());

    let same = props(json!({ "name": "element-3", "pad": "z" }));
    rig.tree.write().update_properties(3, same.clone());
    tokio::time::advance(NEXT_INTERVAL).await;
    let changed = viewer.worker.distribution_pass(Instant::now());
    assert_eq!(changed.packets_sent, 1);

    rig.tree.write().update_properties(3, same.clone());
    tokio::time::advance(NEXT_INTERVAL).await;
    let repeated = viewer.worker.distribution_pass(Instant::now());
    assert_eq!(repeated.elements_sent, 1);
    assert_eq!(repeated.packets_sent, 0);
    assert_eq!(repeated.suppressed, 1);
    assert_eq!(viewer.worker.counters().snapshot().suppressed_packets, 1);

    tokio::time::advance(Duration::from_millis(1_000)).await;
    rig.tree.write().update_properties(3, same);
    let after_floor = viewer.worker.distribution_pass(Instant::now());
    assert_eq!(after_floor.packets_sent, 1);
    assert_eq!(after_floor.suppressed, 0);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn sequence_numbers_increase_and_nacks_replay_original_bytes() {
    let rig = Rig::new(line_tree(60), two_per_interval(), 1);
    let mut viewer = rig.viewer(9500);
    viewer.inbox.post_query(query_at(Vec3::new(0.0, 0.0, 10.0)));
    for _ in 0..4 {
        viewer.worker.distribution_pass(Instant::now());
        tokio::time::advance(NEXT_INTERVAL).await;
    }

    let sent = rig.transport.sent_to(viewer.addr);
    let seqs: Vec<u16> = data_packets(&sent).into_iter().map(|(seq, _)| seq).collect();
    assert_eq!(seqs.len(), 8);
    assert!(seqs.windows(2).all(|pair| pair[1] == pair[0].wrapping_add(1)), "{seqs:?}");

    let target = seqs[3];
    let original = sent
        .iter()
        .find(|datagram| data_packets(std::slice::from_ref(*datagram)).first().map(|(seq, _)| *seq) == Some(target))
        .cloned()
        .expect("original packet");
    rig.transport.take();

    viewer.inbox.post_nack(NackMessage { missing: vec![target] }.encode_body().into());
    let summary = viewer.worker.distribution_pass(Instant::now());
    assert_eq!(summary.retransmitted, 1);
    let resent = rig.transport.sent_to(viewer.addr);
    assert_eq!(resent[0], original);

    let fresh: Vec<u16> = data_packets(&resent[1..]).into_iter().map(|(seq, _)| seq).collect();
    assert_eq!(fresh, vec![seqs[7].wrapping_add(1)]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn nack_for_evicted_packet_is_ignored() {
    let config = StreamConfig {
        history_capacity: 3,
        ..two_per_interval()
    };
    let rig = Rig::new(line_tree(60), config, 1);
    let mut viewer = rig.viewer(9600);
    viewer.inbox.post_query(query_at(Vec3::new(0.0, 0.0, 10.0)));
    for _ in 0..3 {
        viewer.worker.distribution_pass(Instant::now());
        tokio::time::advance(NEXT_INTERVAL).await;
    }
    let seqs: Vec<u16> = data_packets(&rig.transport.take().into_iter().map(|(_, d)| d).collect::<Vec<_>>())
        .into_iter()
        .map(|(seq, _)| seq)
        .collect();
    assert_eq!(seqs.len(), 6);

    viewer.inbox.post_nack(NackMessage { missing: vec![seqs[0]] }.encode_body().into());
    let summary = viewer.worker.distribution_pass(Instant::now());
    assert_eq!(summary.retransmitted, 0);
    assert_eq!(rig.context.metrics.snapshot().nack_misses, 1);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn lossy_viewer_recovers_dropped_packets_through_nacks() {
    let rig = Rig::new(line_tree(60), two_per_interval(), 1);
    let mut viewer = rig.viewer(9700);
    viewer.inbox.post_query(query_at(Vec3::new(0.0, 0.0, 10.0)));
    for _ in 0..4 {
        viewer.worker.distribution_pass(Instant::now());
        tokio::time::advance(NEXT_INTERVAL).await;
    }

    let mut received = SequenceStats::new();
    let packets = data_packets(&rig.transport.sent_to(viewer.addr));
    let dropped = [packets[1].0, packets[4].0];
    for (seq, _) in packets.iter().filter(|(seq, _)| !dropped.contains(seq)) {
        received.received(*seq);
    }
    assert_eq!(received.missing(), dropped.to_vec());
    assert_eq!(received.counts().lost, 2);
    rig.transport.take();

    viewer.inbox.post_nack(
        NackMessage {
            missing: received.missing(),
        }
        .encode_body()
        .into(),
    );
    let summary = viewer.worker.distribution_pass(Instant::now());
    assert_eq!(summary.retransmitted, 2);
    for (seq, _) in data_packets(&rig.transport.sent_to(viewer.addr)) {
        received.received(seq);
    }
    let counts = received.counts();
    assert_eq!(counts.lost, 0);
    assert_eq!(counts.recovered, 2);
    assert!(received.missing().is_empty());
}
