mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;
use octree_stream::packet::{DataHeader, PacketType};
use octree_stream::protocol::encode_goodbye;
use octree_stream::transport::mock::MockTransport;
use octree_stream::{ProtocolError, QueryRouting, SceneStats, ServerCoordinator, StreamConfig, StreamError};
use uuid::Uuid;

use common::{data_packets, line_tree, query_at};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("addr")
}

fn start() -> (ServerCoordinator<octree_stream::MemoryOctree>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let coordinator = ServerCoordinator::new(line_tree(20).shared(), transport.clone(), StreamConfig::default())
        .expect("coordinator");
    (coordinator, transport)
}

#[test_timeout::tokio_timeout_test(paused)]
async fn query_datagram_streams_the_scene() {
    let (coordinator, transport) = start();
    let viewer = Uuid::new_v4();
    let query = query_at(Vec3::new(0.0, 0.0, 10.0))
        .encode(viewer)
        .expect("encode query");
    coordinator.handle_datagram(addr(7100), &query).expect("query");
    assert!(coordinator.has_worker(&viewer));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = transport.sent_to(addr(7100));
    let ids: Vec<u64> = data_packets(&sent).into_iter().flat_map(|(_, ids)| ids).collect();
    assert_eq!(ids.len(), 20);
    let stats: Vec<SceneStats> = sent
        .iter()
        .filter_map(|datagram| {
            let (header, offset) = DataHeader::decode(datagram).ok()?;
            (header.packet_type == PacketType::SceneStats)
                .then(|| SceneStats::from_bytes(&datagram[offset..]).ok())
                .flatten()
        })
        .collect();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].elements, 20);

    let snapshot = coordinator.stats();
    assert_eq!(snapshot.viewers.len(), 1);
    assert_eq!(snapshot.viewers[0].addr, Some(addr(7100)));
    assert_eq!(snapshot.metrics.scenes_completed, 1);
    let json = serde_json::to_value(&snapshot).expect("stats json");
    assert!(json["viewers"][0]["counters"]["packets_sent"].as_u64().unwrap_or(0) > 0);

    coordinator.shutdown().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn malformed_datagrams_are_rejected_without_side_effects() {
    let (coordinator, transport) = start();
    let err = coordinator
        .handle_datagram(addr(7200), &[0x01, 0x01, 0x02])
        .expect_err("truncated");
    assert!(matches!(
        err,
        StreamError::Protocol(ProtocolError::Truncated { .. })
    ));
    let mut bad_version = encode_goodbye(Uuid::new_v4());
    bad_version[1] = 9;
    assert!(matches!(
        coordinator.handle_datagram(addr(7200), &bad_version),
        Err(StreamError::Protocol(ProtocolError::UnsupportedVersion(9)))
    ));
    assert_eq!(coordinator.viewer_count(), 0);
    assert!(transport.is_empty());
    coordinator.shutdown().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn goodbye_and_shutdown_stop_all_workers() {
    let (coordinator, transport) = start();
    let leaving = Uuid::new_v4();
    let staying = Uuid::new_v4();
    for (viewer, port) in [(leaving, 7300), (staying, 7301)] {
        let query = query_at(Vec3::new(0.0, 0.0, 10.0)).encode(viewer).expect("encode");
        coordinator.handle_datagram(addr(port), &query).expect("query");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.viewer_count(), 2);

    coordinator
        .handle_datagram(addr(7300), &encode_goodbye(leaving))
        .expect("goodbye");
    assert!(!coordinator.has_worker(&leaving));
    assert_eq!(coordinator.viewer_count(), 1);
    let stopped_at = transport.sent_to(addr(7300)).len();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent_to(addr(7300)).len(), stopped_at);

    coordinator.shutdown().await;
    assert_eq!(coordinator.viewer_count(), 0);
    assert!(coordinator.tree().is_none());
    assert_eq!(coordinator.stats().metrics.viewers_connected, 0);

    let sent = transport.len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.len(), sent);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn reaper_evicts_viewers_that_go_quiet() {
    let transport = Arc::new(MockTransport::new());
    let config = StreamConfig {
        idle_timeout_ms: 500,
        ..StreamConfig::default()
    };
    let coordinator = ServerCoordinator::new(line_tree(4).shared(), transport, config).expect("coordinator");
    let reaper = coordinator.spawn_reaper(Duration::from_millis(100));

    let viewer = Uuid::new_v4();
    let query = query_at(Vec3::new(0.0, 0.0, 10.0)).encode(viewer).expect("encode");
    coordinator.handle_datagram(addr(7400), &query).expect("query");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(coordinator.has_worker(&viewer));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!coordinator.has_worker(&viewer));
    assert_eq!(coordinator.stats().metrics.viewers_total, 1);

    coordinator.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(reaper.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queries_racing_shutdown_leave_no_worker_behind() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = ServerCoordinator::new(line_tree(4).shared(), transport.clone(), StreamConfig::default())
        .expect("coordinator");
    let senders: Vec<_> = (0..4u16)
        .map(|thread| {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                let mut admitted = 0usize;
                for _ in 0..2_000 {
                    let routing =
                        coordinator.on_query_received(Uuid::new_v4(), addr(7500 + thread), query_at(Vec3::new(0.0, 0.0, 10.0)));
                    if routing == QueryRouting::Ignored {
                        break;
                    }
                    admitted += 1;
                }
                admitted
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(5)).await;
    coordinator.shutdown().await;
    let admitted: usize = senders
        .into_iter()
        .map(|sender| sender.join().expect("sender thread"))
        .sum();
    assert!(admitted > 0);
    assert_eq!(coordinator.viewer_count(), 0);
    assert_eq!(
        coordinator.on_query_received(Uuid::new_v4(), addr(7600), query_at(Vec3::ZERO)),
        QueryRouting::Ignored
    );

    let sent = transport.len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.len(), sent);
}
