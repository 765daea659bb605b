#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use bytes::Bytes;
use glam::Vec3;
use octree_stream::frustum::ViewFrustum;
use octree_stream::metrics::{Metrics, WorkerCounters};
use octree_stream::packet::{split_sections, DataHeader, PacketType};
use octree_stream::transport::mock::MockTransport;
use octree_stream::tree::MemoryOctree;
use octree_stream::{
    BandwidthConfig, IntervalBudget, MembershipDirectory, SendWorker, SessionInbox, SharedTree, StreamConfig,
    ViewerId, ViewerQuery, WorkerContext,
};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

pub const PAD: usize = 200;

pub fn props(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// `count` padded elements on a line running away from the origin along -z.
pub fn line_tree(count: u64) -> MemoryOctree {
    let mut tree = MemoryOctree::new(Vec3::ZERO, 128.0);
    for id in 0..count {
        tree.insert(
            id,
            Vec3::new(0.0, 0.0, -(id as f32) * 2.0),
            1.0,
            props(json!({ "name": format!("element-{id}"), "pad": "x".repeat(PAD) })),
        );
    }
    tree
}

/// A `side` x `side` wall of padded elements facing a viewer on +z.
pub fn wall_tree(side: u64) -> MemoryOctree {
    let mut tree = MemoryOctree::new(Vec3::ZERO, 128.0);
    let half = side as f32 / 2.0;
    for row in 0..side {
        for col in 0..side {
            let id = row * side + col;
            tree.insert(
                id,
                Vec3::new(col as f32 - half, row as f32 - half, -20.0),
                0.4,
                props(json!({ "name": format!("tile-{id}"), "pad": "x".repeat(PAD) })),
            );
        }
    }
    tree
}

pub fn query_at(position: Vec3) -> ViewerQuery {
    ViewerQuery {
        frustums: vec![ViewFrustum {
            position,
            ..ViewFrustum::default()
        }],
        ..ViewerQuery::default()
    }
}

pub struct Rig {
    pub tree: SharedTree<MemoryOctree>,
    pub transport: Arc<MockTransport>,
    pub context: WorkerContext<MemoryOctree>,
}

pub struct Viewer {
    pub id: ViewerId,
    pub addr: SocketAddr,
    pub inbox: Arc<SessionInbox>,
    pub worker: SendWorker<MemoryOctree>,
}

impl Rig {
    pub fn new(tree: MemoryOctree, config: StreamConfig, viewers: usize) -> Self {
        let tree = tree.shared();
        let transport = Arc::new(MockTransport::new());
        let bandwidth = BandwidthConfig::from_config(&config);
        let context = WorkerContext {
            tree: Arc::clone(&tree),
            directory: Arc::new(MembershipDirectory::new()),
            transport: transport.clone(),
            server_budget: Arc::new(IntervalBudget::new(
                bandwidth.interval(),
                bandwidth.packets_per_server_per_interval,
            )),
            bandwidth,
            active_viewers: Arc::new(AtomicUsize::new(viewers)),
            metrics: Arc::new(Metrics::new()),
            config,
        };
        Self {
            tree,
            transport,
            context,
        }
    }

    pub fn viewer(&self, port: u16) -> Viewer {
        let id = Uuid::new_v4();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().expect("addr");
        self.context.directory.touch(id, addr, Instant::now());
        let inbox = Arc::new(SessionInbox::new());
        let worker = SendWorker::new(
            id,
            Arc::clone(&inbox),
            Arc::new(WorkerCounters::default()),
            &self.context,
        );
        Viewer {
            id,
            addr,
            inbox,
            worker,
        }
    }
}

/// Decoded data packets in send order: (seq, element ids of every section).
pub fn data_packets(datagrams: &[Bytes]) -> Vec<(u16, Vec<u64>)> {
    datagrams
        .iter()
        .filter_map(|datagram| {
            let (header, offset) = DataHeader::decode(datagram).ok()?;
            if header.packet_type != PacketType::OctreeData || header.list_position.is_some() {
                return None;
            }
            let ids = split_sections(&datagram[offset..])
                .ok()?
                .into_iter()
                .filter_map(|(count, records)| MemoryOctree::decode_records(records, count))
                .flatten()
                .map(|record| record.id)
                .collect();
            Some((header.seq, ids))
        })
        .collect()
}
