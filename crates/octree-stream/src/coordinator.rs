//! Owns the shared tree and one send worker per connected viewer.
//!
//! The receive path calls into the coordinator for every inbound datagram.
//! Those calls only touch the worker map and the viewer's inbox, so they
//! never wait on a worker that is busy traversing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::directory::MembershipDirectory;
use crate::error::{StreamError, StreamResult};
use crate::metrics::{Metrics, MetricsSnapshot, WorkerCounters, WorkerCountersSnapshot};
use crate::protocol::{InboundKind, InboundMessage, ViewerId, ViewerQuery};
use crate::session::SessionInbox;
use crate::throttle::{BandwidthConfig, IntervalBudget};
use crate::transport::DatagramTransport;
use crate::tree::{SharedTree, SpatialTree};
use crate::worker::{SendWorker, WorkerContext};

/// What happened to an inbound query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRouting {
    /// A new worker was started for a viewer we did not know.
    Created,
    /// A stale or stopping worker was replaced by a fresh one.
    Replaced,
    /// The running worker picks the query up on its next pass.
    Updated,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReapSummary {
    pub idle_removed: usize,
    pub crashed_removed: usize,
    pub joined: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewerStats {
    pub viewer: ViewerId,
    pub addr: Option<SocketAddr>,
    pub connected_ms: u64,
    pub counters: WorkerCountersSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub packets_per_viewer_per_interval: u32,
    pub packets_per_server_per_interval: u32,
    pub intervals_per_second: u32,
    pub metrics: MetricsSnapshot,
    pub viewers: Vec<ViewerStats>,
}

struct WorkerEntry {
    inbox: Arc<SessionInbox>,
    counters: Arc<WorkerCounters>,
    handle: JoinHandle<()>,
    connected_at: Instant,
}

struct CoordinatorInner<T: SpatialTree> {
    tree: RwLock<Option<SharedTree<T>>>,
    workers: DashMap<ViewerId, WorkerEntry>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    directory: Arc<MembershipDirectory>,
    transport: Arc<dyn DatagramTransport>,
    server_budget: Arc<IntervalBudget>,
    bandwidth: BandwidthConfig,
    active_viewers: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
    config: StreamConfig,
    shutting_down: AtomicBool,
    /// Held shared while a query inserts a worker and exclusively while
    /// shutdown flips `shutting_down`, so no worker is added after the flip.
    admission: RwLock<()>,
    runtime: Handle,
}

pub struct ServerCoordinator<T: SpatialTree> {
    inner: Arc<CoordinatorInner<T>>,
}

impl<T: SpatialTree> Clone for ServerCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SpatialTree> ServerCoordinator<T> {
    /// Must be called from inside a tokio runtime; workers are spawned on it.
    pub fn new(
        tree: SharedTree<T>,
        transport: Arc<dyn DatagramTransport>,
        config: StreamConfig,
    ) -> StreamResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()?;
        let bandwidth = BandwidthConfig::from_config(&config);
        let server_budget = Arc::new(IntervalBudget::new(
            bandwidth.interval(),
            bandwidth.packets_per_server_per_interval,
        ));
        info!(
            target = "stream::coordinator",
            per_viewer = bandwidth.packets_per_viewer_per_interval,
            per_server = bandwidth.packets_per_server_per_interval,
            intervals_per_second = bandwidth.intervals_per_second,
            policy = ?config.policy,
            "coordinator ready"
        );
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                tree: RwLock::new(Some(tree)),
                workers: DashMap::new(),
                retired: Mutex::new(Vec::new()),
                directory: Arc::new(MembershipDirectory::new()),
                transport,
                server_budget,
                bandwidth,
                active_viewers: Arc::new(AtomicUsize::new(0)),
                metrics: Arc::new(Metrics::new()),
                config,
                shutting_down: AtomicBool::new(false),
                admission: RwLock::new(()),
                runtime,
            }),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    pub fn tree(&self) -> Option<SharedTree<T>> {
        self.inner.tree.read().clone()
    }

    pub fn directory(&self) -> &Arc<MembershipDirectory> {
        &self.inner.directory
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn bandwidth(&self) -> BandwidthConfig {
        self.inner.bandwidth
    }

    pub fn viewer_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn has_worker(&self, viewer: &ViewerId) -> bool {
        self.inner.workers.contains_key(viewer)
    }

    /// Decodes one inbound datagram and routes it.
    pub fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) -> StreamResult<()> {
        if self.is_shutting_down() {
            return Err(StreamError::ShuttingDown);
        }
        let message = InboundMessage::decode(datagram)?;
        match message.kind {
            InboundKind::Query(query) => {
                self.on_query_received(message.viewer_id, from, query);
            }
            InboundKind::Nack(body) => self.on_nack_received(message.viewer_id, from, body),
            InboundKind::Goodbye => self.on_viewer_removed(message.viewer_id),
        }
        Ok(())
    }

    pub fn on_query_received(&self, viewer: ViewerId, from: SocketAddr, query: ViewerQuery) -> QueryRouting {
        let _admission = self.inner.admission.read();
        if self.is_shutting_down() {
            return QueryRouting::Ignored;
        }
        self.inner.directory.touch(viewer, from, Instant::now());

        match self.inner.workers.entry(viewer) {
            Entry::Occupied(entry)
                if !entry.get().inbox.is_shutting_down() && !entry.get().handle.is_finished() =>
            {
                entry.get().inbox.post_query(query);
                QueryRouting::Updated
            }
            Entry::Occupied(mut entry) => {
                let Some(fresh) = self.spawn_worker(viewer, query) else {
                    return QueryRouting::Ignored;
                };
                let stale = entry.insert(fresh);
                stale.inbox.mark_shutting_down();
                self.inner.retired.lock().push(stale.handle);
                info!(target = "stream::coordinator", viewer = %viewer, %from, "replaced stale send worker");
                QueryRouting::Replaced
            }
            Entry::Vacant(entry) => {
                let Some(fresh) = self.spawn_worker(viewer, query) else {
                    return QueryRouting::Ignored;
                };
                entry.insert(fresh);
                self.inner.active_viewers.fetch_add(1, Ordering::Relaxed);
                self.inner.metrics.viewer_connected();
                info!(target = "stream::coordinator", viewer = %viewer, %from, "viewer connected");
                QueryRouting::Created
            }
        }
    }

    /// Hands a NACK body to the viewer's worker. Unknown viewers are ignored.
    pub fn on_nack_received(&self, viewer: ViewerId, from: SocketAddr, body: Bytes) {
        let Some(entry) = self.inner.workers.get(&viewer) else {
            debug!(target = "stream::coordinator", viewer = %viewer, "nack from unknown viewer");
            return;
        };
        entry.inbox.post_nack(body);
        drop(entry);
        self.inner.directory.touch(viewer, from, Instant::now());
    }

    /// Marks the viewer's worker shutting down and forgets the viewer. The
    /// worker exits at its next safe point and is joined by the reaper.
    pub fn on_viewer_removed(&self, viewer: ViewerId) {
        self.inner.directory.remove(&viewer);
        let Some((_, entry)) = self.inner.workers.remove(&viewer) else {
            return;
        };
        entry.inbox.mark_shutting_down();
        self.inner.retired.lock().push(entry.handle);
        self.release_viewer_slot(viewer);
        info!(target = "stream::coordinator", viewer = %viewer, "viewer removed");
    }

    fn release_viewer_slot(&self, viewer: ViewerId) {
        let _ = self
            .inner
            .active_viewers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(count.saturating_sub(1))
            });
        self.inner.metrics.viewer_disconnected(viewer);
    }

    fn spawn_worker(&self, viewer: ViewerId, query: ViewerQuery) -> Option<WorkerEntry> {
        let tree = self.inner.tree.read().clone()?;
        let context = WorkerContext {
            tree,
            directory: Arc::clone(&self.inner.directory),
            transport: Arc::clone(&self.inner.transport),
            server_budget: Arc::clone(&self.inner.server_budget),
            bandwidth: self.inner.bandwidth,
            active_viewers: Arc::clone(&self.inner.active_viewers),
            metrics: Arc::clone(&self.inner.metrics),
            config: self.inner.config.clone(),
        };
        let inbox = Arc::new(SessionInbox::new());
        inbox.post_query(query);
        let counters = Arc::new(WorkerCounters::default());
        let worker = SendWorker::new(viewer, Arc::clone(&inbox), Arc::clone(&counters), &context);
        let handle = self.inner.runtime.spawn(worker.run());
        Some(WorkerEntry {
            inbox,
            counters,
            handle,
            connected_at: Instant::now(),
        })
    }

    /// Removes idle viewers and workers that died, and drops the handles of
    /// workers that have finished.
    pub fn reap(&self, now: Instant) -> ReapSummary {
        let mut summary = ReapSummary::default();
        for viewer in self
            .inner
            .directory
            .idle_since(now, self.inner.config.idle_timeout())
        {
            debug!(target = "stream::coordinator", viewer = %viewer, "evicting idle viewer");
            self.on_viewer_removed(viewer);
            summary.idle_removed += 1;
        }

        let crashed: Vec<ViewerId> = self
            .inner
            .workers
            .iter()
            .filter(|entry| entry.handle.is_finished())
            .map(|entry| *entry.key())
            .collect();
        for viewer in crashed {
            if let Some((_, entry)) = self
                .inner
                .workers
                .remove_if(&viewer, |_, entry| entry.handle.is_finished())
            {
                warn!(target = "stream::coordinator", viewer = %viewer, "send worker exited on its own");
                self.inner.retired.lock().push(entry.handle);
                self.release_viewer_slot(viewer);
                summary.crashed_removed += 1;
            }
        }

        let mut retired = self.inner.retired.lock();
        let before = retired.len();
        retired.retain(|handle| !handle.is_finished());
        summary.joined = before - retired.len();
        summary
    }

    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        self.inner.runtime.spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if coordinator.is_shutting_down() {
                    break;
                }
                let summary = coordinator.reap(Instant::now());
                if summary != ReapSummary::default() {
                    debug!(
                        target = "stream::coordinator",
                        idle = summary.idle_removed,
                        crashed = summary.crashed_removed,
                        joined = summary.joined,
                        "reaped workers"
                    );
                }
            }
        })
    }

    /// Stops every worker and waits for each to exit, then releases the tree.
    /// Waits without a deadline so no worker is torn down mid-send.
    pub async fn shutdown(&self) {
        {
            let _admission = self.inner.admission.write();
            if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        info!(
            target = "stream::coordinator",
            viewers = self.inner.workers.len(),
            "shutting down"
        );

        let mut joined = 0usize;
        loop {
            let viewers: Vec<ViewerId> = self
                .inner
                .workers
                .iter()
                .map(|entry| *entry.key())
                .collect();
            let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(viewers.len());
            for viewer in viewers {
                if let Some((_, entry)) = self.inner.workers.remove(&viewer) {
                    entry.inbox.mark_shutting_down();
                    handles.push(entry.handle);
                    self.release_viewer_slot(viewer);
                }
            }
            handles.extend(self.inner.retired.lock().drain(..));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    warn!(target = "stream::coordinator", error = %err, "send worker ended abnormally");
                }
                joined += 1;
            }
        }

        self.inner.tree.write().take();
        info!(target = "stream::coordinator", joined, "coordinator stopped");
    }

    pub fn viewer_stats(&self, viewer: &ViewerId) -> Option<WorkerCountersSnapshot> {
        self.inner
            .workers
            .get(viewer)
            .map(|entry| entry.counters.snapshot())
    }

    pub fn stats(&self) -> CoordinatorStats {
        let now = Instant::now();
        let mut viewers: Vec<ViewerStats> = self
            .inner
            .workers
            .iter()
            .map(|entry| ViewerStats {
                viewer: *entry.key(),
                addr: self.inner.directory.lookup(entry.key()),
                connected_ms: u64::try_from(now.saturating_duration_since(entry.connected_at).as_millis())
                    .unwrap_or(u64::MAX),
                counters: entry.counters.snapshot(),
            })
            .collect();
        viewers.sort_by_key(|stats| stats.viewer);
        CoordinatorStats {
            packets_per_viewer_per_interval: self.inner.bandwidth.packets_per_viewer_per_interval,
            packets_per_server_per_interval: self.inner.bandwidth.packets_per_server_per_interval,
            intervals_per_second: self.inner.bandwidth.intervals_per_second,
            metrics: self.inner.metrics.snapshot(),
            viewers,
        }
    }

    pub fn reset_stats(&self) {
        self.inner.metrics.reset();
        for entry in self.inner.workers.iter() {
            entry.counters.reset();
        }
        info!(target = "stream::coordinator", "stats reset");
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use uuid::Uuid;

    use super::*;
    use crate::protocol::encode_goodbye;
    use crate::transport::mock::MockTransport;
    use crate::tree::MemoryOctree;

    fn coordinator() -> (ServerCoordinator<MemoryOctree>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let tree = MemoryOctree::new(Vec3::ZERO, 32.0).shared();
        let coordinator = ServerCoordinator::new(tree, transport.clone(), StreamConfig::default())
            .expect("coordinator");
        (coordinator, transport)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().expect("addr")
    }

    #[tokio::test(start_paused = true)]
    async fn first_query_creates_then_updates() {
        let (coordinator, _) = coordinator();
        let viewer = Uuid::new_v4();
        assert_eq!(
            coordinator.on_query_received(viewer, addr(), ViewerQuery::default()),
            QueryRouting::Created
        );
        assert_eq!(
            coordinator.on_query_received(viewer, addr(), ViewerQuery::default()),
            QueryRouting::Updated
        );
        assert_eq!(coordinator.viewer_count(), 1);
        assert_eq!(coordinator.stats().metrics.viewers_connected, 1);
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn goodbye_removes_viewer_and_worker_is_joined() {
        let (coordinator, _) = coordinator();
        let viewer = Uuid::new_v4();
        coordinator.on_query_received(viewer, addr(), ViewerQuery::default());
        coordinator
            .handle_datagram(addr(), &encode_goodbye(viewer))
            .expect("goodbye");
        assert!(!coordinator.has_worker(&viewer));
        assert_eq!(coordinator.directory().lookup(&viewer), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coordinator.reap(Instant::now()).joined, 1);
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_viewers_are_evicted() {
        let (coordinator, _) = coordinator();
        let viewer = Uuid::new_v4();
        coordinator.on_query_received(viewer, addr(), ViewerQuery::default());
        tokio::time::sleep(Duration::from_secs(31)).await;
        let summary = coordinator.reap(Instant::now());
        assert_eq!(summary.idle_removed, 1);
        assert_eq!(coordinator.viewer_count(), 0);
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ignores_later_queries_and_releases_tree() {
        let (coordinator, _) = coordinator();
        coordinator.on_query_received(Uuid::new_v4(), addr(), ViewerQuery::default());
        coordinator.on_query_received(Uuid::new_v4(), addr(), ViewerQuery::default());
        coordinator.shutdown().await;
        assert_eq!(coordinator.viewer_count(), 0);
        assert!(coordinator.tree().is_none());
        assert_eq!(
            coordinator.on_query_received(Uuid::new_v4(), addr(), ViewerQuery::default()),
            QueryRouting::Ignored
        );
        assert!(matches!(
            coordinator.handle_datagram(addr(), &encode_goodbye(Uuid::new_v4())),
            Err(StreamError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_counters() {
        let (coordinator, _) = coordinator();
        coordinator.metrics().record_packet(100, 10);
        assert_eq!(coordinator.stats().metrics.bytes_sent, 100);
        coordinator.reset_stats();
        assert_eq!(coordinator.stats().metrics.bytes_sent, 0);
        coordinator.shutdown().await;
    }
}
