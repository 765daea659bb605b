//! The per-viewer send loop.
//!
//! One [`SendWorker`] runs per connected viewer. Each interval it performs a
//! distribution pass: pick up the latest query and NACKs, resend what was
//! NACKed, flush any packet held back by the throttle, then traverse the
//! shared tree and send packets until the viewer's interval budget, the
//! server budget or the traversal runs out. Packets finalized during a pass
//! are handed to the transport once the tree lock is released. Between
//! passes it sleeps until the next interval boundary.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::StreamConfig;
use crate::directory::MembershipDirectory;
use crate::error::TransportError;
use crate::metrics::{ActivityKind, Metrics, Phase, WorkerCounters};
use crate::packet::{
    PacketData, SentPacket, COMPRESS_PADDING, DATA_HEADER_LEN, FLAG_FULL_SCENE, LIST_HEADER_EXTRA,
    MINIMUM_ATTEMPT_MORE_PACKING, REASONABLE_NUMBER_OF_PACKING_ATTEMPTS,
};
use crate::policy::{policy_for, PayloadBuffers, StopReason, TraversalKind, TraversalPolicy, TraversalRequest};
use crate::protocol::{SceneStats, ViewerId};
use crate::session::{SessionInbox, TraversalCompletion, ViewerSession};
use crate::throttle::{BandwidthConfig, IntervalBudget, Throttle};
use crate::transport::DatagramTransport;
use crate::tree::{SharedTree, SpatialTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    WaitingTurn,
    Traversing,
    Sending,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassStatus {
    #[default]
    Ran,
    /// No query has arrived yet, so there is no view to stream.
    AwaitingQuery,
    /// The viewer left the membership directory; the pass was abandoned.
    ViewerGone,
    ShuttingDown,
}

/// What one distribution pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassSummary {
    pub status: PassStatus,
    pub traversal: Option<TraversalKind>,
    /// Data packets sent under a new sequence number.
    pub packets_sent: u32,
    pub datagrams_sent: u32,
    pub elements_sent: u32,
    pub suppressed: u32,
    pub retransmitted: u32,
    pub scene_completed: bool,
}

/// Handles shared by every worker a coordinator spawns.
pub struct WorkerContext<T: SpatialTree> {
    pub tree: SharedTree<T>,
    pub directory: Arc<MembershipDirectory>,
    pub transport: Arc<dyn DatagramTransport>,
    pub server_budget: Arc<IntervalBudget>,
    pub bandwidth: BandwidthConfig,
    pub active_viewers: Arc<AtomicUsize>,
    pub metrics: Arc<Metrics>,
    pub config: StreamConfig,
}

impl<T: SpatialTree> Clone for WorkerContext<T> {
    fn clone(&self) -> Self {
        Self {
            tree: Arc::clone(&self.tree),
            directory: Arc::clone(&self.directory),
            transport: Arc::clone(&self.transport),
            server_budget: Arc::clone(&self.server_budget),
            bandwidth: self.bandwidth,
            active_viewers: Arc::clone(&self.active_viewers),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SceneTally {
    elements: u32,
    packets: u32,
    bytes: u64,
    started: Instant,
}

impl SceneTally {
    fn started(at: Instant) -> Self {
        Self {
            elements: 0,
            packets: 0,
            bytes: 0,
            started: at,
        }
    }
}

pub struct SendWorker<T: SpatialTree> {
    session: ViewerSession,
    inbox: Arc<SessionInbox>,
    policy: Box<dyn TraversalPolicy<T>>,
    tree: SharedTree<T>,
    directory: Arc<MembershipDirectory>,
    transport: Arc<dyn DatagramTransport>,
    throttle: Throttle,
    bandwidth: BandwidthConfig,
    active_viewers: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
    counters: Arc<WorkerCounters>,
    config: StreamConfig,
    normal: PacketData,
    large: PacketData,
    /// Oversized section encoded but not yet sent.
    pending_large: Option<Vec<u8>>,
    /// Finalized packets waiting for the end of the pass.
    outbox: Vec<(SocketAddr, SentPacket)>,
    scene: SceneTally,
    full_scene: bool,
    state: WorkerState,
}

impl<T: SpatialTree> SendWorker<T> {
    pub fn new(
        viewer_id: ViewerId,
        inbox: Arc<SessionInbox>,
        counters: Arc<WorkerCounters>,
        context: &WorkerContext<T>,
    ) -> Self {
        let config = context.config.clone();
        let session = ViewerSession::new(viewer_id, Arc::clone(&inbox), &config);
        let throttle = Throttle::new(
            Arc::clone(&context.server_budget),
            context.bandwidth.packets_per_viewer_per_interval,
        );
        let full_target = full_section_target(&config);
        Self {
            session,
            inbox,
            policy: policy_for(&config),
            tree: Arc::clone(&context.tree),
            directory: Arc::clone(&context.directory),
            transport: Arc::clone(&context.transport),
            throttle,
            bandwidth: context.bandwidth,
            active_viewers: Arc::clone(&context.active_viewers),
            metrics: Arc::clone(&context.metrics),
            counters,
            normal: PacketData::new(full_target),
            large: PacketData::new(list_unit(&config)),
            pending_large: None,
            outbox: Vec::new(),
            scene: SceneTally::started(Instant::now()),
            full_scene: false,
            state: WorkerState::WaitingTurn,
            config,
        }
    }

    pub fn viewer_id(&self) -> ViewerId {
        self.session.viewer_id()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn session(&self) -> &ViewerSession {
        &self.session
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn counters(&self) -> &Arc<WorkerCounters> {
        &self.counters
    }

    /// Runs passes until the session is marked shutting down.
    pub async fn run(mut self) {
        let viewer = self.viewer_id();
        info!(
            target = "stream::worker",
            viewer = %viewer,
            policy = ?self.policy.kind(),
            "send worker started"
        );
        loop {
            let started = Instant::now();
            let summary = self.distribution_pass(started);
            self.metrics
                .track_phase(Phase::Loop, Some(started.elapsed()));
            match summary.status {
                PassStatus::ShuttingDown => break,
                PassStatus::ViewerGone => {
                    trace!(target = "stream::worker", viewer = %viewer, "viewer not in directory")
                }
                PassStatus::Ran if summary.packets_sent > 0 || summary.retransmitted > 0 => {
                    debug!(
                        target = "stream::worker",
                        viewer = %viewer,
                        traversal = ?summary.traversal,
                        packets = summary.packets_sent,
                        elements = summary.elements_sent,
                        retransmitted = summary.retransmitted,
                        suppressed = summary.suppressed,
                        "distribution pass"
                    );
                }
                _ => {}
            }

            self.state = WorkerState::WaitingTurn;
            let slept = self.throttle.sleep_until_next_interval().await;
            self.metrics.record_sleep(slept);
            if self.session.is_shutting_down() {
                break;
            }
        }
        self.state = WorkerState::ShuttingDown;
        let counters = self.counters.snapshot();
        info!(
            target = "stream::worker",
            viewer = %viewer,
            packets = counters.packets_sent,
            bytes = counters.bytes_sent,
            sleep_calls = self.throttle.sleep_calls(),
            "send worker stopped"
        );
    }

    /// One distribution pass. Synchronous: the tree read lock is held only
    /// inside this call and never across an await, and is released before
    /// any datagram reaches the transport.
    pub fn distribution_pass(&mut self, now: Instant) -> PassSummary {
        let summary = self.prepare_pass(now);
        self.flush_outbox();
        summary
    }

    fn prepare_pass(&mut self, now: Instant) -> PassSummary {
        let mut summary = PassSummary::default();
        let viewer = self.viewer_id();
        if self.session.is_shutting_down() {
            self.state = WorkerState::ShuttingDown;
            summary.status = PassStatus::ShuttingDown;
            return summary;
        }

        self.drain_inbox();
        if !self.session.has_received_query() {
            summary.status = PassStatus::AwaitingQuery;
            return summary;
        }
        if self.directory.lookup(&viewer).is_none() {
            summary.status = PassStatus::ViewerGone;
            return summary;
        }
        WorkerCounters::add(&self.counters.passes, 1);
        self.metrics
            .mark_activity(viewer, ActivityKind::Processed, now);
        self.refresh_budget();

        self.state = WorkerState::Sending;
        self.resend_nacked(now, &mut summary);
        if !self.flush_waiting(now, &mut summary) {
            return summary;
        }

        let view_changed = self.session.take_view_changed();
        let filter_changed = self.session.have_json_parameters_changed();
        let forced = self.session.take_force_full_scene() || filter_changed;
        let timed_out = self.session.completion() == TraversalCompletion::Partial
            && self
                .session
                .traversal_started_at()
                .is_some_and(|started| now.saturating_duration_since(started) >= self.config.max_no_update());

        let tree = Arc::clone(&self.tree);
        let guard = {
            let _wait = self.metrics.phase_timer(Phase::LockWait);
            tree.read()
        };

        let fresh = self.session.completion() == TraversalCompletion::NotStarted
            || view_changed
            || forced
            || timed_out
            || self
                .policy
                .should_start_new_traversal(&self.session, view_changed);
        if fresh {
            self.policy
                .pre_distribution_processing(&guard, &mut self.session);
            let kind = self.policy.start_traversal(
                &guard,
                &self.session,
                TraversalRequest {
                    view_changed,
                    full_scene: forced,
                },
            );
            if kind != TraversalKind::Repeat {
                self.session.encode_progress_mut().clear();
            }
            self.session.mark_traversal_started(now);
            self.full_scene = forced;
            self.scene = SceneTally::started(now);
            summary.traversal = Some(kind);
            if kind != TraversalKind::Repeat {
                debug!(
                    target = "stream::worker",
                    viewer = %viewer,
                    ?kind,
                    view_changed,
                    forced,
                    timed_out,
                    "starting traversal"
                );
            }
        }

        self.state = WorkerState::Traversing;
        {
            let _traversal = self.metrics.phase_timer(Phase::Traversal);
            self.policy
                .traverse(&guard, self.config.traversal_budget());
        }
        self.encode_and_send(&guard, now, &mut summary);
        drop(guard);

        let drained = !self.policy.has_content_to_send(&self.session)
            && !self.session.is_packet_waiting()
            && self.pending_large.is_none();
        if drained && summary.status == PassStatus::Ran {
            self.finish_scene(now, &mut summary);
        }
        self.metrics
            .mark_activity(viewer, ActivityKind::Distributed, now);
        summary
    }

    fn drain_inbox(&mut self) {
        if let Some(query) = self.inbox.take_query() {
            self.session.apply_query(query);
        }
        for body in self.inbox.drain_nacks() {
            if let Err(err) = self.session.parse_nack_packet(&body) {
                debug!(
                    target = "stream::worker",
                    viewer = %self.session.viewer_id(),
                    error = %err,
                    "dropping malformed nack"
                );
            }
        }
    }

    fn refresh_budget(&mut self) {
        let viewers = self.active_viewers.load(Ordering::Relaxed);
        let capacity = self
            .bandwidth
            .per_viewer_budget(self.session.max_packets_per_second(), viewers);
        if capacity != self.throttle.viewer_capacity() {
            trace!(
                target = "stream::throttle",
                viewer = %self.session.viewer_id(),
                capacity,
                viewers,
                "viewer budget changed"
            );
            self.throttle.set_viewer_capacity(capacity);
        }
    }

    fn encode_and_send(&mut self, tree: &T, now: Instant, summary: &mut PassSummary) {
        let full_target = full_section_target(&self.config);
        let list_unit = list_unit(&self.config);
        let mut elements_left = self.config.max_elements_per_pass;
        let mut packing_attempts = 0u32;
        let mut target = self.session.available();

        loop {
            if self.session.is_shutting_down()
                || elements_left == 0
                || !self.policy.has_content_to_send(&self.session)
            {
                break;
            }
            if !self.throttle.has_capacity(now) {
                trace!(
                    target = "stream::throttle",
                    viewer = %self.session.viewer_id(),
                    "interval budget exhausted"
                );
                break;
            }

            self.normal.change_settings(target);
            let outcome = {
                let _encode = self.metrics.phase_timer(Phase::Encode);
                let mut buffers = PayloadBuffers {
                    normal: &mut self.normal,
                    large: &mut self.large,
                    full_target,
                    list_unit,
                    max_multiplier: self.config.max_oversize_multiplier,
                    elements_left,
                };
                let outcome = self
                    .policy
                    .build_next_packet_payload(tree, &mut self.session, &mut buffers);
                elements_left = buffers.elements_left;
                outcome
            };
            summary.elements_sent += outcome.elements;
            self.scene.elements += outcome.elements;
            WorkerCounters::add(&self.counters.elements_sent, u64::from(outcome.elements));
            if outcome.oversized_skips > 0 {
                debug!(
                    target = "stream::worker",
                    viewer = %self.session.viewer_id(),
                    skipped = outcome.oversized_skips,
                    "elements too large for any packet, retrying next pass"
                );
                for _ in 0..outcome.oversized_skips {
                    self.metrics.record_oversized_skip();
                }
            }

            let wrote_section = self.normal.has_content();
            if wrote_section {
                let _write = self.metrics.phase_timer(Phase::CompressWrite);
                let section = self.normal.finalized();
                if !self.session.write_to_packet(&section) {
                    warn!(
                        target = "stream::worker",
                        viewer = %self.session.viewer_id(),
                        section = section.len(),
                        available = self.session.available(),
                        "section did not fit its packet, dropping it"
                    );
                }
            } else {
                self.metrics.track_phase(Phase::CompressWrite, None);
            }

            match outcome.stop {
                StopReason::SentLarge => {
                    self.pending_large = Some(self.large.finalized());
                    self.large.change_settings(list_unit);
                    if !self.flush_waiting(now, summary) {
                        break;
                    }
                    packing_attempts = 0;
                }
                StopReason::DidntFit => {
                    packing_attempts += 1;
                    let send_now = !wrote_section
                        || self.session.available() < MINIMUM_ATTEMPT_MORE_PACKING
                        || packing_attempts > REASONABLE_NUMBER_OF_PACKING_ATTEMPTS;
                    if send_now {
                        if !self.send_pending(now, summary) {
                            break;
                        }
                        packing_attempts = 0;
                    }
                }
                StopReason::Finished | StopReason::ElementBudget => break,
            }

            target = if self.session.is_packet_waiting() {
                self.session.available().saturating_sub(COMPRESS_PADDING)
            } else {
                self.session.available()
            };
        }

        if self.session.is_packet_waiting() {
            self.send_pending(now, summary);
        }
    }

    /// Sends the waiting normal packet, then any held oversized section.
    /// False when something is still held back.
    fn flush_waiting(&mut self, now: Instant, summary: &mut PassSummary) -> bool {
        if !self.send_pending(now, summary) {
            return false;
        }
        let Some(section) = self.pending_large.take() else {
            return true;
        };
        self.session.reset_outgoing_packet(true);
        if !self.session.write_to_packet(&section) {
            warn!(
                target = "stream::worker",
                viewer = %self.session.viewer_id(),
                section = section.len(),
                "oversized section exceeds the packet list capacity, dropping it"
            );
            self.session.discard_pending_packet();
            return true;
        }
        self.metrics.record_oversized();
        self.send_pending(now, summary)
    }

    /// Hands the pending packet to the transport. Returns true when the
    /// packet is gone (sent or suppressed as a duplicate) and false when it
    /// is still waiting.
    fn send_pending(&mut self, now: Instant, summary: &mut PassSummary) -> bool {
        if !self.session.is_packet_waiting() {
            return true;
        }
        if self.session.is_shutting_down() {
            return false;
        }
        let viewer = self.session.viewer_id();

        if self.session.should_suppress_duplicate_packet(now) {
            let bytes = self.session.pending_payload_len();
            self.session.discard_pending_packet();
            self.metrics.record_suppressed(bytes);
            WorkerCounters::add(&self.counters.suppressed_packets, 1);
            WorkerCounters::add(&self.counters.wasted_bytes, bytes as u64);
            summary.suppressed += 1;
            trace!(target = "stream::worker", viewer = %viewer, bytes, "duplicate packet suppressed");
            return true;
        }

        let Some(addr) = self.directory.lookup(&viewer) else {
            summary.status = PassStatus::ViewerGone;
            return false;
        };
        let datagrams = self
            .session
            .pending_datagram_count(self.config.max_packet_size);
        let datagrams = u32::try_from(datagrams).unwrap_or(u32::MAX);
        if !self.throttle.try_acquire(datagrams, now) {
            trace!(target = "stream::throttle", viewer = %viewer, datagrams, "packet held for next interval");
            return false;
        }

        let flags = if self.full_scene { FLAG_FULL_SCENE } else { 0 };
        let (seq, packet) = self
            .session
            .finalize_outgoing_packet(flags, now, wall_clock_micros());
        self.transmit(addr, &packet);

        let bytes = packet.byte_len();
        let capacity = self.config.max_packet_size * packet.datagram_count();
        self.metrics
            .record_packet(bytes, capacity.saturating_sub(bytes));
        WorkerCounters::add(&self.counters.packets_sent, 1);
        WorkerCounters::add(&self.counters.bytes_sent, bytes as u64);
        self.metrics.mark_activity(viewer, ActivityKind::Sent, now);
        self.scene.packets += 1;
        self.scene.bytes += bytes as u64;
        summary.packets_sent += 1;
        summary.datagrams_sent += datagrams;
        trace!(
            target = "stream::worker",
            viewer = %viewer,
            seq,
            bytes,
            datagrams,
            "packet sent"
        );
        true
    }

    /// Resends NACKed packets verbatim under their original sequence numbers
    /// while the interval budget allows.
    fn resend_nacked(&mut self, now: Instant, summary: &mut PassSummary) {
        let viewer = self.session.viewer_id();
        while self.session.has_next_nacked_packet() && !self.session.is_shutting_down() {
            let Some((seq, packet)) = self.session.get_next_nacked_packet() else {
                self.metrics.record_nack_miss();
                continue;
            };
            let Some(addr) = self.directory.lookup(&viewer) else {
                self.session.requeue_nack(seq);
                summary.status = PassStatus::ViewerGone;
                return;
            };
            let datagrams = u32::try_from(packet.datagram_count()).unwrap_or(u32::MAX);
            if !self.throttle.try_acquire(datagrams, now) {
                self.session.requeue_nack(seq);
                return;
            }
            self.transmit(addr, &packet);
            let bytes = packet.byte_len();
            self.metrics.record_retransmit(bytes);
            WorkerCounters::add(&self.counters.retransmitted_packets, 1);
            WorkerCounters::add(&self.counters.bytes_sent, bytes as u64);
            summary.retransmitted += 1;
            summary.datagrams_sent += datagrams;
            trace!(target = "stream::worker", viewer = %viewer, seq, "nacked packet resent");
        }
    }

    fn transmit(&mut self, addr: SocketAddr, packet: &SentPacket) {
        self.outbox.push((addr, packet.clone()));
    }

    fn flush_outbox(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let _send = self.metrics.phase_timer(Phase::Send);
        for (addr, packet) in self.outbox.drain(..) {
            for datagram in packet.datagrams() {
                match self.transport.send_datagram(addr, datagram) {
                    Ok(()) => {}
                    Err(TransportError::WouldBlock) => {
                        self.metrics.record_transport_error();
                        debug!(target = "stream::worker", %addr, "socket buffer full, datagram dropped");
                    }
                    Err(err) => {
                        self.metrics.record_transport_error();
                        warn!(target = "stream::worker", %addr, error = %err, "datagram send failed");
                    }
                }
            }
        }
    }

    fn finish_scene(&mut self, now: Instant, summary: &mut PassSummary) {
        if self.session.completion() != TraversalCompletion::Partial {
            return;
        }
        self.session.set_completion(TraversalCompletion::Complete);
        self.session.set_view_sent(true);
        if self.scene.elements == 0 && !self.full_scene {
            return;
        }
        WorkerCounters::add(&self.counters.scenes_completed, 1);
        self.metrics.record_scene_completed();
        summary.scene_completed = true;
        self.send_scene_stats(now);
    }

    fn send_scene_stats(&mut self, now: Instant) {
        let viewer = self.session.viewer_id();
        let stats = SceneStats {
            elements: self.scene.elements,
            packets: self.scene.packets,
            bytes: self.scene.bytes,
            elapsed_us: u64::try_from(now.saturating_duration_since(self.scene.started).as_micros())
                .unwrap_or(u64::MAX),
            full_scene: self.full_scene,
        };
        let body = match stats.to_bytes() {
            Ok(body) => body,
            Err(err) => {
                warn!(target = "stream::worker", viewer = %viewer, error = %err, "failed to encode scene stats");
                return;
            }
        };
        let Some(addr) = self.directory.lookup(&viewer) else {
            return;
        };
        if !self.throttle.try_acquire(1, now) {
            trace!(target = "stream::worker", viewer = %viewer, "no budget left for scene stats");
            return;
        }
        let packet = self
            .session
            .scene_stats_packet(&body, wall_clock_micros(), self.config.max_packet_size);
        self.transmit(addr, &packet);
        let bytes = packet.byte_len();
        self.metrics.record_packet(bytes, 0);
        WorkerCounters::add(&self.counters.bytes_sent, bytes as u64);
        debug!(
            target = "stream::worker",
            viewer = %viewer,
            elements = stats.elements,
            packets = stats.packets,
            full_scene = stats.full_scene,
            "scene complete"
        );
    }
}

/// Section target of an empty single-datagram packet.
fn full_section_target(config: &StreamConfig) -> usize {
    config.max_packet_size.saturating_sub(DATA_HEADER_LEN)
}

/// Section bytes carried by one datagram of a packet list.
fn list_unit(config: &StreamConfig) -> usize {
    config
        .max_packet_size
        .saturating_sub(DATA_HEADER_LEN + LIST_HEADER_EXTRA)
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
