//! Per-viewer streaming state.
//!
//! A [`ViewerSession`] is owned by exactly one send worker and is never
//! shared. Inbound traffic reaches it through the [`SessionInbox`], which the
//! coordinator writes without waiting on the worker and the worker drains at
//! the top of every pass.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::error::ProtocolResult;
use crate::frustum::{FrustumTolerance, ViewSet};
use crate::history::SentPacketHistory;
use crate::packet::{OutgoingPacket, PacketType, SentPacket};
use crate::protocol::{NackMessage, ViewerId, ViewerQuery};
use crate::sequence::{Seq, SequenceCounter};
use crate::tree::{ContentFilter, EncodeProgress};

/// Raw NACK bodies queued beyond this are dropped oldest first.
const MAX_PENDING_NACK_MESSAGES: usize = 256;

/// Hand-off point between the coordinator's receive path and a worker.
#[derive(Debug, Default)]
pub struct SessionInbox {
    query: Mutex<Option<ViewerQuery>>,
    nacks: Mutex<VecDeque<Bytes>>,
    shutting_down: AtomicBool,
}

impl SessionInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any query the worker has not picked up yet.
    pub fn post_query(&self, query: ViewerQuery) {
        *self.query.lock() = Some(query);
    }

    pub fn take_query(&self) -> Option<ViewerQuery> {
        self.query.lock().take()
    }

    pub fn post_nack(&self, body: Bytes) {
        let mut nacks = self.nacks.lock();
        if nacks.len() >= MAX_PENDING_NACK_MESSAGES {
            nacks.pop_front();
        }
        nacks.push_back(body);
    }

    pub fn drain_nacks(&self) -> Vec<Bytes> {
        self.nacks.lock().drain(..).collect()
    }

    pub fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

/// Whether the last traversal reached the end of the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalCompletion {
    NotStarted,
    Partial,
    Complete,
}

#[derive(Debug)]
struct LastSent {
    payload: Bytes,
    at: Instant,
}

#[derive(Debug)]
pub struct ViewerSession {
    viewer_id: ViewerId,
    inbox: Arc<SessionInbox>,
    tolerance: FrustumTolerance,
    suppress_duplicates: bool,
    min_resend_interval: Duration,
    oversize_multiplier: usize,

    current_view: ViewSet,
    has_view: bool,
    view_changed: bool,
    lod_changed: bool,
    view_was_changing: bool,
    view_stopped_changing: bool,
    view_sent: bool,
    force_full_scene: bool,

    packet: OutgoingPacket,
    last_sent: Option<LastSent>,
    sequence: SequenceCounter,
    stats_sequence: SequenceCounter,
    nack_queue: VecDeque<Seq>,
    history: SentPacketHistory,

    requested_filter: ContentFilter,
    applied_filter: ContentFilter,
    max_packets_per_second: u32,

    completion: TraversalCompletion,
    traversal_started_at: Option<Instant>,
    encode_progress: EncodeProgress,
}

impl ViewerSession {
    pub fn new(viewer_id: ViewerId, inbox: Arc<SessionInbox>, config: &StreamConfig) -> Self {
        Self {
            viewer_id,
            inbox,
            tolerance: FrustumTolerance::from_config(config),
            suppress_duplicates: config.suppress_duplicates,
            min_resend_interval: config.min_resend_interval(),
            oversize_multiplier: config.max_oversize_multiplier,
            current_view: ViewSet::default(),
            has_view: false,
            view_changed: false,
            lod_changed: false,
            view_was_changing: false,
            view_stopped_changing: false,
            view_sent: false,
            force_full_scene: false,
            packet: OutgoingPacket::new(config.max_packet_size),
            last_sent: None,
            sequence: SequenceCounter::default(),
            stats_sequence: SequenceCounter::default(),
            nack_queue: VecDeque::new(),
            history: SentPacketHistory::new(config.history_capacity),
            requested_filter: ContentFilter::default(),
            applied_filter: ContentFilter::default(),
            max_packets_per_second: 0,
            completion: TraversalCompletion::NotStarted,
            traversal_started_at: None,
            encode_progress: EncodeProgress::default(),
        }
    }

    pub fn viewer_id(&self) -> ViewerId {
        self.viewer_id
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inbox.is_shutting_down()
    }

    pub fn has_received_query(&self) -> bool {
        self.has_view
    }

    /// Applies a query from the viewer. A filter that fails to parse leaves
    /// the previous filter in place.
    pub fn apply_query(&mut self, query: ViewerQuery) {
        match query.content_filter() {
            Ok(filter) => self.requested_filter = filter,
            Err(err) => debug!(
                target = "stream::session",
                viewer = %self.viewer_id,
                error = %err,
                "ignoring unparsable content filter"
            ),
        }
        self.max_packets_per_second = query.max_packets_per_second;
        self.force_full_scene |= query.force_full_scene;
        self.update_view_frustum(ViewSet::new(query.frustums, query.lod));
    }

    /// Compares `view` with the last accepted view. Returns true when it
    /// differs beyond tolerance or the LOD changed. Drift within tolerance
    /// does not replace the reference view.
    pub fn update_view_frustum(&mut self, view: ViewSet) -> bool {
        let first = !self.has_view;
        let lod_changed = !first && view.lod != self.current_view.lod;
        let changed = first || !view.is_similar(&self.current_view, &self.tolerance);

        self.view_stopped_changing = self.view_was_changing && !changed;
        self.view_was_changing = changed && !first;

        if changed || lod_changed {
            self.current_view = ViewSet {
                moving: changed && !first,
                ..view
            };
        } else if self.view_stopped_changing {
            self.current_view.moving = false;
        }
        self.has_view = true;
        self.view_changed |= changed || self.view_stopped_changing;
        self.lod_changed |= lod_changed;
        if changed || lod_changed {
            self.view_sent = false;
        }
        changed || lod_changed
    }

    /// Consumes the pending view/LOD change.
    pub fn take_view_changed(&mut self) -> bool {
        let changed = self.view_changed || self.lod_changed;
        self.view_changed = false;
        self.lod_changed = false;
        changed
    }

    pub fn view_stopped_changing(&self) -> bool {
        self.view_stopped_changing
    }

    pub fn current_view(&self) -> &ViewSet {
        &self.current_view
    }

    pub fn request_full_scene(&mut self) {
        self.force_full_scene = true;
    }

    pub fn take_force_full_scene(&mut self) -> bool {
        std::mem::take(&mut self.force_full_scene)
    }

    pub fn view_sent(&self) -> bool {
        self.view_sent
    }

    pub fn set_view_sent(&mut self, sent: bool) {
        self.view_sent = sent;
    }

    pub fn completion(&self) -> TraversalCompletion {
        self.completion
    }

    pub fn set_completion(&mut self, completion: TraversalCompletion) {
        self.completion = completion;
    }

    pub fn traversal_started_at(&self) -> Option<Instant> {
        self.traversal_started_at
    }

    pub fn mark_traversal_started(&mut self, now: Instant) {
        self.traversal_started_at = Some(now);
        self.completion = TraversalCompletion::Partial;
    }

    pub fn max_packets_per_second(&self) -> u32 {
        self.max_packets_per_second
    }

    pub fn content_filter(&self) -> &ContentFilter {
        &self.applied_filter
    }

    /// True once per filter change; the new filter becomes the applied one.
    pub fn have_json_parameters_changed(&mut self) -> bool {
        if self.requested_filter == self.applied_filter {
            return false;
        }
        self.applied_filter = self.requested_filter.clone();
        true
    }

    pub fn encode_progress_mut(&mut self) -> &mut EncodeProgress {
        &mut self.encode_progress
    }

    /// The applied filter and the partial-encode state, borrowed together.
    pub fn encode_parts(&mut self) -> (&ContentFilter, &mut EncodeProgress) {
        (&self.applied_filter, &mut self.encode_progress)
    }

    /// Truncates the active buffer past its header. `as_list` selects the
    /// oversized variant, sent as a packet list.
    pub fn reset_outgoing_packet(&mut self, as_list: bool) {
        let multiplier = if as_list { self.oversize_multiplier } else { 1 };
        self.packet.reset(as_list, multiplier);
    }

    pub fn write_to_packet(&mut self, bytes: &[u8]) -> bool {
        self.packet.write(bytes)
    }

    pub fn is_packet_waiting(&self) -> bool {
        self.packet.has_payload()
    }

    pub fn available(&self) -> usize {
        self.packet.available()
    }

    pub fn pending_payload_len(&self) -> usize {
        self.packet.payload().len()
    }

    pub fn is_packet_list(&self) -> bool {
        self.packet.is_list()
    }

    /// Number of datagrams the pending packet will occupy once finalized.
    pub fn pending_datagram_count(&self, max_packet_size: usize) -> usize {
        if !self.packet.is_list() {
            return 1;
        }
        let per_datagram = max_packet_size
            .saturating_sub(crate::packet::DATA_HEADER_LEN + crate::packet::LIST_HEADER_EXTRA)
            .max(1);
        self.packet.payload().len().div_ceil(per_datagram).max(1)
    }

    /// Byte-compares the pending packet with the last one sent.
    pub fn packet_is_duplicate(&self) -> bool {
        match &self.last_sent {
            Some(last) => self.packet.has_payload() && last.payload == self.packet.payload(),
            None => false,
        }
    }

    /// Whether the pending packet should be dropped as a duplicate. Once the
    /// minimum resend interval has passed since the last send a duplicate goes
    /// out anyway. Does not mutate state.
    pub fn should_suppress_duplicate_packet(&self, now: Instant) -> bool {
        if !self.suppress_duplicates || !self.packet_is_duplicate() {
            return false;
        }
        match &self.last_sent {
            Some(last) => now.saturating_duration_since(last.at) < self.min_resend_interval,
            None => false,
        }
    }

    /// Sequence number the next data packet will carry.
    pub fn next_sequence(&self) -> Seq {
        self.sequence.peek()
    }

    /// Stamps the pending packet with the next sequence number, records it in
    /// the history and resets the buffer. Returns the wire form.
    pub fn finalize_outgoing_packet(&mut self, flags: u8, now: Instant, sent_at_us: u64) -> (Seq, SentPacket) {
        let seq = self.sequence.advance();
        let packet = self
            .packet
            .finalize(PacketType::OctreeData, flags, seq, sent_at_us);
        self.history.record(seq, &packet);
        self.last_sent = Some(LastSent {
            payload: Bytes::copy_from_slice(self.packet.payload()),
            at: now,
        });
        self.reset_outgoing_packet(false);
        (seq, packet)
    }

    /// Builds a scene stats packet under its own sequence space. Stats are
    /// not retransmittable and do not touch the data history.
    pub fn scene_stats_packet(&mut self, body: &[u8], sent_at_us: u64, max_packet_size: usize) -> SentPacket {
        let mut packet = OutgoingPacket::new(max_packet_size);
        packet.reset(false, 1);
        packet.write(body);
        let seq = self.stats_sequence.advance();
        packet.finalize(PacketType::SceneStats, 0, seq, sent_at_us)
    }

    /// Discards the pending packet without sending it.
    pub fn discard_pending_packet(&mut self) {
        self.reset_outgoing_packet(false);
    }

    /// Queues the sequence numbers listed in a NACK body.
    pub fn parse_nack_packet(&mut self, body: &[u8]) -> ProtocolResult<usize> {
        let message = NackMessage::parse(body)?;
        let count = message.missing.len();
        for seq in message.missing {
            if self.nack_queue.len() >= self.history.capacity() {
                self.nack_queue.pop_front();
            }
            self.nack_queue.push_back(seq);
        }
        trace!(target = "stream::session", viewer = %self.viewer_id, count, "queued nacks");
        Ok(count)
    }

    pub fn has_next_nacked_packet(&self) -> bool {
        !self.nack_queue.is_empty()
    }

    pub fn pending_nacks(&self) -> usize {
        self.nack_queue.len()
    }

    /// Pops the next NACKed sequence number and resolves it against the
    /// history. Evicted or unknown sequences yield `None` and are dropped.
    pub fn get_next_nacked_packet(&mut self) -> Option<(Seq, SentPacket)> {
        let seq = self.nack_queue.pop_front()?;
        self.history.get_packet(seq).map(|packet| (seq, packet))
    }

    /// Puts a resolved NACK back at the front, e.g. when the budget ran out.
    pub fn requeue_nack(&mut self, seq: Seq) {
        self.nack_queue.push_front(seq);
    }

    pub fn history(&self) -> &SentPacketHistory {
        &self.history
    }
}
