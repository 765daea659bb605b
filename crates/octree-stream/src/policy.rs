//! Traversal policies decide which elements go into the next packet.
//!
//! A worker owns exactly one policy, picked from [`PolicyKind`] when the
//! session is created. The worker drives it in three steps per pass:
//! optionally [`TraversalPolicy::start_traversal`] from the root,
//! [`TraversalPolicy::traverse`] to advance any time-budgeted scanning, then
//! [`TraversalPolicy::build_next_packet_payload`] until the packet budget or
//! the policy's content runs out.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use ordered_float::OrderedFloat;
use tracing::trace;

use crate::config::{PolicyKind, StreamConfig};
use crate::frustum::ViewSet;
use crate::packet::PacketData;
use crate::session::ViewerSession;
use crate::tree::{AppendState, CellId, CellView, ContentFilter, ElementId, ElementInfo, EncodeProgress, SpatialTree};

/// Cells scanned per call before the time budget is consulted.
pub const MIN_CELLS_PER_SCAN: usize = 64;

/// Priority given to elements outside every frustum during a full scene.
const OUT_OF_VIEW_PRIORITY: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalKind {
    /// Everything relevant is sent; nothing is assumed known.
    First,
    /// Same view as the last completed traversal: only changed cells.
    Repeat,
    /// New view: anything the viewer does not already hold.
    Differential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraversalRequest {
    pub view_changed: bool,
    pub full_scene: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Nothing left to send right now.
    Finished,
    /// The next element did not fit the remaining target.
    DidntFit,
    /// An element was written into the oversized buffer.
    SentLarge,
    /// The per-pass element budget ran out.
    ElementBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadOutcome {
    pub stop: StopReason,
    pub elements: u32,
    pub oversized_skips: u32,
}

impl PayloadOutcome {
    fn new(stop: StopReason, elements: u32, oversized_skips: u32) -> Self {
        Self {
            stop,
            elements,
            oversized_skips,
        }
    }
}

/// Buffers and limits for one payload build.
pub struct PayloadBuffers<'a> {
    pub normal: &'a mut PacketData,
    pub large: &'a mut PacketData,
    /// Section target of an empty single-datagram packet. Only an element that
    /// fails against a target this large takes the oversized path.
    pub full_target: usize,
    /// Section bytes carried by one datagram of a packet list.
    pub list_unit: usize,
    pub max_multiplier: usize,
    pub elements_left: usize,
}

impl PayloadBuffers<'_> {
    fn normal_is_full_size(&self) -> bool {
        self.normal.target_size() >= self.full_target
    }

    /// Retries `id` in growing oversized buffers. Leaves the large buffer empty
    /// when no size up to the multiplier cap fits.
    fn encode_oversized<T: SpatialTree + ?Sized>(
        &mut self,
        tree: &T,
        id: ElementId,
        progress: &mut EncodeProgress,
    ) -> AppendState {
        for multiplier in 2..=self.max_multiplier {
            self.large.change_settings(self.list_unit * multiplier);
            let state = tree.append_element(id, self.large, progress);
            if state != AppendState::None {
                trace!(target = "stream::worker", element = id, multiplier, "element sent oversized");
                return state;
            }
        }
        self.large.change_settings(self.list_unit);
        AppendState::None
    }
}

pub trait TraversalPolicy<T: SpatialTree>: Send {
    fn kind(&self) -> PolicyKind;

    /// Whether the current traversal still has elements to hand out.
    fn has_content_to_send(&self, session: &ViewerSession) -> bool;

    fn should_start_new_traversal(&self, session: &ViewerSession, view_changed: bool) -> bool {
        view_changed || !self.has_content_to_send(session)
    }

    /// Housekeeping before a fresh traversal, run under the tree read lock.
    fn pre_distribution_processing(&mut self, tree: &T, session: &mut ViewerSession);

    /// Restarts from the root using the session's current view.
    fn start_traversal(&mut self, tree: &T, session: &ViewerSession, request: TraversalRequest) -> TraversalKind;

    /// Advances any incremental scanning within `budget`.
    fn traverse(&mut self, tree: &T, budget: Duration);

    fn build_next_packet_payload(
        &mut self,
        tree: &T,
        session: &mut ViewerSession,
        buffers: &mut PayloadBuffers<'_>,
    ) -> PayloadOutcome;
}

pub fn policy_for<T: SpatialTree>(config: &StreamConfig) -> Box<dyn TraversalPolicy<T>> {
    match config.policy {
        PolicyKind::Prioritized => Box::new(PrioritizedPolicy::new()),
        PolicyKind::Sweep => Box::new(SweepPolicy::new()),
    }
}

/// Filter bookkeeping shared by both policies: an element that matched the
/// filter once is sent again after it stops matching, so the viewer sees it
/// change.
#[derive(Debug, Default)]
struct FilterMemory {
    sent_matching: HashSet<ElementId>,
}

impl FilterMemory {
    fn should_send(&self, id: ElementId, matches: bool) -> bool {
        matches || self.sent_matching.contains(&id)
    }

    fn sent(&mut self, id: ElementId, matches: bool, filter: &ContentFilter) {
        if matches && !filter.is_empty() {
            self.sent_matching.insert(id);
        } else if !matches {
            self.sent_matching.remove(&id);
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(ElementId) -> bool) {
        self.sent_matching.retain(|id| keep(*id));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedElement {
    priority: OrderedFloat<f32>,
    id: ElementId,
}

impl Ord for QueuedElement {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueuedElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority-queue traversal with per-element known state.
///
/// Cells are scanned incrementally under a time budget; every relevant
/// element the viewer does not already hold at its current revision is
/// queued by priority. Packets are filled from the top of the queue.
#[derive(Debug, Default)]
pub struct PrioritizedPolicy {
    view: ViewSet,
    kind: Option<TraversalKind>,
    full_scene: bool,
    scan_stack: Vec<CellId>,
    queue: BinaryHeap<QueuedElement>,
    queued: HashSet<ElementId>,
    deferred: Vec<QueuedElement>,
    /// Tree revision at which each element was last sent to this viewer.
    known_state: HashMap<ElementId, u64>,
    filter_memory: FilterMemory,
    started_revision: u64,
    completed_revision: Option<u64>,
    completion_recorded: bool,
}

impl PrioritizedPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traversal_kind(&self) -> Option<TraversalKind> {
        self.kind
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn known_len(&self) -> usize {
        self.known_state.len()
    }

    fn scan_finished(&self) -> bool {
        self.scan_stack.is_empty()
    }

    fn cell_relevant(&self, cell: &CellView<'_>) -> bool {
        if self.kind == Some(TraversalKind::Repeat) {
            let since = self.completed_revision.unwrap_or(0);
            if cell.last_changed <= since {
                return false;
            }
        }
        self.full_scene
            || self
                .view
                .sphere_relevant(cell.bounds.center, cell.bounds.bounding_radius())
    }

    fn element_priority(&self, info: &ElementInfo) -> Option<f32> {
        if let Some(known) = self.known_state.get(&info.id) {
            if info.last_changed <= *known {
                return None;
            }
        }
        match self.view.compute_priority(info.center, info.radius) {
            Some(priority) => Some(priority),
            None if self.full_scene => Some(OUT_OF_VIEW_PRIORITY),
            None => None,
        }
    }

    fn enqueue(&mut self, element: QueuedElement) {
        if self.queued.insert(element.id) {
            self.queue.push(element);
        }
    }

    fn scan_cell<T: SpatialTree + ?Sized>(&mut self, tree: &T, cell_id: CellId) {
        let Some(cell) = tree.cell(cell_id) else {
            return;
        };
        if !self.cell_relevant(&cell) {
            return;
        }
        for id in cell.elements {
            if self.queued.contains(id) {
                continue;
            }
            let Some(info) = tree.element(*id) else {
                continue;
            };
            if let Some(priority) = self.element_priority(&info) {
                self.enqueue(QueuedElement {
                    priority: OrderedFloat(priority),
                    id: *id,
                });
            }
        }
        self.scan_stack.extend_from_slice(cell.children);
    }

    fn pop_top(&mut self) -> Option<QueuedElement> {
        let top = self.queue.pop()?;
        self.queued.remove(&top.id);
        Some(top)
    }

    fn note_completion(&mut self) {
        if self.completion_recorded || !self.scan_finished() || !self.queue.is_empty() {
            return;
        }
        self.completion_recorded = true;
        self.completed_revision = Some(self.started_revision);
    }
}

impl<T: SpatialTree> TraversalPolicy<T> for PrioritizedPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Prioritized
    }

    fn has_content_to_send(&self, _session: &ViewerSession) -> bool {
        !self.queue.is_empty() || !self.scan_finished()
    }

    fn pre_distribution_processing(&mut self, tree: &T, session: &mut ViewerSession) {
        self.known_state.retain(|id, _| tree.element(*id).is_some());
        self.filter_memory.retain(|id| tree.element(id).is_some());
        session
            .encode_progress_mut()
            .retain(|id| tree.element(id).is_some());
    }

    fn start_traversal(&mut self, tree: &T, session: &ViewerSession, request: TraversalRequest) -> TraversalKind {
        let previous_finished = self.kind.is_none() || self.completion_recorded;
        let kind = if request.full_scene || (self.completed_revision.is_none() && self.known_state.is_empty()) {
            TraversalKind::First
        } else if request.view_changed || !previous_finished {
            TraversalKind::Differential
        } else {
            TraversalKind::Repeat
        };
        if kind == TraversalKind::First {
            self.known_state.clear();
        }

        self.view = session.current_view().clone();
        self.full_scene = request.full_scene;
        self.kind = Some(kind);
        // Deferred elements are re-scored against the new view; those that
        // left it are dropped.
        let deferred = std::mem::take(&mut self.deferred);
        self.deferred = deferred
            .into_iter()
            .filter_map(|element| {
                let info = tree.element(element.id)?;
                let priority = self.element_priority(&info)?;
                Some(QueuedElement {
                    priority: OrderedFloat(priority),
                    id: element.id,
                })
            })
            .collect();
        self.queue.clear();
        self.queued.clear();
        self.scan_stack.clear();
        self.scan_stack.push(tree.root());
        self.started_revision = tree.revision();
        self.completion_recorded = false;
        kind
    }

    fn traverse(&mut self, tree: &T, budget: Duration) {
        for element in std::mem::take(&mut self.deferred) {
            self.enqueue(element);
        }
        let deadline = Instant::now() + budget;
        let mut scanned = 0usize;
        while let Some(cell_id) = self.scan_stack.pop() {
            self.scan_cell(tree, cell_id);
            scanned += 1;
            if scanned >= MIN_CELLS_PER_SCAN && Instant::now() >= deadline {
                break;
            }
        }
        trace!(
            target = "stream::worker",
            scanned,
            queued = self.queue.len(),
            finished = self.scan_finished(),
            "scan step"
        );
    }

    fn build_next_packet_payload(
        &mut self,
        tree: &T,
        session: &mut ViewerSession,
        buffers: &mut PayloadBuffers<'_>,
    ) -> PayloadOutcome {
        let send_revision = tree.revision();
        let (filter, progress) = session.encode_parts();
        let mut elements = 0u32;
        let mut skips = 0u32;

        while let Some(top) = self.queue.peek().copied() {
            if buffers.elements_left == 0 {
                return PayloadOutcome::new(StopReason::ElementBudget, elements, skips);
            }
            let id = top.id;
            if tree.element(id).is_none() {
                self.pop_top();
                self.known_state.remove(&id);
                progress.finish(id);
                continue;
            }
            let matches = tree.matches_filter(id, filter);
            if !self.filter_memory.should_send(id, matches) {
                self.pop_top();
                self.known_state.insert(id, send_revision);
                continue;
            }

            match tree.append_element(id, buffers.normal, progress) {
                AppendState::Completed => {}
                AppendState::Partial => {
                    elements += 1;
                    buffers.elements_left -= 1;
                    return PayloadOutcome::new(StopReason::DidntFit, elements, skips);
                }
                AppendState::None => {
                    if buffers.normal.has_content() || !buffers.normal_is_full_size() {
                        return PayloadOutcome::new(StopReason::DidntFit, elements, skips);
                    }
                    match buffers.encode_oversized(tree, id, progress) {
                        AppendState::Completed => {
                            self.pop_top();
                            self.known_state.insert(id, send_revision);
                            self.filter_memory.sent(id, matches, filter);
                            buffers.elements_left -= 1;
                            return PayloadOutcome::new(StopReason::SentLarge, elements + 1, skips);
                        }
                        AppendState::Partial => {
                            buffers.elements_left -= 1;
                            return PayloadOutcome::new(StopReason::SentLarge, elements + 1, skips);
                        }
                        AppendState::None => {
                            if let Some(element) = self.pop_top() {
                                self.deferred.push(element);
                            }
                            skips += 1;
                            continue;
                        }
                    }
                }
            }

            self.pop_top();
            self.known_state.insert(id, send_revision);
            self.filter_memory.sent(id, matches, filter);
            elements += 1;
            buffers.elements_left -= 1;
        }

        self.note_completion();
        PayloadOutcome::new(StopReason::Finished, elements, skips)
    }
}

/// Front-to-back depth-first sweep with a resumable cursor.
///
/// There is no per-element known state: a view change resends everything in
/// view, while a sweep under an unchanged view only enters cells that changed
/// since the last completed sweep.
#[derive(Debug, Default)]
pub struct SweepPolicy {
    view: ViewSet,
    kind: Option<TraversalKind>,
    full_scene: bool,
    stack: Vec<CellId>,
    cursor: Option<(CellId, usize)>,
    retry: Vec<ElementId>,
    deferred: Vec<ElementId>,
    changed_since: Option<u64>,
    filter_memory: FilterMemory,
    started_revision: u64,
    completed_revision: Option<u64>,
    completion_recorded: bool,
}

enum Candidate {
    Retry(ElementId),
    Cell(ElementId),
}

impl Candidate {
    fn id(&self) -> ElementId {
        match self {
            Candidate::Retry(id) | Candidate::Cell(id) => *id,
        }
    }
}

impl SweepPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traversal_kind(&self) -> Option<TraversalKind> {
        self.kind
    }

    fn changed_enough(&self, last_changed: u64) -> bool {
        self.changed_since.map_or(true, |since| last_changed > since)
    }

    fn cell_relevant(&self, cell: &CellView<'_>) -> bool {
        self.changed_enough(cell.last_changed)
            && (self.full_scene
                || self
                    .view
                    .sphere_relevant(cell.bounds.center, cell.bounds.bounding_radius()))
    }

    fn in_view(&self, info: &ElementInfo) -> bool {
        self.full_scene || self.view.compute_priority(info.center, info.radius).is_some()
    }

    fn wants(&self, info: &ElementInfo) -> bool {
        self.changed_enough(info.last_changed) && self.in_view(info)
    }

    /// Pushes children farthest first so the nearest is visited next.
    fn push_children<T: SpatialTree + ?Sized>(&mut self, tree: &T, children: &[CellId]) {
        let eye = self.view.frustums.first().map(|frustum| frustum.position);
        let mut ordered: Vec<(OrderedFloat<f32>, CellId)> = children
            .iter()
            .map(|child| {
                let distance = match (eye, tree.cell(*child)) {
                    (Some(eye), Some(cell)) => cell.bounds.center.distance_squared(eye),
                    _ => 0.0,
                };
                (OrderedFloat(distance), *child)
            })
            .collect();
        ordered.sort_by(|a, b| b.cmp(a));
        self.stack.extend(ordered.into_iter().map(|(_, child)| child));
    }

    fn enter_next_cell<T: SpatialTree + ?Sized>(&mut self, tree: &T) -> bool {
        while let Some(cell_id) = self.stack.pop() {
            let Some(cell) = tree.cell(cell_id) else {
                continue;
            };
            if !self.cell_relevant(&cell) {
                continue;
            }
            self.push_children(tree, cell.children);
            self.cursor = Some((cell_id, 0));
            return true;
        }
        false
    }

    fn next_candidate<T: SpatialTree + ?Sized>(&mut self, tree: &T) -> Option<Candidate> {
        if let Some(id) = self.retry.last() {
            return Some(Candidate::Retry(*id));
        }
        loop {
            if self.cursor.is_none() && !self.enter_next_cell(tree) {
                return None;
            }
            let (cell_id, index) = self.cursor?;
            match tree.cell(cell_id).and_then(|cell| cell.elements.get(index).copied()) {
                Some(id) => return Some(Candidate::Cell(id)),
                None => self.cursor = None,
            }
        }
    }

    fn advance(&mut self, candidate: &Candidate) {
        match candidate {
            Candidate::Retry(_) => {
                self.retry.pop();
            }
            Candidate::Cell(_) => {
                if let Some((_, index)) = self.cursor.as_mut() {
                    *index += 1;
                }
            }
        }
    }

    fn note_completion(&mut self) {
        if self.completion_recorded {
            return;
        }
        self.completion_recorded = true;
        self.completed_revision = Some(self.started_revision);
    }
}

impl<T: SpatialTree> TraversalPolicy<T> for SweepPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Sweep
    }

    fn has_content_to_send(&self, _session: &ViewerSession) -> bool {
        !self.retry.is_empty() || self.cursor.is_some() || !self.stack.is_empty()
    }

    fn pre_distribution_processing(&mut self, tree: &T, session: &mut ViewerSession) {
        self.filter_memory.retain(|id| tree.element(id).is_some());
        self.deferred.retain(|id| tree.element(*id).is_some());
        session
            .encode_progress_mut()
            .retain(|id| tree.element(id).is_some());
    }

    fn start_traversal(&mut self, tree: &T, session: &ViewerSession, request: TraversalRequest) -> TraversalKind {
        let previous_finished = self.kind.is_none() || self.completion_recorded;
        let kind = if request.full_scene || self.completed_revision.is_none() {
            TraversalKind::First
        } else if request.view_changed || !previous_finished {
            TraversalKind::Differential
        } else {
            TraversalKind::Repeat
        };

        self.view = session.current_view().clone();
        self.full_scene = request.full_scene;
        self.kind = Some(kind);
        let deferred = std::mem::take(&mut self.deferred);
        self.deferred = deferred
            .into_iter()
            .filter(|id| tree.element(*id).is_some_and(|info| self.in_view(&info)))
            .collect();
        self.changed_since = match kind {
            TraversalKind::Repeat => self.completed_revision,
            TraversalKind::First | TraversalKind::Differential => None,
        };
        self.stack.clear();
        self.stack.push(tree.root());
        self.cursor = None;
        self.retry.clear();
        self.started_revision = tree.revision();
        self.completion_recorded = false;
        kind
    }

    fn traverse(&mut self, _tree: &T, _budget: Duration) {
        self.retry.append(&mut self.deferred);
    }

    fn build_next_packet_payload(
        &mut self,
        tree: &T,
        session: &mut ViewerSession,
        buffers: &mut PayloadBuffers<'_>,
    ) -> PayloadOutcome {
        let (filter, progress) = session.encode_parts();
        let mut elements = 0u32;
        let mut skips = 0u32;

        loop {
            if buffers.elements_left == 0 {
                return PayloadOutcome::new(StopReason::ElementBudget, elements, skips);
            }
            let Some(candidate) = self.next_candidate(tree) else {
                self.note_completion();
                return PayloadOutcome::new(StopReason::Finished, elements, skips);
            };
            let id = candidate.id();
            let retrying = matches!(candidate, Candidate::Retry(_));
            let Some(info) = tree.element(id) else {
                progress.finish(id);
                self.advance(&candidate);
                continue;
            };
            if !retrying && !self.wants(&info) {
                self.advance(&candidate);
                continue;
            }
            let matches = tree.matches_filter(id, filter);
            if !self.filter_memory.should_send(id, matches) {
                self.advance(&candidate);
                continue;
            }

            match tree.append_element(id, buffers.normal, progress) {
                AppendState::Completed => {}
                AppendState::Partial => {
                    elements += 1;
                    buffers.elements_left -= 1;
                    return PayloadOutcome::new(StopReason::DidntFit, elements, skips);
                }
                AppendState::None => {
                    if buffers.normal.has_content() || !buffers.normal_is_full_size() {
                        return PayloadOutcome::new(StopReason::DidntFit, elements, skips);
                    }
                    match buffers.encode_oversized(tree, id, progress) {
                        AppendState::Completed => {
                            self.advance(&candidate);
                            self.filter_memory.sent(id, matches, filter);
                            buffers.elements_left -= 1;
                            return PayloadOutcome::new(StopReason::SentLarge, elements + 1, skips);
                        }
                        AppendState::Partial => {
                            buffers.elements_left -= 1;
                            return PayloadOutcome::new(StopReason::SentLarge, elements + 1, skips);
                        }
                        AppendState::None => {
                            self.advance(&candidate);
                            self.deferred.push(id);
                            skips += 1;
                            continue;
                        }
                    }
                }
            }

            self.advance(&candidate);
            self.filter_memory.sent(id, matches, filter);
            elements += 1;
            buffers.elements_left -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::Vec3;
    use serde_json::{json, Map, Value};
    use uuid::Uuid;

    use super::*;
    use crate::frustum::{LodParams, ViewFrustum};
    use crate::packet::{DATA_HEADER_LEN, LIST_HEADER_EXTRA};
    use crate::session::SessionInbox;
    use crate::tree::MemoryOctree;

    const MAX_PACKET: usize = 1464;

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn session_looking_down_z() -> ViewerSession {
        let mut session = ViewerSession::new(
            Uuid::new_v4(),
            Arc::new(SessionInbox::new()),
            &StreamConfig::default(),
        );
        session.update_view_frustum(ViewSet::new(
            vec![ViewFrustum {
                position: Vec3::new(0.0, 0.0, 10.0),
                ..ViewFrustum::default()
            }],
            LodParams::default(),
        ));
        session
    }

    fn scene() -> MemoryOctree {
        let mut tree = MemoryOctree::new(Vec3::ZERO, 64.0);
        tree.insert(1, Vec3::new(0.0, 0.0, 0.0), 1.0, props(json!({"kind": "rock"})));
        tree.insert(2, Vec3::new(0.0, 0.0, -30.0), 1.0, props(json!({"kind": "tree"})));
        tree.insert(3, Vec3::new(0.0, 0.0, 40.0), 1.0, props(json!({"kind": "rock"})));
        tree
    }

    fn drain<P: TraversalPolicy<MemoryOctree>>(
        policy: &mut P,
        tree: &MemoryOctree,
        session: &mut ViewerSession,
    ) -> Vec<ElementId> {
        let mut normal = PacketData::new(MAX_PACKET - DATA_HEADER_LEN);
        let mut large = PacketData::new(MAX_PACKET);
        let mut sent = Vec::new();
        policy.traverse(tree, Duration::from_millis(10));
        loop {
            normal.change_settings(MAX_PACKET - DATA_HEADER_LEN);
            let mut buffers = PayloadBuffers {
                normal: &mut normal,
                large: &mut large,
                full_target: MAX_PACKET - DATA_HEADER_LEN,
                list_unit: MAX_PACKET - DATA_HEADER_LEN - LIST_HEADER_EXTRA,
                max_multiplier: 8,
                elements_left: usize::MAX,
            };
            let outcome = policy.build_next_packet_payload(tree, session, &mut buffers);
            let section = normal.finalized();
            let records = &section[4..];
            if let Some(decoded) = MemoryOctree::decode_records(records, normal.element_count()) {
                sent.extend(decoded.into_iter().map(|record| record.id));
            }
            if outcome.stop == StopReason::Finished {
                return sent;
            }
        }
    }

    #[test]
    fn prioritized_sends_nearest_in_view_first_and_skips_behind() {
        let tree = scene();
        let mut session = session_looking_down_z();
        let mut policy = PrioritizedPolicy::new();
        let kind = TraversalPolicy::<MemoryOctree>::start_traversal(
            &mut policy,
            &tree,
            &session,
            TraversalRequest::default(),
        );
        assert_eq!(kind, TraversalKind::First);
        assert_eq!(drain(&mut policy, &tree, &mut session), vec![1, 2]);
        assert!(!TraversalPolicy::<MemoryOctree>::has_content_to_send(&policy, &session));
    }

    #[test]
    fn repeat_traversal_only_sends_changed_elements() {
        let mut tree = scene();
        let mut session = session_looking_down_z();
        let mut policy = PrioritizedPolicy::new();
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        drain(&mut policy, &tree, &mut session);

        let kind = TraversalPolicy::<MemoryOctree>::start_traversal(
            &mut policy,
            &tree,
            &session,
            TraversalRequest::default(),
        );
        assert_eq!(kind, TraversalKind::Repeat);
        assert!(drain(&mut policy, &tree, &mut session).is_empty());

        tree.update_properties(2, props(json!({"kind": "stump"})));
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        assert_eq!(drain(&mut policy, &tree, &mut session), vec![2]);
    }

    #[test]
    fn full_scene_includes_out_of_view_elements_last() {
        let tree = scene();
        let mut session = session_looking_down_z();
        let mut policy = PrioritizedPolicy::new();
        TraversalPolicy::<MemoryOctree>::start_traversal(
            &mut policy,
            &tree,
            &session,
            TraversalRequest {
                view_changed: false,
                full_scene: true,
            },
        );
        assert_eq!(drain(&mut policy, &tree, &mut session), vec![1, 2, 3]);
    }

    #[test]
    fn filter_keeps_sending_elements_that_stopped_matching() {
        let mut tree = scene();
        let mut session = session_looking_down_z();
        let frustums = session.current_view().frustums.clone();
        session.apply_query(crate::protocol::ViewerQuery {
            frustums,
            filter_json: Some(r#"{"kind":"tree"}"#.into()),
            ..Default::default()
        });
        assert!(session.have_json_parameters_changed());

        let mut policy = PrioritizedPolicy::new();
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        assert_eq!(drain(&mut policy, &tree, &mut session), vec![2]);

        tree.update_properties(2, props(json!({"kind": "stump"})));
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        assert_eq!(drain(&mut policy, &tree, &mut session), vec![2]);

        tree.update_properties(2, props(json!({"kind": "log"})));
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        assert!(drain(&mut policy, &tree, &mut session).is_empty());
    }

    #[test]
    fn element_too_large_for_any_buffer_is_deferred() {
        let mut tree = MemoryOctree::new(Vec3::ZERO, 64.0);
        let huge = "x".repeat(40_000);
        tree.insert(7, Vec3::ZERO, 1.0, props(json!({ "blob": huge })));
        let mut session = session_looking_down_z();
        let mut policy = PrioritizedPolicy::new();
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        TraversalPolicy::<MemoryOctree>::traverse(&mut policy, &tree, Duration::from_millis(10));

        let mut normal = PacketData::new(MAX_PACKET - DATA_HEADER_LEN);
        let mut large = PacketData::new(MAX_PACKET);
        let mut buffers = PayloadBuffers {
            normal: &mut normal,
            large: &mut large,
            full_target: MAX_PACKET - DATA_HEADER_LEN,
            list_unit: MAX_PACKET - DATA_HEADER_LEN - LIST_HEADER_EXTRA,
            max_multiplier: 8,
            elements_left: 16,
        };
        let outcome = policy.build_next_packet_payload(&tree, &mut session, &mut buffers);
        assert_eq!(outcome.stop, StopReason::Finished);
        assert_eq!(outcome.oversized_skips, 1);
        assert!(!large.has_content());

        TraversalPolicy::<MemoryOctree>::traverse(&mut policy, &tree, Duration::from_millis(10));
        assert_eq!(policy.queued_len(), 1);
    }

    #[test]
    fn deferred_element_is_dropped_once_the_view_leaves_it() {
        let mut tree = MemoryOctree::new(Vec3::ZERO, 64.0);
        tree.insert(7, Vec3::ZERO, 1.0, props(json!({ "blob": "x".repeat(40_000) })));
        let mut session = session_looking_down_z();
        let mut policy = PrioritizedPolicy::new();
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        let sent = drain(&mut policy, &tree, &mut session);
        assert!(sent.is_empty());

        session.update_view_frustum(ViewSet::new(
            vec![ViewFrustum {
                position: Vec3::new(0.0, 0.0, -10.0),
                ..ViewFrustum::default()
            }],
            LodParams::default(),
        ));
        let request = TraversalRequest {
            view_changed: true,
            ..TraversalRequest::default()
        };
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, request);
        TraversalPolicy::<MemoryOctree>::traverse(&mut policy, &tree, Duration::from_millis(10));
        assert_eq!(policy.queued_len(), 0);
    }

    #[test]
    fn sweep_drops_deferred_elements_outside_the_new_view() {
        fn one_payload(policy: &mut SweepPolicy, tree: &MemoryOctree, session: &mut ViewerSession) -> PayloadOutcome {
            let mut normal = PacketData::new(MAX_PACKET - DATA_HEADER_LEN);
            let mut large = PacketData::new(MAX_PACKET);
            let mut buffers = PayloadBuffers {
                normal: &mut normal,
                large: &mut large,
                full_target: MAX_PACKET - DATA_HEADER_LEN,
                list_unit: MAX_PACKET - DATA_HEADER_LEN - LIST_HEADER_EXTRA,
                max_multiplier: 8,
                elements_left: 16,
            };
            TraversalPolicy::<MemoryOctree>::traverse(policy, tree, Duration::from_millis(10));
            policy.build_next_packet_payload(tree, session, &mut buffers)
        }

        let mut tree = MemoryOctree::new(Vec3::ZERO, 64.0);
        tree.insert(7, Vec3::ZERO, 1.0, props(json!({ "blob": "x".repeat(40_000) })));
        let mut session = session_looking_down_z();
        let mut policy = SweepPolicy::new();
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        assert_eq!(one_payload(&mut policy, &tree, &mut session).oversized_skips, 1);

        session.update_view_frustum(ViewSet::new(
            vec![ViewFrustum {
                position: Vec3::new(0.0, 0.0, -10.0),
                ..ViewFrustum::default()
            }],
            LodParams::default(),
        ));
        let request = TraversalRequest {
            view_changed: true,
            ..TraversalRequest::default()
        };
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, request);
        let outcome = one_payload(&mut policy, &tree, &mut session);
        assert_eq!(outcome.oversized_skips, 0);
        assert_eq!(outcome.stop, StopReason::Finished);
    }

    #[test]
    fn sweep_visits_nearest_cells_first() {
        let mut tree = MemoryOctree::with_limits(Vec3::ZERO, 64.0, 4, 1);
        tree.insert(1, Vec3::new(20.0, 20.0, -40.0), 1.0, Map::new());
        tree.insert(2, Vec3::new(-20.0, -20.0, 5.0), 1.0, Map::new());
        let mut session = ViewerSession::new(
            Uuid::new_v4(),
            Arc::new(SessionInbox::new()),
            &StreamConfig::default(),
        );
        session.update_view_frustum(ViewSet::new(
            vec![ViewFrustum {
                position: Vec3::new(0.0, 0.0, 60.0),
                center_radius: 200.0,
                ..ViewFrustum::default()
            }],
            LodParams::default(),
        ));
        let mut policy = SweepPolicy::new();
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        assert_eq!(drain(&mut policy, &tree, &mut session), vec![2, 1]);
    }

    #[test]
    fn sweep_repeat_skips_unchanged_cells() {
        let mut tree = scene();
        let mut session = session_looking_down_z();
        let mut policy = SweepPolicy::new();
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        let mut first = drain(&mut policy, &tree, &mut session);
        first.sort_unstable();
        assert_eq!(first, vec![1, 2]);

        let kind = TraversalPolicy::<MemoryOctree>::start_traversal(
            &mut policy,
            &tree,
            &session,
            TraversalRequest::default(),
        );
        assert_eq!(kind, TraversalKind::Repeat);
        assert!(drain(&mut policy, &tree, &mut session).is_empty());

        tree.move_element(1, Vec3::new(0.5, 0.0, 0.0));
        TraversalPolicy::<MemoryOctree>::start_traversal(&mut policy, &tree, &session, TraversalRequest::default());
        assert_eq!(drain(&mut policy, &tree, &mut session), vec![1]);
    }
}
