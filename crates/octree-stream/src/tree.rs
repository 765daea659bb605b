//! The shared spatial tree as seen by the streaming core.
//!
//! The core only needs to walk cells, look at element bounds and ask the
//! tree to encode an element into a [`PacketData`] buffer. [`MemoryOctree`] is
//! an in-process implementation used by the server binary and the tests.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::packet::PacketData;

pub type CellId = u32;
pub type ElementId = u64;

/// Tree shared between inbound edit processing (writer) and send workers
/// (readers).
pub type SharedTree<T> = Arc<RwLock<T>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub center: Vec3,
    pub half_extent: f32,
}

impl Bounds {
    pub fn bounding_radius(&self) -> f32 {
        self.half_extent * 3f32.sqrt()
    }

    pub fn contains_sphere(&self, center: Vec3, radius: f32) -> bool {
        let reach = self.half_extent - radius;
        reach >= 0.0 && (center - self.center).abs().max_element() <= reach
    }

    fn child(&self, octant: usize) -> Bounds {
        let quarter = self.half_extent * 0.5;
        let offset = Vec3::new(
            if octant & 1 != 0 { quarter } else { -quarter },
            if octant & 2 != 0 { quarter } else { -quarter },
            if octant & 4 != 0 { quarter } else { -quarter },
        );
        Bounds {
            center: self.center + offset,
            half_extent: quarter,
        }
    }
}

/// Borrowed view of one cell.
#[derive(Debug, Clone, Copy)]
pub struct CellView<'a> {
    pub bounds: Bounds,
    /// Tree revision at which anything inside this cell last changed.
    pub last_changed: u64,
    pub children: &'a [CellId],
    pub elements: &'a [ElementId],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementInfo {
    pub id: ElementId,
    pub center: Vec3,
    pub radius: f32,
    pub last_changed: u64,
}

/// Result of asking the tree to encode one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendState {
    Completed,
    /// Some of the element was written; the rest continues in a later packet.
    Partial,
    /// Nothing was written.
    None,
}

/// Per-session bookkeeping for elements that were only partially encoded.
#[derive(Debug, Clone, Default)]
pub struct EncodeProgress {
    next_property: HashMap<ElementId, u16>,
}

impl EncodeProgress {
    pub fn resume_point(&self, id: ElementId) -> u16 {
        self.next_property.get(&id).copied().unwrap_or(0)
    }

    pub fn set_resume_point(&mut self, id: ElementId, next: u16) {
        self.next_property.insert(id, next);
    }

    pub fn finish(&mut self, id: ElementId) {
        self.next_property.remove(&id);
    }

    pub fn is_partial(&self, id: ElementId) -> bool {
        self.next_property.contains_key(&id)
    }

    pub fn clear(&mut self) {
        self.next_property.clear();
    }

    pub fn retain(&mut self, mut keep: impl FnMut(ElementId) -> bool) {
        self.next_property.retain(|id, _| keep(*id));
    }
}

/// Property criteria a viewer asked for. An empty filter matches everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentFilter {
    criteria: Map<String, Value>,
}

impl ContentFilter {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            criteria: serde_json::from_str(raw)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn matches(&self, properties: &Map<String, Value>) -> bool {
        self.criteria
            .iter()
            .all(|(key, expected)| properties.get(key) == Some(expected))
    }
}

pub trait SpatialTree: Send + Sync + 'static {
    /// Monotonic edit clock. `last_changed` values are readings of it.
    fn revision(&self) -> u64;
    fn root(&self) -> CellId;
    fn cell(&self, id: CellId) -> Option<CellView<'_>>;
    fn element(&self, id: ElementId) -> Option<ElementInfo>;
    fn append_element(
        &self,
        id: ElementId,
        out: &mut PacketData,
        progress: &mut EncodeProgress,
    ) -> AppendState;
    fn matches_filter(&self, id: ElementId, filter: &ContentFilter) -> bool;
}

pub const DEFAULT_MAX_DEPTH: u8 = 8;
pub const DEFAULT_SPLIT_THRESHOLD: usize = 16;
/// `id (u64) | first_property (u16) | property_count (u16)`
pub const RECORD_HEADER_LEN: usize = 8 + 2 + 2;

#[derive(Debug, Clone)]
struct Cell {
    bounds: Bounds,
    depth: u8,
    parent: Option<CellId>,
    children: Vec<CellId>,
    elements: Vec<ElementId>,
    last_changed: u64,
}

#[derive(Debug, Clone)]
struct StoredElement {
    info: ElementInfo,
    cell: CellId,
    properties: Map<String, Value>,
    /// Pre-encoded `key_len (u8) | key | value_len (u16) | json value` blobs.
    encoded: Vec<Vec<u8>>,
}

/// Arena-backed loose octree holding JSON-property elements.
#[derive(Debug, Clone)]
pub struct MemoryOctree {
    cells: Vec<Cell>,
    elements: HashMap<ElementId, StoredElement>,
    revision: u64,
    max_depth: u8,
    split_threshold: usize,
}

impl MemoryOctree {
    pub fn new(center: Vec3, half_extent: f32) -> Self {
        Self::with_limits(center, half_extent, DEFAULT_MAX_DEPTH, DEFAULT_SPLIT_THRESHOLD)
    }

    pub fn with_limits(center: Vec3, half_extent: f32, max_depth: u8, split_threshold: usize) -> Self {
        let root = Cell {
            bounds: Bounds {
                center,
                half_extent,
            },
            depth: 0,
            parent: None,
            children: Vec::new(),
            elements: Vec::new(),
            last_changed: 0,
        };
        Self {
            cells: vec![root],
            elements: HashMap::new(),
            revision: 0,
            max_depth,
            split_threshold: split_threshold.max(1),
        }
    }

    pub fn shared(self) -> SharedTree<Self> {
        Arc::new(RwLock::new(self))
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn properties(&self, id: ElementId) -> Option<&Map<String, Value>> {
        self.elements.get(&id).map(|element| &element.properties)
    }

    /// Inserts or replaces an element.
    pub fn insert(&mut self, id: ElementId, center: Vec3, radius: f32, properties: Map<String, Value>) {
        if self.elements.contains_key(&id) {
            self.detach(id);
        }
        self.revision += 1;
        let encoded = encode_properties(&properties);
        let info = ElementInfo {
            id,
            center,
            radius,
            last_changed: self.revision,
        };
        self.elements.insert(
            id,
            StoredElement {
                info,
                cell: 0,
                properties,
                encoded,
            },
        );
        self.place(id, center, radius);
    }

    pub fn update_properties(&mut self, id: ElementId, properties: Map<String, Value>) -> bool {
        let Some(element) = self.elements.get_mut(&id) else {
            return false;
        };
        self.revision += 1;
        element.encoded = encode_properties(&properties);
        element.properties = properties;
        element.info.last_changed = self.revision;
        let cell = element.cell;
        self.touch(cell);
        true
    }

    pub fn move_element(&mut self, id: ElementId, center: Vec3) -> bool {
        let Some(element) = self.elements.get(&id) else {
            return false;
        };
        let properties = element.properties.clone();
        let radius = element.info.radius;
        self.insert(id, center, radius, properties);
        true
    }

    pub fn remove(&mut self, id: ElementId) -> bool {
        if !self.elements.contains_key(&id) {
            return false;
        }
        self.detach(id);
        self.elements.remove(&id);
        true
    }

    fn detach(&mut self, id: ElementId) {
        let Some(element) = self.elements.get(&id) else {
            return;
        };
        let cell = element.cell;
        self.cells[cell as usize].elements.retain(|other| *other != id);
        self.revision += 1;
        self.touch(cell);
    }

    /// Marks a cell and all of its ancestors as changed at the current revision.
    fn touch(&mut self, mut cell: CellId) {
        loop {
            let entry = &mut self.cells[cell as usize];
            entry.last_changed = self.revision;
            match entry.parent {
                Some(parent) => cell = parent,
                None => break,
            }
        }
    }

    fn place(&mut self, id: ElementId, center: Vec3, radius: f32) {
        let mut cell: CellId = 0;
        loop {
            let next = self.cells[cell as usize]
                .children
                .iter()
                .copied()
                .find(|child| self.cells[*child as usize].bounds.contains_sphere(center, radius));
            match next {
                Some(child) => cell = child,
                None => break,
            }
        }
        self.cells[cell as usize].elements.push(id);
        if let Some(element) = self.elements.get_mut(&id) {
            element.cell = cell;
        }
        self.touch(cell);
        self.maybe_split(cell);
    }

    fn maybe_split(&mut self, cell: CellId) {
        let (bounds, depth, should_split) = {
            let entry = &self.cells[cell as usize];
            (
                entry.bounds,
                entry.depth,
                entry.children.is_empty()
                    && entry.elements.len() > self.split_threshold
                    && entry.depth < self.max_depth,
            )
        };
        if !should_split {
            return;
        }
        let first_child = self.cells.len() as CellId;
        for octant in 0..8 {
            self.cells.push(Cell {
                bounds: bounds.child(octant),
                depth: depth + 1,
                parent: Some(cell),
                children: Vec::new(),
                elements: Vec::new(),
                last_changed: self.revision,
            });
        }
        let children: Vec<CellId> = (first_child..first_child + 8).collect();
        let resident = std::mem::take(&mut self.cells[cell as usize].elements);
        let mut kept = Vec::new();
        for element_id in resident {
            let Some((center, radius)) = self
                .elements
                .get(&element_id)
                .map(|element| (element.info.center, element.info.radius))
            else {
                kept.push(element_id);
                continue;
            };
            let target = children
                .iter()
                .copied()
                .find(|child| self.cells[*child as usize].bounds.contains_sphere(center, radius));
            match target {
                Some(child) => {
                    self.cells[child as usize].elements.push(element_id);
                    if let Some(element) = self.elements.get_mut(&element_id) {
                        element.cell = child;
                    }
                }
                None => kept.push(element_id),
            }
        }
        let entry = &mut self.cells[cell as usize];
        entry.elements = kept;
        entry.children = children;
    }

    /// Decodes the element records of one section, as written by
    /// [`SpatialTree::append_element`].
    pub fn decode_records(mut records: &[u8], count: u16) -> Option<Vec<DecodedRecord>> {
        let mut decoded = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            if records.len() < RECORD_HEADER_LEN {
                return None;
            }
            let mut id = [0u8; 8];
            id.copy_from_slice(&records[..8]);
            let first_property = u16::from_be_bytes([records[8], records[9]]);
            let property_count = u16::from_be_bytes([records[10], records[11]]);
            records = &records[RECORD_HEADER_LEN..];
            let mut properties = Vec::with_capacity(usize::from(property_count));
            for _ in 0..property_count {
                let key_len = usize::from(*records.first()?);
                let key = std::str::from_utf8(records.get(1..1 + key_len)?).ok()?.to_string();
                records = &records[1 + key_len..];
                let value_len = usize::from(u16::from_be_bytes([*records.first()?, *records.get(1)?]));
                let value = serde_json::from_slice(records.get(2..2 + value_len)?).ok()?;
                records = &records[2 + value_len..];
                properties.push((key, value));
            }
            decoded.push(DecodedRecord {
                id: u64::from_be_bytes(id),
                first_property,
                properties,
            });
        }
        Some(decoded)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub id: ElementId,
    pub first_property: u16,
    pub properties: Vec<(String, Value)>,
}

fn encode_properties(properties: &Map<String, Value>) -> Vec<Vec<u8>> {
    properties
        .iter()
        .filter_map(|(key, value)| {
            let key_bytes = key.as_bytes();
            let value_bytes = serde_json::to_vec(value).ok()?;
            if key_bytes.len() > usize::from(u8::MAX) || value_bytes.len() > usize::from(u16::MAX) {
                return None;
            }
            let mut blob = Vec::with_capacity(3 + key_bytes.len() + value_bytes.len());
            blob.push(key_bytes.len() as u8);
            blob.extend_from_slice(key_bytes);
            blob.extend_from_slice(&(value_bytes.len() as u16).to_be_bytes());
            blob.extend_from_slice(&value_bytes);
            Some(blob)
        })
        .collect()
}

impl SpatialTree for MemoryOctree {
    fn revision(&self) -> u64 {
        self.revision
    }

    fn root(&self) -> CellId {
        0
    }

    fn cell(&self, id: CellId) -> Option<CellView<'_>> {
        self.cells.get(id as usize).map(|cell| CellView {
            bounds: cell.bounds,
            last_changed: cell.last_changed,
            children: &cell.children,
            elements: &cell.elements,
        })
    }

    fn element(&self, id: ElementId) -> Option<ElementInfo> {
        self.elements.get(&id).map(|element| element.info)
    }

    fn append_element(
        &self,
        id: ElementId,
        out: &mut PacketData,
        progress: &mut EncodeProgress,
    ) -> AppendState {
        let Some(element) = self.elements.get(&id) else {
            progress.finish(id);
            return AppendState::Completed;
        };
        let first = usize::from(progress.resume_point(id)).min(element.encoded.len());
        let pending = &element.encoded[first..];

        let mut budget = out.remaining();
        if budget < RECORD_HEADER_LEN {
            return AppendState::None;
        }
        budget -= RECORD_HEADER_LEN;
        let mut fitting = 0usize;
        for blob in pending {
            if blob.len() > budget {
                break;
            }
            budget -= blob.len();
            fitting += 1;
        }
        if fitting == 0 && !pending.is_empty() {
            return AppendState::None;
        }

        let mut record = Vec::with_capacity(out.remaining() - budget);
        record.extend_from_slice(&id.to_be_bytes());
        record.extend_from_slice(&(first as u16).to_be_bytes());
        record.extend_from_slice(&(fitting as u16).to_be_bytes());
        for blob in &pending[..fitting] {
            record.extend_from_slice(blob);
        }
        if !out.append(&record) {
            return AppendState::None;
        }
        out.record_element();

        if fitting == pending.len() {
            progress.finish(id);
            AppendState::Completed
        } else {
            progress.set_resume_point(id, (first + fitting) as u16);
            AppendState::Partial
        }
    }

    fn matches_filter(&self, id: ElementId, filter: &ContentFilter) -> bool {
        if filter.is_empty() {
            return true;
        }
        self.elements
            .get(&id)
            .is_some_and(|element| filter.matches(&element.properties))
    }
}
