//! Bounded record of recently sent packets, used to answer NACKs.

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::warn;

use crate::packet::{PacketList, SentPacket};
use crate::sequence::{seq_distance, Seq};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug)]
struct HistoryRing {
    slots: Vec<Option<SentPacket>>,
    /// Slot holding the newest packet.
    newest_index: usize,
    newest_seq: Option<Seq>,
    len: usize,
}

/// Fixed-capacity ring of packet copies keyed by sequence number. Inserts
/// take the write lock, lookups the read lock.
#[derive(Debug)]
pub struct SentPacketHistory {
    ring: RwLock<HistoryRing>,
    capacity: usize,
}

impl Default for SentPacketHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl SentPacketHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: RwLock::new(HistoryRing {
                slots: vec![None; capacity],
                newest_index: capacity - 1,
                newest_seq: None,
                len: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn newest_seq(&self) -> Option<Seq> {
        self.ring.read().newest_seq
    }

    pub fn packet_sent(&self, seq: Seq, datagram: &Bytes) {
        self.insert(seq, SentPacket::Single(Bytes::copy_from_slice(datagram)));
    }

    pub fn packet_list_sent(&self, seq: Seq, list: &PacketList) {
        self.insert(seq, SentPacket::List(list.deep_copy()));
    }

    /// Records any finalized packet, single or list.
    pub fn record(&self, seq: Seq, packet: &SentPacket) {
        self.insert(seq, packet.deep_copy());
    }

    fn insert(&self, seq: Seq, packet: SentPacket) {
        let mut ring = self.ring.write();
        if let Some(newest) = ring.newest_seq {
            let expected = newest.wrapping_add(1);
            if seq != expected {
                warn!(
                    target = "stream::history",
                    expected,
                    observed = seq,
                    "sent packet history is not contiguous"
                );
                // Entries recorded under the old numbering can no longer be
                // located by distance from the new newest sequence.
                for slot in ring.slots.iter_mut() {
                    *slot = None;
                }
                ring.len = 0;
            }
        }
        let index = (ring.newest_index + 1) % self.capacity;
        ring.slots[index] = Some(packet);
        ring.newest_index = index;
        ring.newest_seq = Some(seq);
        ring.len = (ring.len + 1).min(self.capacity);
    }

    /// Returns a copy of the packet sent under `seq`, or `None` when it has
    /// been evicted or was never recorded.
    pub fn get_packet(&self, seq: Seq) -> Option<SentPacket> {
        let ring = self.ring.read();
        let newest = ring.newest_seq?;
        let distance = usize::from(seq_distance(newest, seq));
        if distance >= ring.len {
            return None;
        }
        let index = (ring.newest_index + self.capacity - distance) % self.capacity;
        ring.slots[index].clone()
    }
}
