//! Helpers for the 16-bit wraparound sequence space.
//!
//! Raw subtraction of two `u16` sequence numbers is never meaningful on its
//! own: every comparison in the crate goes through these helpers.

use std::collections::BTreeSet;

use serde::Serialize;

/// Sequence number carried in every data packet header.
pub type Seq = u16;

/// Half of the sequence space. Two sequence numbers further apart than this
/// are interpreted as having wrapped.
pub const SEQ_HALF_RANGE: u16 = 1 << 15;

/// Forward distance from `older` to `newer`, modulo 2^16.
///
/// ```
/// use octree_stream::sequence::seq_distance;
/// assert_eq!(seq_distance(2, 65534), 4);
/// assert_eq!(seq_distance(10, 10), 0);
/// ```
#[inline]
pub fn seq_distance(newer: Seq, older: Seq) -> u16 {
    newer.wrapping_sub(older)
}

/// Returns true when `candidate` is strictly after `reference` in the
/// wraparound ordering.
#[inline]
pub fn seq_is_newer(candidate: Seq, reference: Seq) -> bool {
    let distance = seq_distance(candidate, reference);
    distance != 0 && distance < SEQ_HALF_RANGE
}

/// Monotonic per-session counter handing out the next sequence number.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: Seq,
}

impl SequenceCounter {
    pub fn starting_at(next: Seq) -> Self {
        Self { next }
    }

    /// The sequence number the next sent packet will carry.
    pub fn peek(&self) -> Seq {
        self.next
    }

    /// Consumes the current sequence number.
    pub fn advance(&mut self) -> Seq {
        let current = self.next;
        self.next = self.next.wrapping_add(1);
        current
    }
}

/// Arrivals further than this from the expected sequence are treated as
/// garbage rather than as a gap.
pub const MAX_REASONABLE_SEQUENCE_GAP: u16 = 1000;

/// How one received sequence number relates to what was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    OnTime,
    /// Arrived ahead of `skipped` sequence numbers, now counted as lost.
    Early { skipped: u16 },
    /// Filled an earlier gap.
    Late,
    Duplicate,
    Unreasonable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SequenceCounts {
    pub received: u64,
    /// Currently missing; recovered packets are subtracted again.
    pub lost: u64,
    pub recovered: u64,
    pub early: u64,
    pub late: u64,
    pub duplicate: u64,
    pub unreasonable: u64,
}

impl SequenceCounts {
    pub fn out_of_order(&self) -> u64 {
        self.early + self.late
    }
}

/// Receiving-side view of one sender's sequence: classifies arrivals, counts
/// loss and keeps the set of missing numbers a NACK should ask for.
#[derive(Debug, Clone, Default)]
pub struct SequenceStats {
    expected: Option<Seq>,
    missing: BTreeSet<Seq>,
    counts: SequenceCounts,
}

impl SequenceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> SequenceCounts {
        self.counts
    }

    pub fn received(&mut self, seq: Seq) -> Arrival {
        let Some(expected) = self.expected else {
            self.expected = Some(seq.wrapping_add(1));
            self.counts.received += 1;
            return Arrival::OnTime;
        };

        let arrival = if seq == expected {
            self.expected = Some(seq.wrapping_add(1));
            Arrival::OnTime
        } else if seq_is_newer(seq, expected) {
            let skipped = seq_distance(seq, expected);
            if skipped > MAX_REASONABLE_SEQUENCE_GAP {
                Arrival::Unreasonable
            } else {
                let mut gap = expected;
                while gap != seq {
                    self.missing.insert(gap);
                    gap = gap.wrapping_add(1);
                }
                self.expected = Some(seq.wrapping_add(1));
                self.counts.lost += u64::from(skipped);
                self.counts.early += 1;
                Arrival::Early { skipped }
            }
        } else if self.missing.remove(&seq) {
            self.counts.lost = self.counts.lost.saturating_sub(1);
            self.counts.recovered += 1;
            self.counts.late += 1;
            Arrival::Late
        } else if seq_distance(expected, seq) > MAX_REASONABLE_SEQUENCE_GAP {
            Arrival::Unreasonable
        } else {
            Arrival::Duplicate
        };

        match arrival {
            Arrival::Unreasonable => self.counts.unreasonable += 1,
            Arrival::Duplicate => self.counts.duplicate += 1,
            _ => self.counts.received += 1,
        }
        arrival
    }

    /// Forgets missing numbers more than `window` behind the next expected
    /// one; the sender no longer keeps those packets.
    pub fn prune_missing(&mut self, window: u16) {
        let Some(expected) = self.expected else {
            return;
        };
        self.missing
            .retain(|seq| seq_distance(expected, *seq) <= window);
    }

    /// Missing sequence numbers, oldest first.
    pub fn missing(&self) -> Vec<Seq> {
        let Some(expected) = self.expected else {
            return Vec::new();
        };
        let mut missing: Vec<Seq> = self.missing.iter().copied().collect();
        missing.sort_by_key(|seq| std::cmp::Reverse(seq_distance(expected, *seq)));
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_handles_wraparound() {
        assert!(seq_is_newer(0, u16::MAX));
        assert!(seq_is_newer(5, 65530));
        assert!(!seq_is_newer(65530, 5));
        assert!(!seq_is_newer(7, 7));
    }

    #[test]
    fn counter_wraps_without_panicking() {
        let mut counter = SequenceCounter::starting_at(u16::MAX);
        assert_eq!(counter.advance(), u16::MAX);
        assert_eq!(counter.advance(), 0);
        assert_eq!(counter.peek(), 1);
    }

    #[test]
    fn gap_is_lost_until_the_late_packet_arrives() {
        let mut stats = SequenceStats::new();
        assert_eq!(stats.received(10), Arrival::OnTime);
        assert_eq!(stats.received(11), Arrival::OnTime);
        assert_eq!(stats.received(14), Arrival::Early { skipped: 2 });
        assert_eq!(stats.missing(), vec![12, 13]);
        assert_eq!(stats.counts().lost, 2);

        assert_eq!(stats.received(12), Arrival::Late);
        assert_eq!(stats.received(12), Arrival::Duplicate);
        let counts = stats.counts();
        assert_eq!(counts.lost, 1);
        assert_eq!(counts.recovered, 1);
        assert_eq!(counts.out_of_order(), 2);
        assert_eq!(stats.missing(), vec![13]);
    }

    #[test]
    fn missing_set_spans_wraparound_in_order() {
        let mut stats = SequenceStats::new();
        stats.received(65533);
        stats.received(1);
        assert_eq!(stats.missing(), vec![65534, 65535, 0]);
    }

    #[test]
    fn pruning_drops_numbers_outside_the_window() {
        let mut stats = SequenceStats::new();
        stats.received(0);
        stats.received(20);
        stats.prune_missing(5);
        assert_eq!(stats.missing(), vec![16, 17, 18, 19]);
        assert_eq!(stats.received(40_000), Arrival::Unreasonable);
        assert_eq!(stats.counts().unreasonable, 1);
    }
}
