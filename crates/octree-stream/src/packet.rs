//! Outbound data packets.
//!
//! Every datagram sent to a viewer starts with a fixed header:
//!
//! ```text
//! +------+-------+-----------+-----------------+
//! | type | flags | seq (u16) | sent_at_us (u64) |
//! +------+-------+-----------+-----------------+
//! ```
//!
//! Datagrams that belong to a packet list (`FLAG_LIST`) additionally carry
//! `index (u16)` and `count (u16)` so the viewer can reassemble the list. All
//! integers are big-endian. The payload is a run of sections, each
//! `section_len (u16) | element_count (u16) | element records`; element
//! records are opaque bytes produced by the spatial tree.

use bytes::Bytes;

use crate::error::{ProtocolError, ProtocolResult};
use crate::sequence::Seq;

pub const DATA_HEADER_LEN: usize = 1 + 1 + 2 + 8;
pub const LIST_HEADER_EXTRA: usize = 2 + 2;
pub const SECTION_HEADER_LEN: usize = 2 + 2;

pub const FLAG_LIST: u8 = 0b0000_0001;
pub const FLAG_FULL_SCENE: u8 = 0b0000_0010;

/// Once less than this remains in the wire packet it is sent instead of
/// trying to pack another section.
pub const MINIMUM_ATTEMPT_MORE_PACKING: usize = SECTION_HEADER_LEN + 40;
pub const COMPRESS_PADDING: usize = 15;
pub const REASONABLE_NUMBER_OF_PACKING_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    OctreeData = 0x10,
    SceneStats = 0x11,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(Self::OctreeData),
            0x11 => Ok(Self::SceneStats),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub seq: Seq,
    pub sent_at_us: u64,
    /// `(index, count)` for datagrams belonging to a packet list.
    pub list_position: Option<(u16, u16)>,
}

impl DataHeader {
    pub fn encoded_len(&self) -> usize {
        if self.list_position.is_some() {
            DATA_HEADER_LEN + LIST_HEADER_EXTRA
        } else {
            DATA_HEADER_LEN
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut flags = self.flags & !FLAG_LIST;
        if self.list_position.is_some() {
            flags |= FLAG_LIST;
        }
        buf.push(self.packet_type as u8);
        buf.push(flags);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.sent_at_us.to_be_bytes());
        if let Some((index, count)) = self.list_position {
            buf.extend_from_slice(&index.to_be_bytes());
            buf.extend_from_slice(&count.to_be_bytes());
        }
    }

    /// Parses a header, returning it together with the payload offset.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<(Self, usize)> {
        if bytes.len() < DATA_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: DATA_HEADER_LEN,
                available: bytes.len(),
            });
        }
        let packet_type = PacketType::try_from(bytes[0])?;
        let flags = bytes[1];
        let seq = u16::from_be_bytes([bytes[2], bytes[3]]);
        let mut sent_at = [0u8; 8];
        sent_at.copy_from_slice(&bytes[4..12]);
        let sent_at_us = u64::from_be_bytes(sent_at);
        let mut offset = DATA_HEADER_LEN;
        let list_position = if flags & FLAG_LIST != 0 {
            let needed = DATA_HEADER_LEN + LIST_HEADER_EXTRA;
            if bytes.len() < needed {
                return Err(ProtocolError::Truncated {
                    needed,
                    available: bytes.len(),
                });
            }
            offset = needed;
            Some((
                u16::from_be_bytes([bytes[12], bytes[13]]),
                u16::from_be_bytes([bytes[14], bytes[15]]),
            ))
        } else {
            None
        };
        Ok((
            Self {
                packet_type,
                flags,
                seq,
                sent_at_us,
                list_position,
            },
            offset,
        ))
    }
}

/// Ordered multi-datagram unit sent under a single sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketList {
    datagrams: Vec<Bytes>,
}

impl PacketList {
    pub fn new(datagrams: Vec<Bytes>) -> Self {
        Self { datagrams }
    }

    pub fn datagrams(&self) -> &[Bytes] {
        &self.datagrams
    }

    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.datagrams.iter().map(Bytes::len).sum()
    }

    pub(crate) fn deep_copy(&self) -> Self {
        Self {
            datagrams: self
                .datagrams
                .iter()
                .map(|datagram| Bytes::copy_from_slice(datagram))
                .collect(),
        }
    }
}

/// A finalized packet as it went out on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentPacket {
    Single(Bytes),
    List(PacketList),
}

impl SentPacket {
    pub fn datagrams(&self) -> &[Bytes] {
        match self {
            SentPacket::Single(datagram) => std::slice::from_ref(datagram),
            SentPacket::List(list) => list.datagrams(),
        }
    }

    pub fn datagram_count(&self) -> usize {
        self.datagrams().len()
    }

    pub fn byte_len(&self) -> usize {
        self.datagrams().iter().map(Bytes::len).sum()
    }

    /// Copy that shares no storage with `self`.
    pub fn deep_copy(&self) -> Self {
        match self {
            SentPacket::Single(datagram) => SentPacket::Single(Bytes::copy_from_slice(datagram)),
            SentPacket::List(list) => SentPacket::List(list.deep_copy()),
        }
    }
}

/// Wire packet under construction. The header is written only when the
/// packet is finalized, so the buffer holds payload bytes alone.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    payload: Vec<u8>,
    max_packet_size: usize,
    /// Total payload capacity; larger than one datagram for the oversized variant.
    capacity: usize,
    as_list: bool,
}

impl OutgoingPacket {
    pub fn new(max_packet_size: usize) -> Self {
        let capacity = max_packet_size.saturating_sub(DATA_HEADER_LEN);
        Self {
            payload: Vec::with_capacity(capacity),
            max_packet_size,
            capacity,
            as_list: false,
        }
    }

    /// Truncates the buffer back to just past its header. `as_list` selects
    /// the oversized variant spanning `multiplier` datagrams.
    pub fn reset(&mut self, as_list: bool, multiplier: usize) {
        self.payload.clear();
        self.as_list = as_list;
        let per_datagram = if as_list {
            self.max_packet_size
                .saturating_sub(DATA_HEADER_LEN + LIST_HEADER_EXTRA)
        } else {
            self.max_packet_size.saturating_sub(DATA_HEADER_LEN)
        };
        self.capacity = per_datagram * multiplier.max(1);
    }

    pub fn write(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.available() {
            return false;
        }
        self.payload.extend_from_slice(bytes);
        true
    }

    pub fn available(&self) -> usize {
        self.capacity - self.payload.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    pub fn is_list(&self) -> bool {
        self.as_list
    }

    /// Stamps the header and produces the wire form. List packets are split
    /// into datagrams of at most `max_packet_size` bytes.
    pub fn finalize(&self, packet_type: PacketType, flags: u8, seq: Seq, sent_at_us: u64) -> SentPacket {
        if !self.as_list {
            let header = DataHeader {
                packet_type,
                flags,
                seq,
                sent_at_us,
                list_position: None,
            };
            let mut datagram = Vec::with_capacity(DATA_HEADER_LEN + self.payload.len());
            header.encode_into(&mut datagram);
            datagram.extend_from_slice(&self.payload);
            return SentPacket::Single(Bytes::from(datagram));
        }

        let chunk_len = self
            .max_packet_size
            .saturating_sub(DATA_HEADER_LEN + LIST_HEADER_EXTRA)
            .max(1);
        let chunks: Vec<&[u8]> = if self.payload.is_empty() {
            vec![&[][..]]
        } else {
            self.payload.chunks(chunk_len).collect()
        };
        let count = chunks.len() as u16;
        let datagrams = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let header = DataHeader {
                    packet_type,
                    flags,
                    seq,
                    sent_at_us,
                    list_position: Some((index as u16, count)),
                };
                let mut datagram = Vec::with_capacity(header.encoded_len() + chunk.len());
                header.encode_into(&mut datagram);
                datagram.extend_from_slice(chunk);
                Bytes::from(datagram)
            })
            .collect();
        SentPacket::List(PacketList::new(datagrams))
    }
}

/// Encode buffer for one section. The spatial tree appends element records
/// here; the worker copies finished sections into the wire packet.
#[derive(Debug, Clone)]
pub struct PacketData {
    records: Vec<u8>,
    target_size: usize,
    element_count: u16,
}

impl PacketData {
    pub fn new(target_size: usize) -> Self {
        Self {
            records: Vec::with_capacity(target_size),
            target_size,
            element_count: 0,
        }
    }

    /// Clears the buffer and sets a new target, header included.
    pub fn change_settings(&mut self, target_size: usize) {
        self.records.clear();
        self.element_count = 0;
        self.target_size = target_size;
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn remaining(&self) -> usize {
        self.target_size
            .saturating_sub(SECTION_HEADER_LEN + self.records.len())
    }

    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.records.extend_from_slice(bytes);
        true
    }

    /// Current write position, for rolling back a partially written record.
    pub fn mark(&self) -> usize {
        self.records.len()
    }

    pub fn rewind(&mut self, mark: usize) {
        self.records.truncate(mark);
    }

    pub fn record_element(&mut self) {
        self.element_count = self.element_count.saturating_add(1);
    }

    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    pub fn has_content(&self) -> bool {
        self.element_count > 0
    }

    pub fn finalized_size(&self) -> usize {
        SECTION_HEADER_LEN + self.records.len()
    }

    /// Section bytes ready to be copied into the wire packet.
    pub fn finalized(&self) -> Vec<u8> {
        let mut section = Vec::with_capacity(self.finalized_size());
        section.extend_from_slice(&(self.finalized_size() as u16).to_be_bytes());
        section.extend_from_slice(&self.element_count.to_be_bytes());
        section.extend_from_slice(&self.records);
        section
    }
}

/// Splits a packet payload back into `(element_count, records)` sections.
pub fn split_sections(mut payload: &[u8]) -> ProtocolResult<Vec<(u16, &[u8])>> {
    let mut sections = Vec::new();
    while !payload.is_empty() {
        if payload.len() < SECTION_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: SECTION_HEADER_LEN,
                available: payload.len(),
            });
        }
        let section_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if section_len < SECTION_HEADER_LEN {
            return Err(ProtocolError::Malformed("section shorter than its header"));
        }
        if section_len > payload.len() {
            return Err(ProtocolError::Truncated {
                needed: section_len,
                available: payload.len(),
            });
        }
        let count = u16::from_be_bytes([payload[2], payload[3]]);
        sections.push((count, &payload[SECTION_HEADER_LEN..section_len]));
        payload = &payload[section_len..];
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_packet_carries_header_and_payload() {
        let mut packet = OutgoingPacket::new(64);
        packet.reset(false, 1);
        assert!(packet.write(b"abc"));
        let SentPacket::Single(datagram) = packet.finalize(PacketType::OctreeData, 0, 513, 7) else {
            panic!("expected a single datagram");
        };
        let (header, offset) = DataHeader::decode(&datagram).expect("decode header");
        assert_eq!(header.seq, 513);
        assert_eq!(header.sent_at_us, 7);
        assert_eq!(header.list_position, None);
        assert_eq!(&datagram[offset..], b"abc");
    }

    #[test]
    fn write_refuses_bytes_past_capacity() {
        let mut packet = OutgoingPacket::new(DATA_HEADER_LEN + 4);
        packet.reset(false, 1);
        assert!(packet.write(b"abcd"));
        assert!(!packet.write(b"e"));
        assert_eq!(packet.available(), 0);
    }

    #[test]
    fn oversized_packet_splits_into_ordered_list() {
        let max = DATA_HEADER_LEN + LIST_HEADER_EXTRA + 10;
        let mut packet = OutgoingPacket::new(max);
        packet.reset(true, 3);
        let payload: Vec<u8> = (0..25).collect();
        assert!(packet.write(&payload));
        let SentPacket::List(list) = packet.finalize(PacketType::OctreeData, 0, 9, 0) else {
            panic!("expected a packet list");
        };
        assert_eq!(list.len(), 3);
        let mut reassembled = Vec::new();
        for (expected_index, datagram) in list.datagrams().iter().enumerate() {
            assert!(datagram.len() <= max);
            let (header, offset) = DataHeader::decode(datagram).expect("decode");
            assert_eq!(header.seq, 9);
            assert_eq!(header.list_position, Some((expected_index as u16, 3)));
            reassembled.extend_from_slice(&datagram[offset..]);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn sections_split_back_out() {
        let mut data = PacketData::new(64);
        assert!(data.append(b"xy"));
        data.record_element();
        let mut payload = data.finalized();
        data.change_settings(64);
        assert!(data.append(b"z"));
        data.record_element();
        payload.extend_from_slice(&data.finalized());

        let sections = split_sections(&payload).expect("split");
        assert_eq!(sections, vec![(1, &b"xy"[..]), (1, &b"z"[..])]);
    }

    #[test]
    fn deep_copy_does_not_share_storage() {
        let original = SentPacket::Single(Bytes::from_static(b"payload"));
        let copy = original.deep_copy();
        assert_eq!(copy, original);
        let (SentPacket::Single(a), SentPacket::Single(b)) = (&original, &copy) else {
            unreachable!()
        };
        assert_ne!(a.as_ptr(), b.as_ptr());
    }
}
