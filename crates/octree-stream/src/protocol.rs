//! Viewer-to-server messages and the scene stats message.
//!
//! Inbound datagrams share a small header:
//!
//! ```text
//! | type (u8) | version (u8) | viewer id (16 bytes) | body ... |
//! ```
//!
//! Query bodies are bincode-encoded [`ViewerQuery`] values. NACK bodies are a
//! big-endian `u16` count followed by that many sequence numbers. Goodbye has
//! no body.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};
use crate::frustum::{LodParams, ViewFrustum};
use crate::sequence::Seq;
use crate::tree::ContentFilter;

pub type ViewerId = Uuid;

pub const PROTOCOL_VERSION: u8 = 1;
pub const INBOUND_HEADER_LEN: usize = 1 + 1 + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Query = 0x01,
    Nack = 0x02,
    Goodbye = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Query),
            0x02 => Ok(Self::Nack),
            0x03 => Ok(Self::Goodbye),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// What a viewer wants streamed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ViewerQuery {
    pub frustums: Vec<ViewFrustum>,
    pub lod: LodParams,
    /// Upper bound the viewer accepts; zero leaves the server default.
    pub max_packets_per_second: u32,
    /// JSON object matched against element properties.
    pub filter_json: Option<String>,
    pub force_full_scene: bool,
}

impl ViewerQuery {
    pub fn content_filter(&self) -> ProtocolResult<ContentFilter> {
        match &self.filter_json {
            Some(raw) if !raw.trim().is_empty() => Ok(ContentFilter::from_json(raw)?),
            _ => Ok(ContentFilter::default()),
        }
    }

    pub fn encode(&self, viewer_id: ViewerId) -> ProtocolResult<Vec<u8>> {
        let mut datagram = encode_header(MessageType::Query, viewer_id);
        bincode::serialize_into(&mut datagram, self)?;
        Ok(datagram)
    }
}

/// NACK body: the sequence numbers the viewer is missing, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NackMessage {
    pub missing: Vec<Seq>,
}

impl NackMessage {
    pub fn parse(body: &[u8]) -> ProtocolResult<Self> {
        if body.len() < 2 {
            return Err(ProtocolError::Truncated {
                needed: 2,
                available: body.len(),
            });
        }
        let count = usize::from(u16::from_be_bytes([body[0], body[1]]));
        let needed = 2 + count * 2;
        if body.len() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                available: body.len(),
            });
        }
        let missing = body[2..needed]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self { missing })
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let count = self.missing.len().min(usize::from(u16::MAX));
        let mut body = Vec::with_capacity(2 + count * 2);
        body.extend_from_slice(&(count as u16).to_be_bytes());
        for seq in &self.missing[..count] {
            body.extend_from_slice(&seq.to_be_bytes());
        }
        body
    }

    pub fn encode(&self, viewer_id: ViewerId) -> Vec<u8> {
        let mut datagram = encode_header(MessageType::Nack, viewer_id);
        datagram.extend_from_slice(&self.encode_body());
        datagram
    }
}

pub fn encode_goodbye(viewer_id: ViewerId) -> Vec<u8> {
    encode_header(MessageType::Goodbye, viewer_id)
}

fn encode_header(message_type: MessageType, viewer_id: ViewerId) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(INBOUND_HEADER_LEN + 64);
    datagram.push(message_type as u8);
    datagram.push(PROTOCOL_VERSION);
    datagram.extend_from_slice(viewer_id.as_bytes());
    datagram
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    Query(ViewerQuery),
    /// Raw NACK body, parsed by the viewer's session.
    Nack(Bytes),
    Goodbye,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub viewer_id: ViewerId,
    pub kind: InboundKind,
}

impl InboundMessage {
    pub fn decode(datagram: &[u8]) -> ProtocolResult<Self> {
        if datagram.len() < INBOUND_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: INBOUND_HEADER_LEN,
                available: datagram.len(),
            });
        }
        let message_type = MessageType::try_from(datagram[0])?;
        if datagram[1] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(datagram[1]));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&datagram[2..INBOUND_HEADER_LEN]);
        let viewer_id = Uuid::from_bytes(id);
        let body = &datagram[INBOUND_HEADER_LEN..];
        let kind = match message_type {
            MessageType::Query => InboundKind::Query(bincode::deserialize(body)?),
            MessageType::Nack => InboundKind::Nack(Bytes::copy_from_slice(body)),
            MessageType::Goodbye => InboundKind::Goodbye,
        };
        Ok(Self { viewer_id, kind })
    }
}

/// Summary sent to a viewer when a traversal of its view completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SceneStats {
    pub elements: u32,
    pub packets: u32,
    pub bytes: u64,
    pub elapsed_us: u64,
    pub full_scene: bool,
}

impl SceneStats {
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
