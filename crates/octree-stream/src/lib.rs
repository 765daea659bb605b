//! Streams the contents of a shared spatial tree to many viewers over an
//! unreliable datagram transport.
//!
//! Each viewer gets a [`SendWorker`] that traverses the tree in priority
//! order for the viewer's current view, packs elements into fixed-size
//! datagrams, and keeps a short history so lost packets can be repaired on
//! request. The [`ServerCoordinator`] owns the workers and routes inbound
//! queries, NACKs, and goodbyes to them.

pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod frustum;
pub mod history;
pub mod metrics;
pub mod packet;
pub mod policy;
pub mod protocol;
pub mod sequence;
pub mod session;
pub mod throttle;
pub mod transport;
pub mod tree;
pub mod worker;

pub use config::{PolicyKind, StreamConfig};
pub use coordinator::{CoordinatorStats, QueryRouting, ReapSummary, ServerCoordinator, ViewerStats};
pub use directory::MembershipDirectory;
pub use error::{ProtocolError, ProtocolResult, StreamError, StreamResult, TransportError};
pub use frustum::{ViewFrustum, ViewSet};
pub use history::SentPacketHistory;
pub use metrics::{Metrics, MetricsSnapshot, Phase, WorkerCounters, WorkerCountersSnapshot};
pub use packet::{DataHeader, PacketType, SentPacket};
pub use policy::{TraversalKind, TraversalPolicy};
pub use protocol::{InboundKind, InboundMessage, NackMessage, SceneStats, ViewerId, ViewerQuery};
pub use sequence::{seq_distance, seq_is_newer, Arrival, Seq, SequenceStats};
pub use session::{SessionInbox, ViewerSession};
pub use throttle::{BandwidthConfig, IntervalBudget, Throttle};
pub use transport::{DatagramTransport, UdpTransport};
pub use tree::{ContentFilter, ElementId, MemoryOctree, SharedTree, SpatialTree};
pub use worker::{PassStatus, PassSummary, SendWorker, WorkerContext};
