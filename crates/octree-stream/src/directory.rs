use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::protocol::ViewerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub last_heard: Instant,
}

/// Known viewers and where to reach them. Workers resolve their viewer here
/// on every pass; a missing entry means the viewer is gone.
#[derive(Debug, Default)]
pub struct MembershipDirectory {
    peers: DashMap<ViewerId, PeerRecord>,
}

impl MembershipDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `viewer` was heard from at `addr`, adding it if unknown.
    pub fn touch(&self, viewer: ViewerId, addr: SocketAddr, now: Instant) {
        self.peers
            .entry(viewer)
            .and_modify(|record| {
                record.addr = addr;
                record.last_heard = now;
            })
            .or_insert(PeerRecord {
                addr,
                last_heard: now,
            });
    }

    pub fn lookup(&self, viewer: &ViewerId) -> Option<SocketAddr> {
        self.peers.get(viewer).map(|record| record.addr)
    }

    pub fn record(&self, viewer: &ViewerId) -> Option<PeerRecord> {
        self.peers.get(viewer).map(|record| *record)
    }

    pub fn remove(&self, viewer: &ViewerId) -> Option<PeerRecord> {
        self.peers.remove(viewer).map(|(_, record)| record)
    }

    /// Viewers not heard from within `idle_timeout`.
    pub fn idle_since(&self, now: Instant, idle_timeout: Duration) -> Vec<ViewerId> {
        self.peers
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_heard) > idle_timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
