//! Per-interval packet budgets.
//!
//! Time is cut into fixed intervals (`1s / intervals_per_second`). Each
//! viewer may send a bounded number of packets per interval, and all viewers
//! together may not exceed the server-wide budget. Budgets are only consumed
//! by packets that actually go out.
//!
//! A packet list can span more datagrams than a whole interval allows. Such a
//! request is granted once the budget has tokens left and owes nothing; the
//! shortfall becomes debt that the following intervals pay back before they
//! hand out new tokens, so the average rate still holds.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::config::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthConfig {
    pub packets_per_viewer_per_interval: u32,
    pub packets_per_server_per_interval: u32,
    pub intervals_per_second: u32,
}

impl BandwidthConfig {
    pub fn from_rates(per_viewer_per_second: u32, total_per_second: u32, intervals_per_second: u32) -> Self {
        let intervals_per_second = intervals_per_second.max(1);
        Self {
            packets_per_viewer_per_interval: (per_viewer_per_second / intervals_per_second).max(1),
            packets_per_server_per_interval: (total_per_second / intervals_per_second).max(1),
            intervals_per_second,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::from_rates(
            config.packets_per_second_per_viewer,
            config.packets_per_second_total,
            config.intervals_per_second,
        )
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.intervals_per_second.max(1)))
    }

    /// Effective budget for one viewer: the smallest of what the viewer asked
    /// for, the per-viewer cap and an even share of the server budget.
    /// `viewer_packets_per_second == 0` means the viewer expressed no limit.
    pub fn per_viewer_budget(&self, viewer_packets_per_second: u32, viewer_count: usize) -> u32 {
        let viewer_count = u32::try_from(viewer_count.max(1)).unwrap_or(u32::MAX);
        let server_share = (self.packets_per_server_per_interval / viewer_count).max(1);
        let requested = if viewer_packets_per_second == 0 {
            self.packets_per_viewer_per_interval
        } else {
            (viewer_packets_per_second / self.intervals_per_second).max(1)
        };
        requested
            .min(self.packets_per_viewer_per_interval)
            .min(server_share)
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

#[derive(Debug)]
struct BudgetState {
    epoch: u64,
    used: u32,
    capacity: u32,
    /// Tokens borrowed from intervals that have not started yet.
    debt: u64,
}

impl BudgetState {
    fn admits(&self, packets: u32) -> bool {
        if packets > self.capacity {
            return self.debt == 0 && self.used < self.capacity;
        }
        self.used.saturating_add(packets) <= self.capacity
    }

    fn take(&mut self, packets: u32) {
        let free = self.capacity.saturating_sub(self.used);
        if packets > free {
            self.debt += u64::from(packets - free);
            self.used = self.capacity;
        } else {
            self.used += packets;
        }
    }
}

/// Token counter that refills at every interval boundary.
#[derive(Debug)]
pub struct IntervalBudget {
    origin: Instant,
    interval: Duration,
    state: Mutex<BudgetState>,
}

impl IntervalBudget {
    pub fn new(interval: Duration, capacity: u32) -> Self {
        Self::starting_at(Instant::now(), interval, capacity)
    }

    pub fn starting_at(origin: Instant, interval: Duration, capacity: u32) -> Self {
        Self {
            origin,
            interval: interval.max(Duration::from_micros(1)),
            state: Mutex::new(BudgetState {
                epoch: 0,
                used: 0,
                capacity,
                debt: 0,
            }),
        }
    }

    /// A budget whose intervals start at the same instants as `other`'s.
    pub fn aligned_with(other: &IntervalBudget, capacity: u32) -> Self {
        Self::starting_at(other.origin, other.interval, capacity)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn epoch_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.interval.as_nanos().max(1)) as u64
    }

    pub fn next_interval_start(&self, now: Instant) -> Instant {
        let next_epoch = self.epoch_at(now) + 1;
        let offset = self.interval.as_nanos().saturating_mul(u128::from(next_epoch));
        self.origin + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
    }

    fn roll(&self, state: &mut BudgetState, now: Instant) {
        let epoch = self.epoch_at(now);
        if epoch == state.epoch {
            return;
        }
        let elapsed = epoch.saturating_sub(state.epoch).max(1);
        let capacity = u64::from(state.capacity);
        state.epoch = epoch;
        // Intervals that passed untouched repay a full capacity each.
        let debt = state
            .debt
            .saturating_sub(capacity.saturating_mul(elapsed - 1));
        let repaid_now = debt.min(capacity);
        state.debt = debt - repaid_now;
        state.used = u32::try_from(repaid_now).unwrap_or(state.capacity);
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().capacity
    }

    /// Changes the per-interval capacity. Tokens already used this interval
    /// stay used.
    pub fn set_capacity(&self, capacity: u32) {
        self.state.lock().capacity = capacity;
    }

    pub fn remaining(&self, now: Instant) -> u32 {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        state.capacity.saturating_sub(state.used)
    }

    pub fn used(&self, now: Instant) -> u32 {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        state.used
    }

    /// Tokens still owed to future intervals.
    pub fn debt(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        state.debt
    }

    /// Whether [`try_consume`](Self::try_consume) would grant `packets` now.
    pub fn can_consume(&self, packets: u32, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        state.admits(packets)
    }

    /// Takes `packets` tokens, all or nothing. A request larger than the
    /// whole capacity borrows from the following intervals.
    pub fn try_consume(&self, packets: u32, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        if !state.admits(packets) {
            return false;
        }
        state.take(packets);
        true
    }
}

/// A worker's view of its own budget plus the shared server budget.
#[derive(Debug)]
pub struct Throttle {
    viewer: IntervalBudget,
    server: Arc<IntervalBudget>,
    sleep_time: Duration,
    sleep_calls: u64,
}

impl Throttle {
    pub fn new(server: Arc<IntervalBudget>, viewer_capacity: u32) -> Self {
        Self {
            viewer: IntervalBudget::aligned_with(&server, viewer_capacity),
            server,
            sleep_time: Duration::ZERO,
            sleep_calls: 0,
        }
    }

    pub fn set_viewer_capacity(&self, capacity: u32) {
        self.viewer.set_capacity(capacity);
    }

    pub fn viewer_capacity(&self) -> u32 {
        self.viewer.capacity()
    }

    pub fn viewer_remaining(&self, now: Instant) -> u32 {
        self.viewer.remaining(now)
    }

    pub fn has_capacity(&self, now: Instant) -> bool {
        self.viewer.remaining(now) > 0 && self.server.remaining(now) > 0
    }

    /// Takes `packets` tokens from both budgets, or none from either. Only
    /// this worker consumes from its viewer budget, so checking it first and
    /// committing after the shared budget succeeds cannot race.
    pub fn try_acquire(&self, packets: u32, now: Instant) -> bool {
        if !self.viewer.can_consume(packets, now) {
            return false;
        }
        if !self.server.try_consume(packets, now) {
            trace!(target = "stream::throttle", packets, "server budget exhausted");
            return false;
        }
        self.viewer.try_consume(packets, now)
    }

    pub fn next_interval_start(&self, now: Instant) -> Instant {
        self.viewer.next_interval_start(now)
    }

    /// Suspends until the next interval boundary. Returns the time slept.
    pub async fn sleep_until_next_interval(&mut self) -> Duration {
        let started = Instant::now();
        let wake_at = self.next_interval_start(started);
        tokio::time::sleep_until(wake_at).await;
        let slept = Instant::now().saturating_duration_since(started);
        self.sleep_time += slept;
        self.sleep_calls += 1;
        slept
    }

    pub fn sleep_time(&self) -> Duration {
        self.sleep_time
    }

    pub fn sleep_calls(&self) -> u64 {
        self.sleep_calls
    }
}
