//! Process-wide and per-worker streaming statistics.
//!
//! [`Metrics`] is owned by the coordinator and shared with every worker.
//! Counters are plain atomics; phase timings and viewer activity sit behind
//! short `parking_lot` locks. Everything can be snapshotted for reporting and
//! reset in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::protocol::ViewerId;

/// Phase durations at or below this many microseconds count as short.
pub const MAX_SHORT_TIME_US: u64 = 10;
/// Phase durations at or below this many microseconds count as long; above
/// it they are extra long.
pub const MAX_LONG_TIME_US: u64 = 100;
const MOVING_AVERAGE_WINDOW: u64 = 100;
pub const PHASE_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    LockWait,
    Traversal,
    Encode,
    CompressWrite,
    Send,
    Loop,
}

impl Phase {
    pub const ALL: [Phase; PHASE_COUNT] = [
        Phase::LockWait,
        Phase::Traversal,
        Phase::Encode,
        Phase::CompressWrite,
        Phase::Send,
        Phase::Loop,
    ];

    pub const fn as_index(self) -> usize {
        match self {
            Phase::LockWait => 0,
            Phase::Traversal => 1,
            Phase::Encode => 2,
            Phase::CompressWrite => 3,
            Phase::Send => 4,
            Phase::Loop => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MovingAverage {
    samples: u64,
    average: f64,
}

impl MovingAverage {
    fn update(&mut self, sample: f64) {
        self.samples = (self.samples + 1).min(MOVING_AVERAGE_WINDOW);
        self.average += (sample - self.average) / self.samples as f64;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PhaseStats {
    skipped: u64,
    short: u64,
    long: u64,
    extra_long: u64,
    average_us: MovingAverage,
}

impl PhaseStats {
    fn track(&mut self, elapsed: Option<Duration>) {
        let Some(elapsed) = elapsed else {
            self.skipped += 1;
            return;
        };
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.average_us.update(micros as f64);
        if micros <= MAX_SHORT_TIME_US {
            self.short += 1;
        } else if micros <= MAX_LONG_TIME_US {
            self.long += 1;
        } else {
            self.extra_long += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseSnapshot {
    pub phase: Phase,
    pub skipped: u64,
    pub short: u64,
    pub long: u64,
    pub extra_long: u64,
    pub average_us: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Activity {
    processed: Option<Instant>,
    distributed: Option<Instant>,
    sent: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Processed,
    Distributed,
    Sent,
}

#[derive(Debug, Default)]
pub struct Metrics {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    wasted_bytes: AtomicU64,
    suppressed_packets: AtomicU64,
    retransmitted_packets: AtomicU64,
    nack_misses: AtomicU64,
    oversized_packets: AtomicU64,
    oversized_skipped: AtomicU64,
    scenes_completed: AtomicU64,
    transport_errors: AtomicU64,
    sleep_time_us: AtomicU64,
    sleep_calls: AtomicU64,
    viewers_connected: AtomicU64,
    viewers_total: AtomicU64,
    phases: Mutex<[PhaseStats; PHASE_COUNT]>,
    activity: Mutex<HashMap<ViewerId, Activity>>,
    since: Mutex<Option<Instant>>,
}

impl Metrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        *metrics.since.lock() = Some(Instant::now());
        metrics
    }

    pub fn record_packet(&self, bytes: usize, wasted: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.wasted_bytes.fetch_add(wasted as u64, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self, bytes: usize) {
        self.suppressed_packets.fetch_add(1, Ordering::Relaxed);
        self.wasted_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_retransmit(&self, bytes: usize) {
        self.retransmitted_packets.fetch_add(1, Ordering::Relaxed);
        self.record_packet(bytes, 0);
    }

    pub fn record_nack_miss(&self) {
        self.nack_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized(&self) {
        self.oversized_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized_skip(&self) {
        self.oversized_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scene_completed(&self) {
        self.scenes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sleep(&self, slept: Duration) {
        self.sleep_calls.fetch_add(1, Ordering::Relaxed);
        self.sleep_time_us.fetch_add(
            u64::try_from(slept.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn viewer_connected(&self) {
        self.viewers_connected.fetch_add(1, Ordering::Relaxed);
        self.viewers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn viewer_disconnected(&self, viewer: ViewerId) {
        let _ = self
            .viewers_connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
        self.activity.lock().remove(&viewer);
    }

    /// `None` records that the phase was skipped this pass.
    pub fn track_phase(&self, phase: Phase, elapsed: Option<Duration>) {
        self.phases.lock()[phase.as_index()].track(elapsed);
    }

    pub fn phase_timer(&self, phase: Phase) -> PhaseTimer<'_> {
        PhaseTimer {
            metrics: self,
            phase,
            start: Instant::now(),
        }
    }

    pub fn mark_activity(&self, viewer: ViewerId, kind: ActivityKind, now: Instant) {
        let mut activity = self.activity.lock();
        let entry = activity.entry(viewer).or_default();
        match kind {
            ActivityKind::Processed => entry.processed = Some(now),
            ActivityKind::Distributed => entry.distributed = Some(now),
            ActivityKind::Sent => entry.sent = Some(now),
        }
    }

    /// Number of viewers whose worker did `kind` at or after `since`.
    pub fn how_many_did(&self, kind: ActivityKind, since: Instant) -> usize {
        self.activity
            .lock()
            .values()
            .filter(|entry| {
                let at = match kind {
                    ActivityKind::Processed => entry.processed,
                    ActivityKind::Distributed => entry.distributed,
                    ActivityKind::Sent => entry.sent,
                };
                at.is_some_and(|at| at >= since)
            })
            .count()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let recent = now.checked_sub(Duration::from_secs(1)).unwrap_or(now);
        let phases = self.phases.lock();
        let phases = Phase::ALL
            .iter()
            .map(|phase| {
                let stats = phases[phase.as_index()];
                PhaseSnapshot {
                    phase: *phase,
                    skipped: stats.skipped,
                    short: stats.short,
                    long: stats.long,
                    extra_long: stats.extra_long,
                    average_us: stats.average_us.average,
                }
            })
            .collect();
        let since = (*self.since.lock()).unwrap_or(now);
        MetricsSnapshot {
            uptime_ms: u64::try_from(now.saturating_duration_since(since).as_millis())
                .unwrap_or(u64::MAX),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            wasted_bytes: self.wasted_bytes.load(Ordering::Relaxed),
            suppressed_packets: self.suppressed_packets.load(Ordering::Relaxed),
            retransmitted_packets: self.retransmitted_packets.load(Ordering::Relaxed),
            nack_misses: self.nack_misses.load(Ordering::Relaxed),
            oversized_packets: self.oversized_packets.load(Ordering::Relaxed),
            oversized_skipped: self.oversized_skipped.load(Ordering::Relaxed),
            scenes_completed: self.scenes_completed.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            sleep_time_us: self.sleep_time_us.load(Ordering::Relaxed),
            sleep_calls: self.sleep_calls.load(Ordering::Relaxed),
            viewers_connected: self.viewers_connected.load(Ordering::Relaxed),
            viewers_total: self.viewers_total.load(Ordering::Relaxed),
            viewers_processed_last_second: self.how_many_did(ActivityKind::Processed, recent),
            viewers_sent_last_second: self.how_many_did(ActivityKind::Sent, recent),
            phases,
        }
    }

    /// Clears counters and histograms. Connected-viewer bookkeeping survives.
    pub fn reset(&self) {
        for counter in [
            &self.packets_sent,
            &self.bytes_sent,
            &self.wasted_bytes,
            &self.suppressed_packets,
            &self.retransmitted_packets,
            &self.nack_misses,
            &self.oversized_packets,
            &self.oversized_skipped,
            &self.scenes_completed,
            &self.transport_errors,
            &self.sleep_time_us,
            &self.sleep_calls,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.viewers_total.store(
            self.viewers_connected.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        *self.phases.lock() = Default::default();
        *self.since.lock() = Some(Instant::now());
    }
}

/// Records the elapsed time of a phase when dropped.
pub struct PhaseTimer<'a> {
    metrics: &'a Metrics,
    phase: Phase,
    start: Instant,
}

impl PhaseTimer<'_> {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for PhaseTimer<'_> {
    fn drop(&mut self) {
        self.metrics.track_phase(self.phase, Some(self.start.elapsed()));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub wasted_bytes: u64,
    pub suppressed_packets: u64,
    pub retransmitted_packets: u64,
    pub nack_misses: u64,
    pub oversized_packets: u64,
    pub oversized_skipped: u64,
    pub scenes_completed: u64,
    pub transport_errors: u64,
    pub sleep_time_us: u64,
    pub sleep_calls: u64,
    pub viewers_connected: u64,
    pub viewers_total: u64,
    pub viewers_processed_last_second: usize,
    pub viewers_sent_last_second: usize,
    pub phases: Vec<PhaseSnapshot>,
}

impl MetricsSnapshot {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseSnapshot> {
        self.phases.iter().find(|snapshot| snapshot.phase == phase)
    }
}

/// Counters belonging to one worker, readable by the coordinator while the
/// worker runs.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub wasted_bytes: AtomicU64,
    pub suppressed_packets: AtomicU64,
    pub retransmitted_packets: AtomicU64,
    pub elements_sent: AtomicU64,
    pub passes: AtomicU64,
    pub scenes_completed: AtomicU64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> WorkerCountersSnapshot {
        WorkerCountersSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            wasted_bytes: self.wasted_bytes.load(Ordering::Relaxed),
            suppressed_packets: self.suppressed_packets.load(Ordering::Relaxed),
            retransmitted_packets: self.retransmitted_packets.load(Ordering::Relaxed),
            elements_sent: self.elements_sent.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            scenes_completed: self.scenes_completed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.packets_sent,
            &self.bytes_sent,
            &self.wasted_bytes,
            &self.suppressed_packets,
            &self.retransmitted_packets,
            &self.elements_sent,
            &self.passes,
            &self.scenes_completed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct WorkerCountersSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub wasted_bytes: u64,
    pub suppressed_packets: u64,
    pub retransmitted_packets: u64,
    pub elements_sent: u64,
    pub passes: u64,
    pub scenes_completed: u64,
}
