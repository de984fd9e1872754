//! Pipeline drop counters and window emission metrics.
//!
//! Shared via `Arc` and incremented by each stage through explicit calls;
//! no stage reads a counter for correctness. [`PipelineMetrics::snapshot`]
//! produces the serializable view logged periodically and at shutdown.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    malformed_rides: AtomicU64,
    malformed_fares: AtomicU64,
    unmatched_rides: AtomicU64,
    unmatched_fares: AtomicU64,
    duplicate_buffered: AtomicU64,
    late_trips: AtomicU64,
    windows_emitted: AtomicU64,
    emit_latency_ms_total: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub malformed_rides: u64,
    pub malformed_fares: u64,
    pub unmatched_rides: u64,
    pub unmatched_fares: u64,
    pub duplicate_buffered: u64,
    pub late_trips: u64,
    pub windows_emitted: u64,
    pub avg_emit_latency_ms: f64,
}

impl PipelineMetrics {
    /// A ride payload failed to decode and was dropped.
    pub fn record_malformed_ride(&self) {
        self.malformed_rides.fetch_add(1, Ordering::Relaxed);
    }

    /// A fare payload failed to decode and was dropped.
    pub fn record_malformed_fare(&self) {
        self.malformed_fares.fetch_add(1, Ordering::Relaxed);
    }

    /// A buffered or arriving ride became provably unmatchable.
    pub fn record_unmatched_ride(&self) {
        self.unmatched_rides.fetch_add(1, Ordering::Relaxed);
    }

    /// A buffered or arriving fare became provably unmatchable.
    pub fn record_unmatched_fare(&self) {
        self.unmatched_fares.fetch_add(1, Ordering::Relaxed);
    }

    /// A second same-side record arrived for a key that was already buffered.
    pub fn record_duplicate_buffered(&self) {
        self.duplicate_buffered.fetch_add(1, Ordering::Relaxed);
    }

    /// A joined trip arrived after its window had already finalized.
    pub fn record_late_trip(&self) {
        self.late_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// A window finalized; `latency_ms` is wall-clock time past the window end.
    pub fn record_window_emitted(&self, latency_ms: u64) {
        self.windows_emitted.fetch_add(1, Ordering::Relaxed);
        self.emit_latency_ms_total
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let windows = self.windows_emitted.load(Ordering::Relaxed);
        let latency_total = self.emit_latency_ms_total.load(Ordering::Relaxed);
        MetricsSnapshot {
            malformed_rides: self.malformed_rides.load(Ordering::Relaxed),
            malformed_fares: self.malformed_fares.load(Ordering::Relaxed),
            unmatched_rides: self.unmatched_rides.load(Ordering::Relaxed),
            unmatched_fares: self.unmatched_fares.load(Ordering::Relaxed),
            duplicate_buffered: self.duplicate_buffered.load(Ordering::Relaxed),
            late_trips: self.late_trips.load(Ordering::Relaxed),
            windows_emitted: windows,
            avg_emit_latency_ms: if windows == 0 {
                0.0
            } else {
                latency_total as f64 / windows as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_starts_at_zero() {
        let m = PipelineMetrics::default();
        let s = m.snapshot();
        assert_eq!(s.malformed_rides, 0);
        assert_eq!(s.windows_emitted, 0);
        assert_eq!(s.avg_emit_latency_ms, 0.0);
    }

    #[test]
    fn test_counters_increment_independently() {
        let m = PipelineMetrics::default();
        m.record_malformed_ride();
        m.record_malformed_fare();
        m.record_malformed_fare();
        m.record_unmatched_ride();
        m.record_late_trip();

        let s = m.snapshot();
        assert_eq!(s.malformed_rides, 1);
        assert_eq!(s.malformed_fares, 2);
        assert_eq!(s.unmatched_rides, 1);
        assert_eq!(s.unmatched_fares, 0);
        assert_eq!(s.late_trips, 1);
    }

    #[test]
    fn test_average_emit_latency() {
        let m = PipelineMetrics::default();
        m.record_window_emitted(100);
        m.record_window_emitted(300);

        let s = m.snapshot();
        assert_eq!(s.windows_emitted, 2);
        assert_eq!(s.avg_emit_latency_ms, 200.0);
    }
}
