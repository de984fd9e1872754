//! Watermark-bounded join of the ride and fare streams.
//!
//! One buffer per side, keyed by [`TripKey`]. Each stream carries its own
//! watermark (max event time seen minus that stream's allowed lateness);
//! every advance sweeps the opposite buffer, discarding entries that can no
//! longer be matched. This bounds buffer memory to the lateness window.
//!
//! The join is owned by a single task (the joiner actor), so it needs no
//! internal locking.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::metrics::PipelineMetrics;
use crate::records::{FareRecord, JoinedTrip, RideRecord, TripKey};

pub struct WatermarkedJoin {
    ride_buf: HashMap<TripKey, RideRecord>,
    fare_buf: HashMap<TripKey, FareRecord>,
    ride_lateness_secs: i64,
    fare_lateness_secs: i64,
    ride_watermark: Option<i64>,
    fare_watermark: Option<i64>,
    metrics: Arc<PipelineMetrics>,
}

impl WatermarkedJoin {
    pub fn new(
        ride_lateness_secs: u64,
        fare_lateness_secs: u64,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            ride_buf: HashMap::new(),
            fare_buf: HashMap::new(),
            ride_lateness_secs: ride_lateness_secs as i64,
            fare_lateness_secs: fare_lateness_secs as i64,
            ride_watermark: None,
            fare_watermark: None,
            metrics,
        }
    }

    /// Offers a ride. Emits a joined trip when the matching fare is already
    /// buffered; otherwise buffers the ride unless it is provably
    /// unmatchable.
    pub fn offer_ride(&mut self, ride: RideRecord) -> Option<JoinedTrip> {
        let key = ride.key();
        let event_secs = key.pickup_time.timestamp();
        self.advance_ride_watermark(event_secs);

        if let Some(fare) = self.fare_buf.remove(&key) {
            return Some(JoinedTrip { ride, fare });
        }

        // Behind the fare watermark: the counterpart has already been
        // retired, so this ride can never match.
        if self.fare_watermark.is_some_and(|wm| event_secs < wm) {
            self.metrics.record_unmatched_ride();
            debug!(medallion = %key.medallion, event_secs, "ride behind fare watermark, dropped");
            return None;
        }

        if self.ride_buf.contains_key(&key) {
            // First-match-wins: keep the record already buffered.
            self.metrics.record_duplicate_buffered();
            return None;
        }
        self.ride_buf.insert(key, ride);
        None
    }

    /// Offers a fare; mirror of [`Self::offer_ride`].
    pub fn offer_fare(&mut self, fare: FareRecord) -> Option<JoinedTrip> {
        let key = fare.key();
        let event_secs = key.pickup_time.timestamp();
        self.advance_fare_watermark(event_secs);

        if let Some(ride) = self.ride_buf.remove(&key) {
            return Some(JoinedTrip { ride, fare });
        }

        if self.ride_watermark.is_some_and(|wm| event_secs < wm) {
            self.metrics.record_unmatched_fare();
            debug!(medallion = %key.medallion, event_secs, "fare behind ride watermark, dropped");
            return None;
        }

        if self.fare_buf.contains_key(&key) {
            self.metrics.record_duplicate_buffered();
            return None;
        }
        self.fare_buf.insert(key, fare);
        None
    }

    fn advance_ride_watermark(&mut self, event_secs: i64) {
        let candidate = event_secs - self.ride_lateness_secs;
        if self.ride_watermark.is_none_or(|wm| candidate > wm) {
            self.ride_watermark = Some(candidate);
            // Fares behind the ride watermark will never see their ride.
            let metrics = &self.metrics;
            self.fare_buf.retain(|key, _| {
                let keep = key.pickup_time.timestamp() >= candidate;
                if !keep {
                    metrics.record_unmatched_fare();
                }
                keep
            });
        }
    }

    fn advance_fare_watermark(&mut self, event_secs: i64) {
        let candidate = event_secs - self.fare_lateness_secs;
        if self.fare_watermark.is_none_or(|wm| candidate > wm) {
            self.fare_watermark = Some(candidate);
            let metrics = &self.metrics;
            self.ride_buf.retain(|key, _| {
                let keep = key.pickup_time.timestamp() >= candidate;
                if !keep {
                    metrics.record_unmatched_ride();
                }
                keep
            });
        }
    }

    /// The slower of the two stream watermarks, in epoch seconds. Drives
    /// window finalization; `None` until both streams have seen data.
    pub fn combined_watermark(&self) -> Option<i64> {
        match (self.ride_watermark, self.fare_watermark) {
            (Some(r), Some(f)) => Some(r.min(f)),
            _ => None,
        }
    }

    pub fn buffered_rides(&self) -> usize {
        self.ride_buf.len()
    }

    pub fn buffered_fares(&self) -> usize {
        self.fare_buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::test_support::{fare, ride};

    fn join(metrics: &Arc<PipelineMetrics>) -> WatermarkedJoin {
        // 30s lateness on both sides.
        WatermarkedJoin::new(30, 30, metrics.clone())
    }

    #[test]
    fn test_ride_then_fare_joins_once() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut j = join(&metrics);

        assert!(j.offer_ride(ride("M1", 1000, "Midtown")).is_none());
        let trip = j.offer_fare(fare("M1", 1000, 10.0, 2.0)).unwrap();

        assert_eq!(trip.ride.medallion, "M1");
        assert_eq!(trip.fare.fare_amount, 10.0);
        assert_eq!(j.buffered_rides(), 0);
        assert_eq!(j.buffered_fares(), 0);
    }

    #[test]
    fn test_fare_then_ride_joins_once() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut j = join(&metrics);

        assert!(j.offer_fare(fare("M1", 1000, 10.0, 2.0)).is_none());
        assert!(j.offer_ride(ride("M1", 1000, "Midtown")).is_some());
    }

    #[test]
    fn test_different_keys_do_not_join() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut j = join(&metrics);

        assert!(j.offer_ride(ride("M1", 1000, "Midtown")).is_none());
        assert!(j.offer_fare(fare("M2", 1000, 10.0, 2.0)).is_none());
        assert_eq!(j.buffered_rides(), 1);
        assert_eq!(j.buffered_fares(), 1);
    }

    #[test]
    fn test_watermark_sweeps_unmatched_fare() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut j = join(&metrics);

        assert!(j.offer_fare(fare("M1", 1000, 10.0, 2.0)).is_none());
        // Ride stream advances far past the fare: ride watermark becomes
        // 2000 - 30, so the fare at 1000 is swept.
        assert!(j.offer_ride(ride("M2", 2000, "Midtown")).is_none());

        assert_eq!(j.buffered_fares(), 0);
        assert_eq!(metrics.snapshot().unmatched_fares, 1);

        // The late-arriving ride for that fare finds nothing and is itself
        // behind the fare watermark only if fares advanced; here it buffers.
        assert!(j.offer_ride(ride("M1", 1000, "Midtown")).is_none());
        assert_eq!(j.buffered_rides(), 2);
    }

    #[test]
    fn test_arrival_behind_opposite_watermark_dropped() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut j = join(&metrics);

        // Fare watermark moves to 5000 - 30 = 4970.
        assert!(j.offer_fare(fare("M1", 5000, 10.0, 2.0)).is_none());
        // A ride at 1000 can never find its fare.
        assert!(j.offer_ride(ride("M2", 1000, "Midtown")).is_none());

        assert_eq!(j.buffered_rides(), 0);
        assert_eq!(metrics.snapshot().unmatched_rides, 1);
    }

    #[test]
    fn test_same_side_duplicate_first_wins() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut j = join(&metrics);

        let first = ride("M1", 1000, "Midtown");
        let mut second = ride("M1", 1000, "Midtown");
        second.passenger_count = 4;

        assert!(j.offer_ride(first).is_none());
        assert!(j.offer_ride(second).is_none());
        assert_eq!(j.buffered_rides(), 1);
        assert_eq!(metrics.snapshot().duplicate_buffered, 1);

        let trip = j.offer_fare(fare("M1", 1000, 10.0, 2.0)).unwrap();
        assert_eq!(trip.ride.passenger_count, 1);
    }

    #[test]
    fn test_combined_watermark_requires_both_streams() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut j = join(&metrics);

        assert_eq!(j.combined_watermark(), None);
        j.offer_ride(ride("M1", 1000, "Midtown"));
        assert_eq!(j.combined_watermark(), None);
        j.offer_fare(fare("M2", 500, 5.0, 0.0));
        // min(1000 - 30, 500 - 30)
        assert_eq!(j.combined_watermark(), Some(470));
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut j = join(&metrics);

        j.offer_ride(ride("M1", 2000, "Midtown"));
        j.offer_fare(fare("M1", 2000, 10.0, 2.0));
        assert_eq!(j.combined_watermark(), Some(1970));

        // Older events do not move the watermark backwards.
        j.offer_ride(ride("M2", 1990, "Midtown"));
        j.offer_fare(fare("M2", 1990, 8.0, 1.0));
        assert_eq!(j.combined_watermark(), Some(1970));
    }

    #[test]
    fn test_match_within_lateness_window() {
        let metrics = Arc::new(PipelineMetrics::default());
        let mut j = join(&metrics);

        assert!(j.offer_ride(ride("M1", 1000, "Midtown")).is_none());
        // Fare stream is 20s behind; within the 30s lateness it still joins.
        assert!(j.offer_fare(fare("M2", 1020, 5.0, 0.0)).is_none());
        assert!(j.offer_fare(fare("M1", 1000, 10.0, 2.0)).is_some());
    }
}
