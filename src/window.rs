//! Epoch-aligned tumbling-window aggregation of joined trips.
//!
//! Windows are keyed by (window start, pickup neighborhood) and finalized
//! exactly once, when the join's combined watermark passes the window end.
//! A finalized window never reopens: trips for it are counted as late and
//! dropped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::metrics::PipelineMetrics;
use crate::records::{JoinedTrip, WindowAccum, WindowAggregate, WindowKey};

pub struct WindowAggregator {
    window_secs: i64,
    open: HashMap<(i64, String), WindowAccum>,
    // Highest window end already finalized; anything at or below is late.
    finalized_through: Option<i64>,
    metrics: Arc<PipelineMetrics>,
}

impl WindowAggregator {
    pub fn new(window_secs: u64, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            window_secs: window_secs.max(1) as i64,
            open: HashMap::new(),
            finalized_through: None,
            metrics,
        }
    }

    fn window_start(&self, event_secs: i64) -> i64 {
        event_secs.div_euclid(self.window_secs) * self.window_secs
    }

    /// Folds one joined trip into its window accumulator, or drops it as
    /// late data when that window has already been finalized.
    pub fn observe(&mut self, trip: &JoinedTrip) {
        let event_secs = trip.pickup_time().timestamp();
        let start = self.window_start(event_secs);
        let end = start + self.window_secs;

        if self.finalized_through.is_some_and(|through| end <= through) {
            self.metrics.record_late_trip();
            debug!(
                window_end = end,
                neighborhood = trip.pickup_neighborhood(),
                "trip for finalized window, dropped"
            );
            return;
        }

        self.open
            .entry((start, trip.pickup_neighborhood().to_string()))
            .or_default()
            .add(trip);
    }

    /// Finalizes and returns every window whose end has been passed by
    /// `watermark_secs`, ordered by window start then neighborhood. The
    /// accumulators are discarded.
    pub fn finalize_up_to(&mut self, watermark_secs: i64) -> Vec<WindowAggregate> {
        let window_secs = self.window_secs;
        let mut ready: Vec<(i64, String)> = self
            .open
            .keys()
            .filter(|(start, _)| start + window_secs <= watermark_secs)
            .cloned()
            .collect();
        if ready.is_empty() {
            return Vec::new();
        }
        ready.sort();

        let now = Utc::now();
        let mut out = Vec::with_capacity(ready.len());
        for (start, neighborhood) in ready {
            let accum = match self.open.remove(&(start, neighborhood.clone())) {
                Some(accum) => accum,
                None => continue,
            };
            let end = start + window_secs;
            let key = WindowKey {
                window_start: epoch(start),
                window_end: epoch(end),
                neighborhood,
            };
            let latency_ms = (now - key.window_end).num_milliseconds().max(0) as u64;
            self.metrics.record_window_emitted(latency_ms);
            if self.finalized_through.is_none_or(|through| end > through) {
                self.finalized_through = Some(end);
            }
            out.push(accum.finalize(&key));
        }
        out
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }
}

fn epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
