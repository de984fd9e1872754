//! Record types flowing through the pipeline.
//!
//! Rides and fares arrive on independent streams, share a composite trip key,
//! and are joined into [`JoinedTrip`]s. Joined trips accumulate into
//! [`WindowAccum`]s which finalize into the persisted [`WindowAggregate`] rows.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Composite key correlating a ride with its fare.
///
/// Both streams carry exactly these four fields; equality is exact, no fuzzy
/// matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TripKey {
    pub medallion: String,
    pub hack_license: String,
    pub vendor_id: String,
    pub pickup_time: DateTime<Utc>,
}

/// A decoded taxi ride, enriched with pickup/dropoff neighborhood labels.
///
/// Immutable once constructed by the decoder.
#[derive(Debug, Clone)]
pub struct RideRecord {
    pub medallion: String,
    pub hack_license: String,
    pub vendor_id: String,
    pub pickup_time: DateTime<Utc>,
    pub dropoff_time: DateTime<Utc>,
    pub pickup_lon: f64,
    pub pickup_lat: f64,
    pub dropoff_lon: f64,
    pub dropoff_lat: f64,
    pub passenger_count: u32,
    pub trip_time_in_seconds: u32,
    pub trip_distance_in_miles: f64,
    pub rate_code: String,
    pub store_and_forward_flag: String,
    pub pickup_neighborhood: String,
    pub dropoff_neighborhood: String,
}

impl RideRecord {
    pub fn key(&self) -> TripKey {
        TripKey {
            medallion: self.medallion.clone(),
            hack_license: self.hack_license.clone(),
            vendor_id: self.vendor_id.clone(),
            pickup_time: self.pickup_time,
        }
    }
}

/// A decoded fare record for a single trip.
#[derive(Debug, Clone)]
pub struct FareRecord {
    pub medallion: String,
    pub hack_license: String,
    pub vendor_id: String,
    pub pickup_time: DateTime<Utc>,
    pub payment_type: String,
    pub fare_amount: f64,
    pub surcharge: f64,
    pub mta_tax: f64,
    pub tip_amount: f64,
    pub tolls_amount: f64,
    pub total_amount: f64,
}

impl FareRecord {
    pub fn key(&self) -> TripKey {
        TripKey {
            medallion: self.medallion.clone(),
            hack_license: self.hack_license.clone(),
            vendor_id: self.vendor_id.clone(),
            pickup_time: self.pickup_time,
        }
    }
}

/// A ride matched with its fare. Exists only between the join and the
/// window aggregator; never persisted.
#[derive(Debug, Clone)]
pub struct JoinedTrip {
    pub ride: RideRecord,
    pub fare: FareRecord,
}

impl JoinedTrip {
    pub fn pickup_time(&self) -> DateTime<Utc> {
        self.ride.pickup_time
    }

    pub fn pickup_neighborhood(&self) -> &str {
        &self.ride.pickup_neighborhood
    }
}

/// Identity of a finalized aggregation window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub neighborhood: String,
}

/// Running sums for one open window. Counts and sums are associative and
/// commutative, so parallel shards can be merged before finalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowAccum {
    pub ride_count: u64,
    pub total_fare_amount: f64,
    pub total_tip_amount: f64,
}

impl WindowAccum {
    pub fn add(&mut self, trip: &JoinedTrip) {
        self.ride_count += 1;
        self.total_fare_amount += trip.fare.fare_amount;
        self.total_tip_amount += trip.fare.tip_amount;
    }

    pub fn merge(&mut self, other: &WindowAccum) {
        self.ride_count += other.ride_count;
        self.total_fare_amount += other.total_fare_amount;
        self.total_tip_amount += other.total_tip_amount;
    }

    /// Freezes this accumulator into the row persisted at the sink.
    pub fn finalize(&self, key: &WindowKey) -> WindowAggregate {
        let n = self.ride_count as f64;
        WindowAggregate {
            schema_version: 1,
            window_start: key.window_start,
            window_end: key.window_end,
            pickup_neighborhood: key.neighborhood.clone(),
            ride_count: self.ride_count,
            total_fare_amount: self.total_fare_amount,
            total_tip_amount: self.total_tip_amount,
            average_fare_amount: if self.ride_count == 0 {
                0.0
            } else {
                self.total_fare_amount / n
            },
            average_tip_amount: if self.ride_count == 0 {
                0.0
            } else {
                self.total_tip_amount / n
            },
        }
    }
}

/// Finalized per-window, per-neighborhood statistics. Emitted exactly once
/// per window key; the sink upserts by (window_start, window_end,
/// pickup_neighborhood) so redelivery is harmless.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowAggregate {
    pub schema_version: u8,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub pickup_neighborhood: String,
    pub ride_count: u64,
    pub total_fare_amount: f64,
    pub total_tip_amount: f64,
    pub average_fare_amount: f64,
    pub average_tip_amount: f64,
}
