//! Stream decoders: JSON ride payloads and delimited fare rows.
//!
//! Each decoder turns one raw message into a typed record or a
//! [`DecodeError`]. Callers count the error and drop the payload; a
//! malformed record never reaches the join.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::geo::GeoResolver;
use crate::records::{FareRecord, RideRecord};

/// Fixed textual timestamp format used by both streams.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Missing field, schema mismatch, or unparseable payload.
    #[error("decode error: {0}")]
    Malformed(String),
    /// The textual pickup-time field did not match [`TIMESTAMP_FORMAT`].
    #[error("timestamp parse error: {0}")]
    TimestampParse(String),
}

impl DecodeError {
    /// Canonical short label for the failure class.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "decode error",
            DecodeError::TimestampParse(_) => "timestamp parse error",
        }
    }
}

/// Parses a naive `%Y-%m-%d %H:%M:%S` timestamp, interpreted as UTC.
pub fn parse_event_time(s: &str) -> Result<DateTime<Utc>, DecodeError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| DecodeError::TimestampParse(format!("'{s}': {e}")))
}

mod event_time_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, super::TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

/// Wire shape of one ride message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRide {
    medallion: String,
    hack_license: String,
    vendor_id: String,
    #[serde(with = "event_time_format")]
    pickup_time: DateTime<Utc>,
    #[serde(with = "event_time_format")]
    dropoff_time: DateTime<Utc>,
    pickup_lon: f64,
    pickup_lat: f64,
    dropoff_lon: f64,
    dropoff_lat: f64,
    passenger_count: u32,
    trip_time_in_seconds: u32,
    trip_distance_in_miles: f64,
    rate_code: String,
    store_and_forward_flag: String,
}

/// Decodes ride JSON and attaches pickup/dropoff neighborhood labels.
///
/// Any missing or mistyped field is a decode error; an unresolvable
/// coordinate is not (it becomes the `Unresolved` label).
pub struct RideDecoder {
    geo: Arc<GeoResolver>,
}

impl RideDecoder {
    pub fn new(geo: Arc<GeoResolver>) -> Self {
        Self { geo }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<RideRecord, DecodeError> {
        let raw: RawRide = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let pickup_neighborhood = self.geo.resolve(raw.pickup_lon, raw.pickup_lat).to_string();
        let dropoff_neighborhood = self
            .geo
            .resolve(raw.dropoff_lon, raw.dropoff_lat)
            .to_string();

        Ok(RideRecord {
            medallion: raw.medallion,
            hack_license: raw.hack_license,
            vendor_id: raw.vendor_id,
            pickup_time: raw.pickup_time,
            dropoff_time: raw.dropoff_time,
            pickup_lon: raw.pickup_lon,
            pickup_lat: raw.pickup_lat,
            dropoff_lon: raw.dropoff_lon,
            dropoff_lat: raw.dropoff_lat,
            passenger_count: raw.passenger_count,
            trip_time_in_seconds: raw.trip_time_in_seconds,
            trip_distance_in_miles: raw.trip_distance_in_miles,
            rate_code: raw.rate_code,
            store_and_forward_flag: raw.store_and_forward_flag,
            pickup_neighborhood,
            dropoff_neighborhood,
        })
    }
}

/// Default fare stream column order, matching the upstream dataset.
pub const FARE_COLUMNS: &[&str] = &[
    "medallion",
    "hack_license",
    "vendor_id",
    "pickup_datetime",
    "payment_type",
    "fare_amount",
    "surcharge",
    "mta_tax",
    "tip_amount",
    "tolls_amount",
    "total_amount",
];

/// Decodes one delimited fare row per message, mapping fields by the header
/// row the decoder was constructed with.
pub struct FareDecoder {
    columns: HashMap<String, usize>,
}

impl FareDecoder {
    /// Decoder for the canonical [`FARE_COLUMNS`] order.
    pub fn new() -> Self {
        Self::with_header(FARE_COLUMNS)
    }

    /// Decoder for a stream whose header row declares a different column
    /// order.
    pub fn with_header(header: &[&str]) -> Self {
        let columns = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        Self { columns }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<FareRecord, DecodeError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(payload);
        let row = match reader.records().next() {
            Some(Ok(row)) => row,
            Some(Err(e)) => return Err(DecodeError::Malformed(e.to_string())),
            None => return Err(DecodeError::Malformed("empty payload".to_string())),
        };

        // A stray header row is malformed data, not a timestamp failure.
        if self.field(&row, "medallion")? == "medallion" {
            return Err(DecodeError::Malformed("header row in data".to_string()));
        }

        let pickup_time = parse_event_time(self.field(&row, "pickup_datetime")?.trim())?;

        Ok(FareRecord {
            medallion: self.field(&row, "medallion")?.trim().to_string(),
            hack_license: self.field(&row, "hack_license")?.trim().to_string(),
            vendor_id: self.field(&row, "vendor_id")?.trim().to_string(),
            pickup_time,
            payment_type: self.field(&row, "payment_type")?.trim().to_string(),
            fare_amount: self.amount(&row, "fare_amount")?,
            surcharge: self.amount(&row, "surcharge")?,
            mta_tax: self.amount(&row, "mta_tax")?,
            tip_amount: self.amount(&row, "tip_amount")?,
            tolls_amount: self.amount(&row, "tolls_amount")?,
            total_amount: self.amount(&row, "total_amount")?,
        })
    }

    fn field<'a>(&self, row: &'a csv::StringRecord, name: &str) -> Result<&'a str, DecodeError> {
        let idx = self
            .columns
            .get(name)
            .ok_or_else(|| DecodeError::Malformed(format!("column '{name}' not in header")))?;
        row.get(*idx)
            .ok_or_else(|| DecodeError::Malformed(format!("row missing field '{name}'")))
    }

    fn amount(&self, row: &csv::StringRecord, name: &str) -> Result<f64, DecodeError> {
        let raw = self.field(row, name)?.trim();
        raw.parse::<f64>()
            .map_err(|_| DecodeError::Malformed(format!("field '{name}' is not a number: '{raw}'")))
    }
}

impl Default for FareDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Arc<GeoResolver> {
        let json = r#"[
            {"name": "Midtown", "polygon": [[-74.0, 40.7], [-73.9, 40.7], [-73.9, 40.8], [-74.0, 40.8]]}
        ]"#;
        Arc::new(GeoResolver::from_json(json.as_bytes()).unwrap())
    }

    const RIDE_JSON: &str = r#"{
        "medallion": "M1",
        "hackLicense": "H1",
        "vendorId": "VTS",
        "pickupTime": "2013-01-01 00:02:00",
        "dropoffTime": "2013-01-01 00:12:00",
        "pickupLon": -73.95,
        "pickupLat": 40.75,
        "dropoffLon": -73.85,
        "dropoffLat": 40.65,
        "passengerCount": 2,
        "tripTimeInSeconds": 600,
        "tripDistanceInMiles": 2.4,
        "rateCode": "1",
        "storeAndForwardFlag": "N"
    }"#;

    #[test]
    fn test_decode_valid_ride() {
        let decoder = RideDecoder::new(geo());
        let ride = decoder.decode(RIDE_JSON.as_bytes()).unwrap();

        assert_eq!(ride.medallion, "M1");
        assert_eq!(ride.vendor_id, "VTS");
        assert_eq!(ride.passenger_count, 2);
        assert_eq!(ride.pickup_time, parse_event_time("2013-01-01 00:02:00").unwrap());
        assert_eq!(ride.pickup_neighborhood, "Midtown");
        // Dropoff is outside the configured region.
        assert_eq!(ride.dropoff_neighborhood, "Unresolved");
    }

    #[test]
    fn test_decode_ride_missing_field() {
        let decoder = RideDecoder::new(geo());
        let err = decoder
            .decode(br#"{"medallion": "M1"}"#)
            .unwrap_err();
        assert_eq!(err.reason(), "decode error");
    }

    #[test]
    fn test_decode_ride_mistyped_field() {
        let bad = RIDE_JSON.replace("\"passengerCount\": 2", "\"passengerCount\": \"two\"");
        let decoder = RideDecoder::new(geo());
        let err = decoder.decode(bad.as_bytes()).unwrap_err();
        assert_eq!(err.reason(), "decode error");
    }

    #[test]
    fn test_decode_ride_bad_timestamp_is_decode_error() {
        // Ride timestamps fail as schema errors, not timestamp errors.
        let bad = RIDE_JSON.replace("2013-01-01 00:02:00", "not-a-date");
        let decoder = RideDecoder::new(geo());
        let err = decoder.decode(bad.as_bytes()).unwrap_err();
        assert_eq!(err.reason(), "decode error");
    }

    #[test]
    fn test_decode_ride_not_json() {
        let decoder = RideDecoder::new(geo());
        assert!(decoder.decode(b"\xff\xfe").is_err());
    }

    const FARE_ROW: &str = "M1,H1,VTS,2013-01-01 00:02:00,CRD,10.0,0.5,0.5,2.0,0.0,13.0";

    #[test]
    fn test_decode_valid_fare() {
        let decoder = FareDecoder::new();
        let fare = decoder.decode(FARE_ROW.as_bytes()).unwrap();

        assert_eq!(fare.medallion, "M1");
        assert_eq!(fare.payment_type, "CRD");
        assert_eq!(fare.fare_amount, 10.0);
        assert_eq!(fare.tip_amount, 2.0);
        assert_eq!(fare.total_amount, 13.0);
        assert_eq!(fare.pickup_time, parse_event_time("2013-01-01 00:02:00").unwrap());
    }

    #[test]
    fn test_decode_fare_bad_timestamp() {
        let row = FARE_ROW.replace("2013-01-01 00:02:00", "not-a-date");
        let decoder = FareDecoder::new();
        let err = decoder.decode(row.as_bytes()).unwrap_err();
        assert_eq!(err.reason(), "timestamp parse error");
    }

    #[test]
    fn test_decode_fare_short_row() {
        let decoder = FareDecoder::new();
        let err = decoder.decode(b"M1,H1,VTS").unwrap_err();
        assert_eq!(err.reason(), "decode error");
    }

    #[test]
    fn test_decode_fare_non_numeric_amount() {
        let row = FARE_ROW.replace(",10.0,", ",ten,");
        let decoder = FareDecoder::new();
        let err = decoder.decode(row.as_bytes()).unwrap_err();
        assert_eq!(err.reason(), "decode error");
    }

    #[test]
    fn test_decode_fare_header_row_rejected() {
        let header = FARE_COLUMNS.join(",");
        let decoder = FareDecoder::new();
        let err = decoder.decode(header.as_bytes()).unwrap_err();
        assert_eq!(err.reason(), "decode error");
    }

    #[test]
    fn test_decode_fare_reordered_header() {
        let decoder = FareDecoder::with_header(&[
            "pickup_datetime",
            "medallion",
            "hack_license",
            "vendor_id",
            "payment_type",
            "fare_amount",
            "surcharge",
            "mta_tax",
            "tip_amount",
            "tolls_amount",
            "total_amount",
        ]);
        let fare = decoder
            .decode(b"2013-01-01 00:02:00,M1,H1,VTS,CSH,7.5,0.0,0.5,0.0,0.0,8.0")
            .unwrap();
        assert_eq!(fare.medallion, "M1");
        assert_eq!(fare.fare_amount, 7.5);
    }

    #[test]
    fn test_decode_fare_empty_payload() {
        let decoder = FareDecoder::new();
        let err = decoder.decode(b"").unwrap_err();
        assert_eq!(err.reason(), "decode error");
    }
}
