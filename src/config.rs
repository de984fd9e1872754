//! Pipeline configuration: supplied once at process start, validated, and
//! immutable thereafter. A validation failure is a startup error; the
//! pipeline does not run on a bad configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

/// Where finalized aggregates are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkLocation {
    /// `s3://bucket/prefix`
    S3 { bucket: String, prefix: String },
    /// Local directory path.
    LocalDir(PathBuf),
}

impl SinkLocation {
    /// Parses a sink spec: `s3://bucket[/prefix]` or a directory path.
    pub fn parse(spec: &str) -> Result<Self> {
        if let Some(rest) = spec.strip_prefix("s3://") {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                bail!("sink spec '{spec}' has an empty bucket name");
            }
            return Ok(SinkLocation::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            });
        }
        if spec.is_empty() {
            bail!("sink spec is empty");
        }
        Ok(SinkLocation::LocalDir(PathBuf::from(spec)))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ride stream source (newline-delimited JSON messages).
    pub ride_source: String,
    /// Fare stream source (delimited rows).
    pub fare_source: String,
    pub ride_consumer_group: String,
    pub fare_consumer_group: String,
    /// JSON file holding committed read positions per consumer group.
    pub offsets_path: PathBuf,
    /// Region geometry, a file path or URL.
    pub geometry_source: String,
    /// Allowed lateness per stream, in seconds.
    pub ride_lateness_secs: u64,
    pub fare_lateness_secs: u64,
    /// Tumbling window length, in seconds.
    pub window_secs: u64,
    /// Sink spec, see [`SinkLocation::parse`].
    pub sink: String,
    pub sink_batch_size: usize,
    pub sink_write_concurrency: usize,
    pub sink_max_retries: u32,
    pub sink_retry_backoff: Duration,
    /// Bound on records in flight between ingest and the joiner.
    pub channel_capacity: usize,
    pub metrics_interval: Duration,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ride_source.is_empty() {
            bail!("ride source is not configured");
        }
        if self.fare_source.is_empty() {
            bail!("fare source is not configured");
        }
        if self.geometry_source.is_empty() {
            bail!("geometry source is not configured");
        }
        if self.window_secs == 0 {
            bail!("window interval must be at least one second");
        }
        if self.sink_batch_size == 0 {
            bail!("sink batch size must be at least 1");
        }
        if self.sink_write_concurrency == 0 {
            bail!("sink write concurrency must be at least 1");
        }
        if self.channel_capacity == 0 {
            bail!("channel capacity must be at least 1");
        }
        // Parse failure surfaces the bad spec before any task starts.
        SinkLocation::parse(&self.sink)?;
        Ok(())
    }

    pub fn sink_location(&self) -> Result<SinkLocation> {
        SinkLocation::parse(&self.sink)
    }
}
