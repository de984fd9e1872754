//! CLI entry point for the taxi trip statistics pipeline.
//!
//! `run` executes the full pipeline (decode, enrich, join, window, sink);
//! `resolve` is a one-shot geometry lookup for operational debugging.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use taxi_trip_stats::config::PipelineConfig;
use taxi_trip_stats::geo::GeoResolver;
use taxi_trip_stats::infra::secrets::{EnvSecretStore, FileSecretStore, SecretStore};
use taxi_trip_stats::pipeline;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "taxi_trip_stats")]
#[command(about = "Correlates taxi ride and fare streams into windowed neighborhood statistics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until the sources are exhausted or ctrl-c
    Run(RunArgs),
    /// Resolve a coordinate pair against the region geometry
    Resolve {
        /// Geometry source (file path or URL)
        #[arg(long)]
        geometry: String,

        /// Longitude
        lon: f64,

        /// Latitude
        lat: f64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Ride stream source: newline-delimited JSON messages
    #[arg(long, default_value = "data/rides.jsonl")]
    ride_source: String,

    /// Fare stream source: newline-delimited rows
    #[arg(long, default_value = "data/fares.csv")]
    fare_source: String,

    /// Region geometry source (file path or URL)
    #[arg(long, default_value = "regions.json")]
    geometry: String,

    /// Consumer group identity for the ride stream
    #[arg(long, default_value = "ride-aggregator")]
    ride_consumer_group: String,

    /// Consumer group identity for the fare stream
    #[arg(long, default_value = "fare-aggregator")]
    fare_consumer_group: String,

    /// File holding committed read positions per consumer group
    #[arg(long, default_value = "offsets.json")]
    offsets: PathBuf,

    /// Allowed lateness for the ride stream, in seconds
    #[arg(long, default_value_t = 30)]
    ride_lateness_secs: u64,

    /// Allowed lateness for the fare stream, in seconds
    #[arg(long, default_value_t = 30)]
    fare_lateness_secs: u64,

    /// Tumbling window length, in seconds
    #[arg(long, default_value_t = 300)]
    window_secs: u64,

    /// Sink: s3://bucket/prefix or a local directory
    #[arg(long, default_value = "out/aggregates")]
    sink: String,

    /// Aggregates per sink write
    #[arg(long, default_value_t = 16)]
    sink_batch_size: usize,

    /// Concurrent writes per sink batch
    #[arg(long, default_value_t = 4)]
    sink_write_concurrency: usize,

    /// Retries per sink batch before the pipeline gives up
    #[arg(long, default_value_t = 5)]
    sink_max_retries: u32,

    /// Base backoff between sink retries, in milliseconds
    #[arg(long, default_value_t = 500)]
    sink_retry_backoff_ms: u64,

    /// Bound on records in flight between ingest and the joiner
    #[arg(long, default_value_t = 1024)]
    channel_capacity: usize,

    /// Seconds between counter log lines
    #[arg(long, default_value_t = 60)]
    metrics_interval_secs: u64,

    /// Secret scope for resolving *-secret options
    #[arg(long)]
    secret_scope: Option<String>,

    /// JSON secrets file; when absent, secrets resolve from the environment
    #[arg(long)]
    secrets_file: Option<String>,

    /// Secret name holding the ride source
    #[arg(long)]
    ride_source_secret: Option<String>,

    /// Secret name holding the fare source
    #[arg(long)]
    fare_source_secret: Option<String>,

    /// Secret name holding the sink spec
    #[arg(long)]
    sink_secret: Option<String>,
}

impl RunArgs {
    /// Builds the immutable pipeline configuration, resolving any values
    /// supplied via the secrets provider.
    async fn into_config(self) -> Result<PipelineConfig> {
        let wants_secrets = self.ride_source_secret.is_some()
            || self.fare_source_secret.is_some()
            || self.sink_secret.is_some();

        let mut ride_source = self.ride_source;
        let mut fare_source = self.fare_source;
        let mut sink = self.sink;

        if wants_secrets {
            let Some(scope) = self.secret_scope.as_deref() else {
                bail!("--secret-scope is required when a *-secret option is used");
            };
            let store: Box<dyn SecretStore> = match self.secrets_file.as_deref() {
                Some(path) => Box::new(FileSecretStore::load(path)?),
                None => Box::new(EnvSecretStore),
            };
            if let Some(name) = &self.ride_source_secret {
                ride_source = store.get(scope, name).await?;
            }
            if let Some(name) = &self.fare_source_secret {
                fare_source = store.get(scope, name).await?;
            }
            if let Some(name) = &self.sink_secret {
                sink = store.get(scope, name).await?;
            }
        }

        Ok(PipelineConfig {
            ride_source,
            fare_source,
            ride_consumer_group: self.ride_consumer_group,
            fare_consumer_group: self.fare_consumer_group,
            offsets_path: self.offsets,
            geometry_source: self.geometry,
            ride_lateness_secs: self.ride_lateness_secs,
            fare_lateness_secs: self.fare_lateness_secs,
            window_secs: self.window_secs,
            sink,
            sink_batch_size: self.sink_batch_size,
            sink_write_concurrency: self.sink_write_concurrency,
            sink_max_retries: self.sink_max_retries,
            sink_retry_backoff: Duration::from_millis(self.sink_retry_backoff_ms),
            channel_capacity: self.channel_capacity,
            metrics_interval: Duration::from_secs(self.metrics_interval_secs),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/taxi_trip_stats.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("taxi_trip_stats.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let cfg = args.into_config().await?;
            let snapshot = pipeline::run(cfg).await?;
            info!(
                windows_emitted = snapshot.windows_emitted,
                malformed_rides = snapshot.malformed_rides,
                malformed_fares = snapshot.malformed_fares,
                "run complete"
            );
        }
        Commands::Resolve { geometry, lon, lat } => {
            let geo = GeoResolver::load(&geometry)
                .await
                .context("loading geometry")?;
            let region = geo.resolve(lon, lat);
            info!(lon, lat, region, "resolved");
            println!("{region}");
        }
    }

    Ok(())
}
