//! Pipeline orchestration.
//!
//! Two ingest tasks (ride, fare) decode their streams and feed a bounded
//! channel; a single joiner task owns the join and window state (so no
//! aggregation state is ever touched concurrently); a sink task batches and
//! writes finalized aggregates. Shutdown stops intake, flushes windows the
//! watermark has already passed, and drops the rest. Read positions are
//! committed only after the sink task has finished successfully, so a
//! failed run never advances past data whose aggregates were not written;
//! the restart re-processes it and the idempotent upserts absorb the
//! repeats.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::{PipelineConfig, SinkLocation};
use crate::decode::{FareDecoder, RideDecoder};
use crate::geo::GeoResolver;
use crate::join::WatermarkedJoin;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::records::{FareRecord, RideRecord, WindowAggregate};
use crate::sink::{AggregateSink, LocalDirSink, S3Sink, SinkWriter};
use crate::source::{FileSource, OffsetStore, StreamSource};
use crate::window::WindowAggregator;

enum JoinInput {
    Ride(RideRecord),
    Fare(FareRecord),
}

/// Runs the pipeline until both sources are exhausted or a shutdown signal
/// arrives. Returns the final counter snapshot.
pub async fn run(cfg: PipelineConfig) -> Result<MetricsSnapshot> {
    cfg.validate().context("invalid pipeline configuration")?;

    let metrics = Arc::new(PipelineMetrics::default());
    let geo = Arc::new(
        GeoResolver::load(&cfg.geometry_source)
            .await
            .context("geometry source unavailable")?,
    );
    let sink = build_sink(&cfg).await?;

    let offsets = OffsetStore::new(&cfg.offsets_path);
    let ride_position = offsets.position(&cfg.ride_consumer_group)?;
    let fare_position = offsets.position(&cfg.fare_consumer_group)?;
    let ride_source = FileSource::open(&cfg.ride_source, ride_position).await?;
    let fare_source = FileSource::open(&cfg.fare_source, fare_position).await?;

    let (join_tx, join_rx) = mpsc::channel::<JoinInput>(cfg.channel_capacity);
    let (agg_tx, agg_rx) = mpsc::channel::<WindowAggregate>(cfg.channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown signal received, stopping intake");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    let ride_task = {
        let decoder = RideDecoder::new(geo.clone());
        let metrics = metrics.clone();
        tokio::spawn(
            ingest(
                Box::new(ride_source),
                shutdown_rx.clone(),
                join_tx.clone(),
                move |payload| match decoder.decode(payload) {
                    Ok(ride) => Some(JoinInput::Ride(ride)),
                    Err(e) => {
                        metrics.record_malformed_ride();
                        debug!(error = %e, "ride payload dropped");
                        None
                    }
                },
            )
            .instrument(info_span!("ingest", stream = "ride")),
        )
    };

    let fare_task = {
        let decoder = FareDecoder::new();
        let metrics = metrics.clone();
        tokio::spawn(
            ingest(
                Box::new(fare_source),
                shutdown_rx,
                join_tx,
                move |payload| match decoder.decode(payload) {
                    Ok(fare) => Some(JoinInput::Fare(fare)),
                    Err(e) => {
                        metrics.record_malformed_fare();
                        debug!(error = %e, "fare payload dropped");
                        None
                    }
                },
            )
            .instrument(info_span!("ingest", stream = "fare")),
        )
    };

    let joiner_task = {
        let join = WatermarkedJoin::new(
            cfg.ride_lateness_secs,
            cfg.fare_lateness_secs,
            metrics.clone(),
        );
        let windows = WindowAggregator::new(cfg.window_secs, metrics.clone());
        tokio::spawn(run_joiner(join_rx, join, windows, agg_tx).instrument(info_span!("joiner")))
    };

    let sink_task = {
        let writer = SinkWriter::new(
            sink,
            cfg.sink_batch_size,
            cfg.sink_max_retries,
            cfg.sink_retry_backoff,
        );
        tokio::spawn(run_sink(agg_rx, writer).instrument(info_span!("sink")))
    };

    let metrics_task = {
        let metrics = metrics.clone();
        let interval = cfg.metrics_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_snapshot(&metrics.snapshot(), "pipeline counters");
            }
        })
    };

    let ride_result = ride_task.await.context("ride ingest task panicked")?;
    let fare_result = fare_task.await.context("fare ingest task panicked")?;
    let joiner_result = joiner_task.await.context("joiner task panicked")?;
    let sink_result = sink_task.await.context("sink task panicked")?;
    metrics_task.abort();

    let snapshot = metrics.snapshot();
    log_snapshot(&snapshot, "pipeline finished");

    // Sink first: a dead sink is the root cause of every upstream abort.
    sink_result.context("sink writer failed")?;
    joiner_result?;
    let ride_intake = ride_result.context("ride ingest failed")?;
    let fare_intake = fare_result.context("fare ingest failed")?;

    // Only now is everything the run produced durable, so committing the
    // read positions cannot strand unwritten aggregates.
    if let Some(next) = ride_intake.next_offset {
        offsets.commit(&cfg.ride_consumer_group, next)?;
    }
    if let Some(next) = fare_intake.next_offset {
        offsets.commit(&cfg.fare_consumer_group, next)?;
    }
    info!(
        rides_ingested = ride_intake.processed,
        fares_ingested = fare_intake.processed,
        "all tasks completed, read positions committed"
    );

    Ok(snapshot)
}

async fn build_sink(cfg: &PipelineConfig) -> Result<Arc<dyn AggregateSink>> {
    match cfg.sink_location()? {
        SinkLocation::S3 { bucket, prefix } => {
            info!(bucket = %bucket, prefix = %prefix, "using S3 sink");
            let aws = aws_config::load_from_env().await;
            let client = aws_sdk_s3::Client::new(&aws);
            Ok(Arc::new(S3Sink::new(
                client,
                bucket,
                prefix,
                cfg.sink_write_concurrency,
            )))
        }
        SinkLocation::LocalDir(dir) => {
            info!(dir = %dir.display(), "using local directory sink");
            Ok(Arc::new(LocalDirSink::new(dir)))
        }
    }
}

/// What one ingest task consumed: the message count and the position to
/// commit once the run's output is durable.
struct IngestOutcome {
    processed: u64,
    next_offset: Option<u64>,
}

/// Reads one stream to exhaustion (or shutdown), decoding each message and
/// handing survivors to the joiner. Never commits read positions itself;
/// it reports the position to commit and the orchestrator commits it after
/// the sink has succeeded.
async fn ingest<F>(
    mut source: Box<dyn StreamSource>,
    mut shutdown: watch::Receiver<bool>,
    tx: mpsc::Sender<JoinInput>,
    mut decode: F,
) -> Result<IngestOutcome>
where
    F: FnMut(&[u8]) -> Option<JoinInput> + Send,
{
    let mut processed = 0u64;
    let mut last_offset: Option<u64> = None;

    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!(processed, "intake stopped by shutdown");
                break;
            }
            msg = source.next_message() => msg?,
        };
        let Some(msg) = msg else {
            info!(processed, "stream exhausted");
            break;
        };

        last_offset = Some(msg.offset);
        processed += 1;

        if let Some(input) = decode(&msg.payload) {
            if tx.send(input).await.is_err() {
                // Joiner is gone; report no position so nothing read here
                // is ever marked as processed.
                warn!(processed, "joiner stopped, abandoning intake");
                return Ok(IngestOutcome {
                    processed,
                    next_offset: None,
                });
            }
        }
    }

    Ok(IngestOutcome {
        processed,
        next_offset: last_offset.map(|offset| offset + 1),
    })
}

/// Single-writer actor over the join and window state.
async fn run_joiner(
    mut rx: mpsc::Receiver<JoinInput>,
    mut join: WatermarkedJoin,
    mut windows: WindowAggregator,
    agg_tx: mpsc::Sender<WindowAggregate>,
) -> Result<()> {
    while let Some(input) = rx.recv().await {
        let joined = match input {
            JoinInput::Ride(ride) => join.offer_ride(ride),
            JoinInput::Fare(fare) => join.offer_fare(fare),
        };
        if let Some(trip) = joined {
            windows.observe(&trip);
        }
        if let Some(watermark) = join.combined_watermark() {
            for agg in windows.finalize_up_to(watermark) {
                agg_tx
                    .send(agg)
                    .await
                    .map_err(|_| anyhow!("sink task stopped while joiner was running"))?;
            }
        }
    }

    // Intake closed: flush whatever the watermark has already passed, then
    // drop the rest.
    if let Some(watermark) = join.combined_watermark() {
        for agg in windows.finalize_up_to(watermark) {
            agg_tx
                .send(agg)
                .await
                .map_err(|_| anyhow!("sink task stopped while joiner was draining"))?;
        }
    }
    info!(
        unmatched_rides = join.buffered_rides(),
        unmatched_fares = join.buffered_fares(),
        open_windows = windows.open_windows(),
        "joiner drained, remaining buffered state dropped"
    );
    Ok(())
}

async fn run_sink(mut rx: mpsc::Receiver<WindowAggregate>, mut writer: SinkWriter) -> Result<()> {
    while let Some(agg) = rx.recv().await {
        writer.push(agg).await?;
    }
    writer.flush().await?;
    Ok(())
}

fn log_snapshot(s: &MetricsSnapshot, message: &str) {
    info!(
        malformed_rides = s.malformed_rides,
        malformed_fares = s.malformed_fares,
        unmatched_rides = s.unmatched_rides,
        unmatched_fares = s.unmatched_fares,
        duplicate_buffered = s.duplicate_buffered,
        late_trips = s.late_trips,
        windows_emitted = s.windows_emitted,
        avg_emit_latency_ms = s.avg_emit_latency_ms,
        "{message}",
    );
}
