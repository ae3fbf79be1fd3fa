//! # Telemetry Export Pipeline Demo
//!
//! An end-to-end run of the pipeline against a simulated, unreliable backend.
//!
//! ## What it does
//!
//! ### 1. Registration
//! - Registers a `video_size` metric (bytes, distribution with bucket
//!   boundaries at 64 KiB and 4 GiB) and a cumulative `video_size_cum` view
//!   keyed by the `codec` tag.
//!
//! ### 2. Producers
//! - N concurrent tasks, each processing videos in a loop: start a
//!   `ProcessVideo` span, record the video's size with the span context
//!   attached as an exemplar, end the span.
//!
//! ### 3. Export
//! - Bundles close on count (10 000 items) or age (2s).
//! - `SimulatedBackend` fails a configurable share of requests with a
//!   retryable error and adds latency to the rest.
//! - The exporter retries with exponential backoff through a bounded worker pool.
//! - Self-monitoring records per-request statistics into the same registry.
//!
//! ### 4. Graceful shutdown
//! - `stop()` flushes every view and buffered span and drains in-flight
//!   exports within the shutdown timeout, then the counter snapshot is printed.
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (4 producers, 25 videos each)
//! cargo run -p telemetry_export --bin demo --release -- --quick
//!
//! # Flaky backend
//! cargo run -p telemetry_export --bin demo --release -- --failure-rate 0.4
//!
//! # Config from file, debug logs
//! RUST_LOG=telemetry_export=debug cargo run -p telemetry_export --bin demo -- --config pipeline.json
//! ```

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry_export::{
    Aggregation, AttributeValue, Bundle, Delivery, EnvResource, Measurement, MetricDefinition,
    MetricsSnapshot, Pipeline, PipelineConfig, SpanKind, SpanStatus, Transport, TransportError,
    Unit, ViewDefinition,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VIDEO_SIZE_METRIC: &str = "video_size";
const VIDEO_SIZE_VIEW: &str = "video_size_cum";
const CODECS: [&str; 3] = ["h264", "vp9", "av1"];

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "demo", about = "Telemetry export pipeline demo")]
struct Args {
    /// Concurrent producer tasks
    #[arg(short, long, default_value_t = 8)]
    producers: usize,

    /// Videos processed per producer
    #[arg(short, long, default_value_t = 100)]
    iterations: usize,

    /// Share of export requests the simulated backend fails (0.0..=1.0)
    #[arg(long, default_value_t = 0.15)]
    failure_rate: f64,

    /// Simulated backend latency per request
    #[arg(long, default_value_t = 5)]
    latency_ms: u64,

    /// JSON pipeline configuration; overrides the demo defaults
    #[arg(short, long, env = "TELEMETRY_EXPORT_CONFIG")]
    config: Option<PathBuf>,

    /// 4 producers, 25 videos each
    #[arg(long)]
    quick: bool,

    /// Log every bundle the backend accepts
    #[arg(short, long)]
    verbose: bool,
}

// =============================================================================
// SIMULATED BACKEND
// =============================================================================

/// A transport with a configurable failure rate and latency.
struct SimulatedBackend {
    failure_rate: f64,
    latency: Duration,
    verbose: bool,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl SimulatedBackend {
    fn new(failure_rate: f64, latency: Duration, verbose: bool) -> Self {
        Self {
            failure_rate,
            latency,
            verbose,
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> (u64, u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.successes.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

impl Transport for SimulatedBackend {
    async fn send(&self, bundle: &Bundle) -> Result<Delivery, TransportError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let fail = rand::thread_rng().gen::<f64>() < self.failure_rate;

        tokio::time::sleep(self.latency).await;

        if fail {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Unavailable(format!(
                "simulated backend failure (bundle #{}, {} items)",
                bundle.sequence,
                bundle.len()
            )));
        }

        self.successes.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            info!(
                sequence = bundle.sequence,
                kind = bundle.payload.kind(),
                items = bundle.len(),
                bytes = bundle.byte_size,
                reason = ?bundle.close_reason,
                "backend accepted bundle"
            );
        }
        Ok(Delivery::all(bundle.len()))
    }

    fn name(&self) -> &str {
        "simulated-backend"
    }
}

// =============================================================================
// MAIN APPLICATION
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let (producers, iterations) = if args.quick {
        (4, 25)
    } else {
        (args.producers, args.iterations)
    };

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading pipeline config from {}", path.display()))?,
        None => PipelineConfig::default()
            .with_bundle_delay_threshold(Duration::from_secs(2))
            .with_bundle_count_threshold(10_000)
            .with_max_buffer_bytes(20 * 1024 * 1024)
            .with_trace_sample_ratio(1.0),
    };
    info!(producers, iterations, failure_rate = args.failure_rate, "starting demo");

    // =========================================================================
    // PHASE 1: Build the pipeline
    // =========================================================================

    let backend = Arc::new(SimulatedBackend::new(
        args.failure_rate,
        Duration::from_millis(args.latency_ms),
        args.verbose,
    ));
    let pipeline = Pipeline::builder(config)
        .with_shared_transport(Arc::clone(&backend) as _)
        .with_resource(EnvResource::default())
        .with_self_monitoring(true)
        .build()
        .context("building pipeline")?;

    pipeline.registry().register_metric(MetricDefinition::new(
        VIDEO_SIZE_METRIC,
        "processed video size",
        Unit::Bytes,
        Aggregation::distribution(vec![65536.0, 4294967296.0]),
    ))?;
    pipeline.registry().register_view(
        ViewDefinition::new(VIDEO_SIZE_VIEW, VIDEO_SIZE_METRIC)
            .with_description("processed video size over time")
            .with_tag_keys(["codec"]),
    )?;

    pipeline.start()?;
    let pipeline = Arc::new(pipeline);

    // =========================================================================
    // PHASE 2: Producers
    // =========================================================================

    let start = Instant::now();
    let mut handles = Vec::with_capacity(producers);
    for producer_id in 0..producers {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            run_producer(producer_id, iterations, &pipeline).await
        }));
    }

    let mut processed = 0u64;
    for (id, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(count) => processed += count,
            Err(e) => warn!(producer = id, error = %e, "producer panicked"),
        }
    }
    let generation_time = start.elapsed();
    info!(processed, elapsed = ?generation_time, "all producers finished");

    // =========================================================================
    // PHASE 3: Graceful shutdown
    // =========================================================================

    let report = pipeline.stop().await?;
    info!(
        flushed = report.flushed,
        drained = report.drained,
        abandoned = report.abandoned,
        "pipeline stopped"
    );

    // =========================================================================
    // PHASE 4: Final statistics
    // =========================================================================

    print_summary(&pipeline.metrics_snapshot(), backend.stats(), start.elapsed())?;
    Ok(())
}

// =============================================================================
// PRODUCER IMPLEMENTATION
// =============================================================================

async fn run_producer(producer_id: usize, iterations: usize, pipeline: &Pipeline) -> u64 {
    let mut processed = 0;
    for i in 0..iterations {
        let codec = CODECS[(producer_id + i) % CODECS.len()];
        let size = rand::thread_rng().gen_range(1u64..=1 << 33);

        let mut span = pipeline.start_span("ProcessVideo", SpanKind::Internal);
        span.set_attribute("video.codec", AttributeValue::String(codec.to_string()));
        span.set_attribute("video.size", AttributeValue::Int(size as i64));
        span.set_attribute("producer.id", AttributeValue::Int(producer_id as i64));

        pipeline.record_in_span(
            Measurement::new(VIDEO_SIZE_METRIC, size as f64).with_tag("codec", codec),
            &span.context(),
        );

        tokio::time::sleep(Duration::from_millis((i % 5) as u64 + 1)).await;

        let status = if i % 20 == 19 {
            span.set_attribute("error.message", AttributeValue::String("transcode failed".to_string()));
            SpanStatus::Error
        } else {
            SpanStatus::Ok
        };
        if let Err(e) = pipeline.end_span(span, status) {
            warn!(producer = producer_id, error = %e, "span dropped");
        }
        processed += 1;
    }
    processed
}

fn print_summary(
    snapshot: &MetricsSnapshot,
    (requests, successes, failures): (u64, u64, u64),
    elapsed: Duration,
) -> anyhow::Result<()> {
    println!("\nPipeline counters after {:.2?}:", elapsed);
    println!("{}", serde_json::to_string_pretty(snapshot)?);

    if requests > 0 {
        println!("\nBackend requests: {}", requests);
        println!("   Successful: {} ({:.1}%)", successes, 100.0 * successes as f64 / requests as f64);
        println!("   Failed:     {} ({:.1}%)", failures, 100.0 * failures as f64 / requests as f64);
    }
    Ok(())
}
