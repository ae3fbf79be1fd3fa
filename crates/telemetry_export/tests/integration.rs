use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_export::{
    Aggregation, AggregationData, Bundle, Delivery, JsonFileTransport, Measurement, MetricDefinition,
    Payload, Pipeline, PipelineConfig, SchedulerState, SpanKind, SpanStatus, Transport,
    TransportBoxed, TransportError, Unit, ViewDefinition,
};
use tokio::time::Instant;

/// Records every bundle it accepts; fails the first `fail_first` requests.
struct RecordingTransport {
    fail_first: usize,
    calls: AtomicUsize,
    bundles: Mutex<Vec<Bundle>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self::failing(0)
    }

    fn failing(fail_first: usize) -> Self {
        Self {
            fail_first,
            calls: AtomicUsize::new(0),
            bundles: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bundles(&self) -> Vec<Bundle> {
        self.bundles.lock().unwrap().clone()
    }

    fn span_count(&self) -> usize {
        self.bundles()
            .iter()
            .filter(|b| matches!(b.payload, Payload::Spans(_)))
            .map(Bundle::len)
            .sum()
    }
}

impl Transport for RecordingTransport {
    async fn send(&self, bundle: &Bundle) -> Result<Delivery, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(TransportError::Unavailable(format!("attempt {} refused", call + 1)));
        }
        self.bundles.lock().unwrap().push(bundle.clone());
        Ok(Delivery::all(bundle.len()))
    }

    fn name(&self) -> &str {
        "recording"
    }
}

fn build(config: PipelineConfig, transport: &Arc<RecordingTransport>) -> Pipeline {
    let pipeline = Pipeline::builder(config)
        .with_shared_transport(Arc::clone(transport) as Arc<dyn TransportBoxed>)
        .build()
        .unwrap();
    pipeline
        .registry()
        .register_metric(MetricDefinition::new("requests", "served requests", Unit::Dimensionless, Aggregation::Sum))
        .unwrap();
    pipeline
        .registry()
        .register_view(ViewDefinition::new("requests_total", "requests"))
        .unwrap();
    pipeline
}

fn exported_sum(bundles: &[Bundle], view: &str) -> Option<f64> {
    bundles.iter().rev().find_map(|b| match &b.payload {
        Payload::Metrics(series) => series.iter().find(|s| s.view == view).and_then(|s| match s.data {
            AggregationData::Sum(sum) => Some(sum),
            _ => None,
        }),
        Payload::Spans(_) => None,
    })
}

#[tokio::test]
async fn test_recorded_metrics_are_exported_on_stop() {
    let transport = Arc::new(RecordingTransport::new());
    let pipeline = build(PipelineConfig::default(), &transport);

    pipeline.start().unwrap();
    for _ in 0..10 {
        assert_eq!(pipeline.record(&Measurement::new("requests", 1.0)), 1);
    }
    let report = pipeline.stop().await.unwrap();

    assert_eq!(pipeline.state(), SchedulerState::Stopped);
    assert_eq!(report.abandoned, 0);
    assert_eq!(exported_sum(&transport.bundles(), "requests_total"), Some(10.0));

    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(snapshot.measurements_recorded_total, 10);
    assert_eq!(snapshot.bundles_exported_total, snapshot.bundles_submitted_total);
    assert_eq!(snapshot.dropped_bundles_total, 0);
}

#[tokio::test]
async fn test_unregistered_measurements_are_counted_not_exported() {
    let transport = Arc::new(RecordingTransport::new());
    let pipeline = build(PipelineConfig::default(), &transport);

    pipeline.start().unwrap();
    assert_eq!(pipeline.record(&Measurement::new("unknown", 1.0)), 0);
    pipeline.stop().await.unwrap();

    assert_eq!(pipeline.metrics_snapshot().unregistered_records_total, 1);
    assert!(transport.bundles().is_empty());
}

#[tokio::test]
async fn test_span_buffer_overflow_drops_and_counts() {
    let transport = Arc::new(RecordingTransport::new());
    let sizing = Pipeline::builder(PipelineConfig::default()).build().unwrap();
    let span_bytes = sizing.start_span("op", SpanKind::Internal).estimated_size();

    let config = PipelineConfig::default().with_max_buffer_bytes(span_bytes * 3);
    let pipeline = build(config, &transport);
    pipeline.start().unwrap();

    let results: Vec<_> = (0..5)
        .map(|_| pipeline.end_span(pipeline.start_span("op", SpanKind::Internal), SpanStatus::Ok))
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 2);

    pipeline.stop().await.unwrap();
    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(snapshot.spans_buffered_total, 3);
    assert_eq!(snapshot.dropped_spans_total, 2);
    assert_eq!(transport.span_count(), 3);
}

#[tokio::test]
async fn test_unsampled_spans_never_reach_the_transport() {
    let transport = Arc::new(RecordingTransport::new());
    let pipeline = build(PipelineConfig::default().with_trace_sample_ratio(0.0), &transport);
    pipeline.start().unwrap();

    for _ in 0..4 {
        let span = pipeline.start_span("op", SpanKind::Server);
        assert!(!span.sampled);
        pipeline.end_span(span, SpanStatus::Ok).unwrap();
    }
    pipeline.stop().await.unwrap();

    assert_eq!(pipeline.metrics_snapshot().spans_unsampled_total, 4);
    assert_eq!(transport.span_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_aged_spans_are_exported_without_flush() {
    let transport = Arc::new(RecordingTransport::new());
    let pipeline = build(PipelineConfig::default(), &transport);
    pipeline.start().unwrap();

    let parent = pipeline.start_span("request", SpanKind::Server);
    let child = pipeline.start_child_span(&parent.context(), "query", SpanKind::Client);
    pipeline.end_span(child, SpanStatus::Ok).unwrap();
    pipeline.end_span(parent, SpanStatus::Ok).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.span_count(), 2);

    pipeline.stop().await.unwrap();
    assert_eq!(transport.span_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let transport = Arc::new(RecordingTransport::failing(2));
    let config = PipelineConfig::default()
        .with_max_retry_attempts(3)
        .with_backoff(Duration::from_millis(10), Duration::from_secs(1), 2.0);
    let pipeline = build(config, &transport);

    pipeline.start().unwrap();
    pipeline.record(&Measurement::new("requests", 7.0));
    pipeline.stop().await.unwrap();

    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(transport.calls(), 3);
    assert_eq!(snapshot.export_retries_total, 2);
    assert_eq!(snapshot.export_failures_total, 2);
    assert_eq!(snapshot.bundles_exported_total, 1);
    assert_eq!(snapshot.dropped_bundles_total, 0);
    assert_eq!(exported_sum(&transport.bundles(), "requests_total"), Some(7.0));
}

#[tokio::test(start_paused = true)]
async fn test_retry_that_fits_the_shutdown_window_completes() {
    let transport = Arc::new(RecordingTransport::failing(1));
    let config = PipelineConfig::default()
        .with_backoff(Duration::from_millis(100), Duration::from_secs(1), 2.0)
        .with_shutdown_timeout(Duration::from_secs(2));
    let pipeline = build(config, &transport);

    pipeline.start().unwrap();
    pipeline.record(&Measurement::new("requests", 1.0));
    let report = pipeline.stop().await.unwrap();

    assert_eq!(report.abandoned, 0);
    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(snapshot.bundles_exported_total, 1);
    assert_eq!(snapshot.dropped_bundles_total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_past_the_shutdown_window_is_abandoned() {
    let transport = Arc::new(RecordingTransport::failing(usize::MAX));
    let config = PipelineConfig::default()
        .with_backoff(Duration::from_secs(5), Duration::from_secs(10), 2.0)
        .with_shutdown_timeout(Duration::from_secs(2));
    let pipeline = build(config, &transport);

    pipeline.start().unwrap();
    pipeline.record(&Measurement::new("requests", 1.0));

    let started = Instant::now();
    let report = pipeline.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2100));
    assert_eq!(report.abandoned, 1);
    assert_eq!(transport.calls(), 1);

    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(snapshot.bundles_exported_total, 0);
    assert_eq!(snapshot.dropped_bundles_total, 1);
    assert_eq!(pipeline.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn test_concurrent_producers_lose_no_updates() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 1_000;

    let transport = Arc::new(RecordingTransport::new());
    let pipeline = build(PipelineConfig::default(), &transport);
    pipeline.start().unwrap();

    std::thread::scope(|scope| {
        for producer in 0..PRODUCERS {
            let pipeline = &pipeline;
            scope.spawn(move || {
                for i in 0..PER_PRODUCER {
                    pipeline.record(&Measurement::new("requests", 1.0));
                    if i % 100 == 0 {
                        let span = pipeline.start_span(format!("producer-{}", producer), SpanKind::Producer);
                        pipeline.end_span(span, SpanStatus::Ok).unwrap();
                    }
                }
            });
        }
    });
    pipeline.stop().await.unwrap();

    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(snapshot.measurements_recorded_total, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(
        exported_sum(&transport.bundles(), "requests_total"),
        Some((PRODUCERS * PER_PRODUCER) as f64)
    );
    assert_eq!(transport.span_count(), PRODUCERS * PER_PRODUCER / 100);
}

#[tokio::test]
async fn test_bundles_keep_close_order() {
    let transport = Arc::new(RecordingTransport::new());
    let config = PipelineConfig::default()
        .with_bundle_count_threshold(2)
        .with_max_concurrent_exports(1);
    let pipeline = build(config, &transport);
    pipeline.start().unwrap();

    for _ in 0..5 {
        pipeline
            .end_span(pipeline.start_span("op", SpanKind::Internal), SpanStatus::Ok)
            .unwrap();
    }
    pipeline.flush().await.unwrap();
    pipeline.stop().await.unwrap();

    let sequences: Vec<u64> = transport.bundles().iter().map(|b| b.sequence).collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    assert_eq!(sequences, sorted);
    assert_eq!(transport.span_count(), 5);
}

#[tokio::test]
async fn test_flush_requires_running_pipeline() {
    let transport = Arc::new(RecordingTransport::new());
    let pipeline = build(PipelineConfig::default(), &transport);

    let err = pipeline.flush().await.unwrap_err();
    assert!(err.is_recoverable());

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.state(), SchedulerState::Stopped);
    assert!(pipeline.flush().await.is_err());
}

#[tokio::test]
async fn test_json_file_transport_writes_one_line_per_bundle() {
    let path = std::env::temp_dir().join(format!("telemetry-export-it-{}.jsonl", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let pipeline = Pipeline::builder(PipelineConfig::default())
        .with_transport(JsonFileTransport::new(&path))
        .build()
        .unwrap();
    pipeline
        .registry()
        .register_metric(MetricDefinition::new("latency", "", Unit::Milliseconds, Aggregation::distribution(vec![10.0, 100.0])))
        .unwrap();
    pipeline
        .registry()
        .register_view(ViewDefinition::new("latency_dist", "latency").with_tag_keys(["route"]))
        .unwrap();

    pipeline.start().unwrap();
    pipeline.record(&Measurement::new("latency", 42.0).with_tag("route", "/videos"));
    pipeline
        .end_span(pipeline.start_span("GET /videos", SpanKind::Server), SpanStatus::Ok)
        .unwrap();
    pipeline.stop().await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let _ = std::fs::remove_file(&path);

    assert_eq!(lines.len(), 2);
    let kinds: Vec<&str> = lines
        .iter()
        .map(|line| line["payload"]["kind"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"metrics"));
    assert!(kinds.contains(&"spans"));

    let metrics = lines.iter().find(|l| l["payload"]["kind"] == "metrics").unwrap();
    let series = &metrics["payload"]["items"][0];
    assert_eq!(series["view"], "latency_dist");
    assert_eq!(series["labels"]["route"], "/videos");
}
