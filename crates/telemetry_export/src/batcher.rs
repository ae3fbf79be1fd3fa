//! Turns view snapshots and buffered spans into bundles.
//!
//! The batcher is owned by the scheduler task and is only ever driven from
//! there, so it needs no locking of its own. Metrics and spans are bundled by
//! two independent [`Bundler`]s; sequence numbers are shared so that close
//! order is visible across both streams.

use crate::aggregator::Aggregator;
use crate::bundle::{Bundle, BundleConfig, Bundler, ClosedBatch, Payload, TimeSeries};
use crate::config::PipelineConfig;
use crate::invariants::debug_assert_sequence_monotonic;
use crate::resource::Resource;
use crate::span::Span;
use crate::span_buffer::SpanBuffer;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::trace;

pub struct Batcher {
    aggregator: Arc<Aggregator>,
    span_buffer: Arc<SpanBuffer>,
    metrics: Bundler<TimeSeries>,
    spans: Bundler<Span>,
    resource: Resource,
    flush_interval: Duration,
    last_snapshot: Option<Instant>,
    last_sequence: Option<u64>,
}

impl Batcher {
    pub fn new(
        aggregator: Arc<Aggregator>,
        span_buffer: Arc<SpanBuffer>,
        config: &PipelineConfig,
        resource: Resource,
    ) -> Self {
        let bundle_config = BundleConfig {
            count_threshold: config.bundle_count_threshold,
            byte_threshold: config.bundle_byte_threshold,
            delay_threshold: config.bundle_delay_threshold,
        };
        Self {
            aggregator,
            span_buffer,
            metrics: Bundler::new(bundle_config),
            spans: Bundler::new(bundle_config),
            resource,
            flush_interval: config.flush_interval,
            last_snapshot: None,
            last_sequence: None,
        }
    }

    /// Items waiting in open bundles (metrics, spans).
    pub fn pending(&self) -> (usize, usize) {
        (self.metrics.pending(), self.spans.pending())
    }

    /// One scheduler tick.
    ///
    /// Drains the span buffer, snapshots every view if `flush_interval` has
    /// passed since the last snapshot, and closes bundles that reached a
    /// threshold. Returns closed bundles in close order.
    pub fn collect(&mut self, now: Instant) -> Vec<Bundle> {
        let mut closed = Vec::new();

        let last = *self.last_snapshot.get_or_insert(now);
        if now.saturating_duration_since(last) >= self.flush_interval {
            self.last_snapshot = Some(now);
            self.bundle_views(now, &mut closed);
        }
        self.bundle_spans(now, &mut closed);

        if let Some(batch) = self.metrics.poll_expired(now) {
            closed.push(self.seal(batch, Payload::Metrics));
        }
        if let Some(batch) = self.spans.poll_expired(now) {
            closed.push(self.seal(batch, Payload::Spans));
        }
        closed
    }

    /// Snapshots every view, drains every span and closes all open bundles.
    pub fn flush_all(&mut self, now: Instant) -> Vec<Bundle> {
        let mut closed = Vec::new();
        self.last_snapshot = Some(now);
        self.bundle_views(now, &mut closed);
        self.bundle_spans(now, &mut closed);

        if let Some(batch) = self.metrics.flush() {
            closed.push(self.seal(batch, Payload::Metrics));
        }
        if let Some(batch) = self.spans.flush() {
            closed.push(self.seal(batch, Payload::Spans));
        }
        closed
    }

    fn bundle_views(&mut self, now: Instant, closed: &mut Vec<Bundle>) {
        let snapshots = self.aggregator.snapshot_all();
        trace!(views = snapshots.len(), "snapshotting views");
        for series in snapshots.iter().flat_map(TimeSeries::from_snapshot) {
            if let Some(batch) = self.metrics.add(series, now) {
                closed.push(self.seal(batch, Payload::Metrics));
            }
        }
    }

    fn bundle_spans(&mut self, now: Instant, closed: &mut Vec<Bundle>) {
        for span in self.span_buffer.drain() {
            if let Some(batch) = self.spans.add(span, now) {
                closed.push(self.seal(batch, Payload::Spans));
            }
        }
    }

    fn seal<T>(&mut self, batch: ClosedBatch<T>, wrap: fn(Vec<T>) -> Payload) -> Bundle {
        let sequence = self.last_sequence.map_or(0, |s| s + 1);
        debug_assert_sequence_monotonic!(self.last_sequence, sequence);
        self.last_sequence = Some(sequence);
        Bundle {
            sequence,
            payload: wrap(batch.items),
            byte_size: batch.bytes,
            close_reason: batch.reason,
            resource: self.resource.clone(),
            created_at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::CloseReason;
    use crate::metric::{Aggregation, Measurement, MetricDefinition, Unit};
    use crate::metrics::PipelineMetrics;
    use crate::registry::Registry;
    use crate::span::SpanKind;
    use crate::view::ViewDefinition;

    struct Fixture {
        aggregator: Arc<Aggregator>,
        buffer: Arc<SpanBuffer>,
        batcher: Batcher,
    }

    fn fixture(config: &PipelineConfig) -> Fixture {
        let metrics = Arc::new(PipelineMetrics::new());
        let registry = Arc::new(Registry::new());
        registry
            .register_metric(MetricDefinition::new("requests", "", Unit::Dimensionless, Aggregation::Count))
            .unwrap();
        registry
            .register_view(ViewDefinition::new("requests_by_route", "requests").with_tag_keys(["route"]))
            .unwrap();
        let aggregator = Arc::new(Aggregator::new(registry, Arc::clone(&metrics)));
        let buffer = Arc::new(SpanBuffer::new(1 << 20, metrics));
        let batcher = Batcher::new(
            Arc::clone(&aggregator),
            Arc::clone(&buffer),
            config,
            Resource::empty().with_label("service.name", "test"),
        );
        Fixture {
            aggregator,
            buffer,
            batcher,
        }
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_flush_interval(Duration::from_secs(10))
            .with_bundle_count_threshold(10)
            .with_bundle_delay_threshold(Duration::from_secs(2))
    }

    #[test]
    fn test_flush_all_partitions_by_count() {
        let mut fx = fixture(&small_config());
        for i in 0..25 {
            fx.aggregator
                .record(&Measurement::new("requests", 1.0).with_tag("route", format!("/r{i}")));
        }

        let bundles = fx.batcher.flush_all(Instant::now());
        let sizes: Vec<_> = bundles.iter().map(Bundle::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(bundles[0].close_reason, CloseReason::Count);
        assert_eq!(bundles[2].close_reason, CloseReason::Flush);
        assert_eq!(bundles.iter().map(|b| b.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(bundles[0].resource.get("service.name"), Some("test"));
    }

    #[test]
    fn test_views_snapshotted_on_flush_interval() {
        let mut fx = fixture(&small_config());
        let t0 = Instant::now();
        fx.aggregator.record(&Measurement::new("requests", 1.0));

        // first tick starts the snapshot clock
        assert!(fx.batcher.collect(t0).is_empty());
        assert!(fx.batcher.collect(t0 + Duration::from_secs(9)).is_empty());
        assert_eq!(fx.batcher.pending(), (0, 0));

        assert!(fx.batcher.collect(t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(fx.batcher.pending(), (1, 0));

        // the open metric bundle then ages out
        let bundles = fx.batcher.collect(t0 + Duration::from_secs(12));
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].close_reason, CloseReason::Age);
        assert!(matches!(bundles[0].payload, Payload::Metrics(_)));
    }

    #[test]
    fn test_spans_are_bundled_separately() {
        let mut fx = fixture(&small_config());
        let t0 = Instant::now();
        for i in 0..3 {
            fx.buffer.add(Span::new(1, i, None, "op", SpanKind::Internal)).unwrap();
        }
        fx.aggregator.record(&Measurement::new("requests", 1.0));

        let bundles = fx.batcher.flush_all(t0);
        assert_eq!(bundles.len(), 2);
        let kinds: Vec<_> = bundles.iter().map(|b| b.payload.kind()).collect();
        assert_eq!(kinds, vec!["metrics", "spans"]);
        assert_eq!(bundles[1].len(), 3);
        assert!(fx.buffer.is_empty());
    }

    #[test]
    fn test_span_bundle_closes_on_age() {
        let mut fx = fixture(&small_config());
        let t0 = Instant::now();
        fx.buffer.add(Span::new(1, 1, None, "op", SpanKind::Internal)).unwrap();
        assert!(fx.batcher.collect(t0).is_empty());
        assert_eq!(fx.batcher.pending(), (0, 1));

        let bundles = fx.batcher.collect(t0 + Duration::from_secs(2));
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].close_reason, CloseReason::Age);
    }

    #[test]
    fn test_flush_with_nothing_pending_yields_nothing() {
        let mut fx = fixture(&small_config());
        assert!(fx.batcher.flush_all(Instant::now()).is_empty());
    }
}
