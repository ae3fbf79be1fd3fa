//! Pipeline self-observability counters.
//!
//! Every drop, retry and failure in the pipeline lands in one of these
//! counters; nothing is discarded silently. The counters are shared through an
//! `Arc<PipelineMetrics>` by the aggregator, the span buffer and the exporter
//! client.

use crossbeam_utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters exposed by the pipeline.
///
/// The two counters touched on the producer hot path (`measurements_recorded`
/// and `spans_buffered`) are cache-padded so that producer threads do not
/// false-share with the export side.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    measurements_recorded: CachePadded<AtomicU64>,
    spans_buffered: CachePadded<AtomicU64>,
    unregistered_records: AtomicU64,
    invalid_records: AtomicU64,
    spans_unsampled: AtomicU64,
    dropped_spans: AtomicU64,
    bundles_submitted: AtomicU64,
    bundles_exported: AtomicU64,
    items_exported: AtomicU64,
    items_rejected: AtomicU64,
    dropped_bundles: AtomicU64,
    export_retries: AtomicU64,
    export_failures: AtomicU64,
}

// All methods use `Ordering::Relaxed`: these are statistical counters, no
// control flow depends on them and they guard no other data.
impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measurements_recorded_total(&self) -> u64 {
        self.measurements_recorded.load(Ordering::Relaxed)
    }

    pub fn spans_buffered_total(&self) -> u64 {
        self.spans_buffered.load(Ordering::Relaxed)
    }

    pub fn unregistered_records_total(&self) -> u64 {
        self.unregistered_records.load(Ordering::Relaxed)
    }

    pub fn invalid_records_total(&self) -> u64 {
        self.invalid_records.load(Ordering::Relaxed)
    }

    pub fn spans_unsampled_total(&self) -> u64 {
        self.spans_unsampled.load(Ordering::Relaxed)
    }

    pub fn dropped_spans_total(&self) -> u64 {
        self.dropped_spans.load(Ordering::Relaxed)
    }

    pub fn bundles_submitted_total(&self) -> u64 {
        self.bundles_submitted.load(Ordering::Relaxed)
    }

    pub fn bundles_exported_total(&self) -> u64 {
        self.bundles_exported.load(Ordering::Relaxed)
    }

    pub fn items_exported_total(&self) -> u64 {
        self.items_exported.load(Ordering::Relaxed)
    }

    pub fn items_rejected_total(&self) -> u64 {
        self.items_rejected.load(Ordering::Relaxed)
    }

    pub fn dropped_bundles_total(&self) -> u64 {
        self.dropped_bundles.load(Ordering::Relaxed)
    }

    pub fn export_retries_total(&self) -> u64 {
        self.export_retries.load(Ordering::Relaxed)
    }

    pub fn export_failures_total(&self) -> u64 {
        self.export_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_measurement(&self) {
        self.measurements_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unregistered(&self) {
        self.unregistered_records.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid(&self) {
        self.invalid_records.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_span_buffered(&self) {
        self.spans_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_span_unsampled(&self) {
        self.spans_unsampled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_span_dropped(&self) {
        self.dropped_spans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_submitted(&self) {
        self.bundles_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exported(&self, accepted: u64, rejected: u64) {
        self.bundles_exported.fetch_add(1, Ordering::Relaxed);
        self.items_exported.fetch_add(accepted, Ordering::Relaxed);
        if rejected > 0 {
            self.items_rejected.fetch_add(rejected, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_bundle_dropped(&self) {
        self.dropped_bundles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bundles_dropped(&self, count: u64) {
        self.dropped_bundles.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.export_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.export_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            measurements_recorded_total: self.measurements_recorded_total(),
            unregistered_records_total: self.unregistered_records_total(),
            invalid_records_total: self.invalid_records_total(),
            spans_buffered_total: self.spans_buffered_total(),
            spans_unsampled_total: self.spans_unsampled_total(),
            dropped_spans_total: self.dropped_spans_total(),
            bundles_submitted_total: self.bundles_submitted_total(),
            bundles_exported_total: self.bundles_exported_total(),
            items_exported_total: self.items_exported_total(),
            items_rejected_total: self.items_rejected_total(),
            dropped_bundles_total: self.dropped_bundles_total(),
            export_retries_total: self.export_retries_total(),
            export_failures_total: self.export_failures_total(),
        }
    }
}

/// Serializable copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub measurements_recorded_total: u64,
    pub unregistered_records_total: u64,
    /// Measurements rejected for a NaN or infinite value.
    pub invalid_records_total: u64,
    pub spans_buffered_total: u64,
    pub spans_unsampled_total: u64,
    pub dropped_spans_total: u64,
    pub bundles_submitted_total: u64,
    pub bundles_exported_total: u64,
    pub items_exported_total: u64,
    pub items_rejected_total: u64,
    pub dropped_bundles_total: u64,
    pub export_retries_total: u64,
    pub export_failures_total: u64,
}
