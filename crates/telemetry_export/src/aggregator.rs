//! Measurement aggregation.
//!
//! The producer-facing half of the pipeline. `record` never blocks on export
//! and never fails: the only waiting it does is on the per-accumulator lock of
//! the tag combination being updated (plus, the first time a combination is
//! seen, the view's map lock).

use crate::metrics::PipelineMetrics;
use crate::metric::Measurement;
use crate::registry::Registry;
use crate::view::{View, ViewSnapshot};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;

/// Folds measurements into the accumulators of every subscribed view.
#[derive(Debug)]
pub struct Aggregator {
    registry: Arc<Registry>,
    metrics: Arc<PipelineMetrics>,
}

impl Aggregator {
    pub fn new(registry: Arc<Registry>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Records a measurement into every view subscribed to its metric.
    ///
    /// Returns the number of views updated. An unregistered metric is a no-op
    /// that logs a warning and bumps `unregistered_records_total`; so is a
    /// NaN or infinite value, counted in `invalid_records_total`.
    pub fn record(&self, measurement: &Measurement) -> usize {
        if !measurement.value().is_finite() {
            self.metrics.record_invalid();
            warn!(
                metric = measurement.metric(),
                value = measurement.value(),
                "dropping non-finite measurement"
            );
            return 0;
        }
        let Some(views) = self.registry.views_for(measurement.metric()) else {
            self.metrics.record_unregistered();
            if !self.registry.is_closed() {
                warn!(metric = measurement.metric(), "dropping measurement for unregistered metric");
            }
            return 0;
        };

        for view in views.iter() {
            view.record(measurement);
        }
        self.metrics.record_measurement();
        views.len()
    }

    /// Records several measurements, returning the total view updates.
    pub fn record_batch<'a, I>(&self, measurements: I) -> usize
    where
        I: IntoIterator<Item = &'a Measurement>,
    {
        measurements.into_iter().map(|m| self.record(m)).sum()
    }

    /// Point-in-time copy of every accumulator of `view`.
    pub fn snapshot(&self, view: &Arc<View>) -> ViewSnapshot {
        ViewSnapshot {
            view: Arc::clone(view),
            rows: view.snapshot_rows(SystemTime::now()),
        }
    }

    /// Snapshots every registered view, skipping views with no data yet.
    pub fn snapshot_all(&self) -> Vec<ViewSnapshot> {
        let now = SystemTime::now();
        let mut views = self.registry.views();
        views.sort_by(|a, b| a.name().cmp(b.name()));
        views
            .into_iter()
            .filter_map(|view| {
                let rows = view.snapshot_rows(now);
                (!rows.is_empty()).then(|| ViewSnapshot { view, rows })
            })
            .collect()
    }
}
