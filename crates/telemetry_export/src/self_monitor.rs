//! Exporter self-monitoring.
//!
//! [`SelfMonitor`] is an [`ExportObserver`] that turns every transport request
//! into a measurement of the pipeline's own registry, so request counts and
//! request sizes are exported alongside application metrics.

use crate::aggregator::Aggregator;
use crate::bundle::power_of_two_boundaries;
use crate::exporter::{ExportObserver, RequestOutcome};
use crate::metric::{Aggregation, Measurement, MetricDefinition, Unit};
use crate::registry::RegistryError;
use crate::view::ViewDefinition;
use std::sync::Arc;

/// Items sent per transport request.
pub const ITEMS_PER_REQUEST_METRIC: &str = "telemetry_export/items_per_request";
/// Count of transport requests, by outcome.
pub const REQUEST_COUNT_VIEW: &str = "telemetry_export/export_request_count";
/// Distribution of items per request, by outcome.
pub const ITEMS_PER_REQUEST_VIEW: &str = "telemetry_export/items_per_request";

const OUTCOME_TAG: &str = "outcome";

pub struct SelfMonitor {
    aggregator: Arc<Aggregator>,
}

impl SelfMonitor {
    /// Registers the self-monitoring metric and its two views.
    pub fn register(aggregator: Arc<Aggregator>) -> Result<Self, RegistryError> {
        let registry = aggregator.registry();
        registry.register_metric(MetricDefinition::new(
            ITEMS_PER_REQUEST_METRIC,
            "Number of items sent per export request.",
            Unit::Dimensionless,
            power_of_two_boundaries(),
        ))?;
        registry.register_view(
            ViewDefinition::new(REQUEST_COUNT_VIEW, ITEMS_PER_REQUEST_METRIC)
                .with_description("Number of export requests.")
                .with_tag_keys([OUTCOME_TAG])
                .with_aggregation(Aggregation::Count),
        )?;
        registry.register_view(
            ViewDefinition::new(ITEMS_PER_REQUEST_VIEW, ITEMS_PER_REQUEST_METRIC)
                .with_description("Distribution of items sent per export request.")
                .with_tag_keys([OUTCOME_TAG]),
        )?;
        Ok(Self { aggregator })
    }
}

impl ExportObserver for SelfMonitor {
    fn on_request(&self, items: usize, outcome: RequestOutcome) {
        let outcome = match outcome {
            RequestOutcome::Accepted => "accepted",
            RequestOutcome::Partial { .. } => "partial",
            RequestOutcome::Failed => "failed",
        };
        self.aggregator.record(
            &Measurement::new(ITEMS_PER_REQUEST_METRIC, items as f64).with_tag(OUTCOME_TAG, outcome),
        );
    }
}
