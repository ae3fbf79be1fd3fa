//! Views: a metric grouped by a fixed set of tag keys.

use crate::aggregation::{Accumulator, AccumulatorSnapshot};
use crate::metric::{Aggregation, Measurement, MetricDefinition, Tags, Temporality};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

/// What a caller registers: the view name, the metric it subscribes to and
/// the tag keys used for grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDefinition {
    pub name: String,
    pub description: String,
    pub metric: String,
    pub tag_keys: Vec<String>,
    /// Overrides the metric's default aggregation.
    pub aggregation: Option<Aggregation>,
    pub temporality: Temporality,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            metric: metric.into(),
            tag_keys: Vec::new(),
            aggregation: None,
            temporality: Temporality::Cumulative,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tag_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.temporality = temporality;
        self
    }
}

/// Values of a view's tag keys, positionally aligned with `tag_keys`.
/// `None` marks a key the measurement did not carry.
type TagProjection = Vec<Option<String>>;

type AccumulatorMap = HashMap<TagProjection, Arc<Mutex<Accumulator>>>;

/// A registered view and the accumulators it owns.
///
/// Two lock levels: the map `RwLock` guards structure (new tag combinations),
/// each accumulator's `Mutex` guards its value. Recording into an existing
/// combination only takes the map lock for reading.
#[derive(Debug)]
pub struct View {
    definition: ViewDefinition,
    metric: Arc<MetricDefinition>,
    aggregation: Aggregation,
    accumulators: RwLock<AccumulatorMap>,
}

/// Snapshot of one accumulator, labelled with its tag values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub tags: Tags,
    pub snapshot: AccumulatorSnapshot,
}

/// Snapshot of a whole view.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub view: Arc<View>,
    pub rows: Vec<Row>,
}

impl View {
    pub(crate) fn new(definition: ViewDefinition, metric: Arc<MetricDefinition>) -> Self {
        let aggregation = definition
            .aggregation
            .clone()
            .unwrap_or_else(|| metric.aggregation.clone());
        Self {
            definition,
            metric,
            aggregation,
            accumulators: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn description(&self) -> &str {
        &self.definition.description
    }

    pub fn definition(&self) -> &ViewDefinition {
        &self.definition
    }

    pub fn metric(&self) -> &MetricDefinition {
        &self.metric
    }

    pub fn aggregation(&self) -> &Aggregation {
        &self.aggregation
    }

    pub fn temporality(&self) -> Temporality {
        self.definition.temporality
    }

    /// Number of distinct tag combinations seen so far.
    pub fn accumulator_count(&self) -> usize {
        self.accumulators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn project(&self, tags: &Tags) -> TagProjection {
        self.definition
            .tag_keys
            .iter()
            .map(|key| tags.get(key).map(str::to_owned))
            .collect()
    }

    fn accumulator_for(&self, projection: TagProjection, now: SystemTime) -> Arc<Mutex<Accumulator>> {
        {
            let map = self.accumulators.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(acc) = map.get(&projection) {
                return Arc::clone(acc);
            }
        }
        let mut map = self.accumulators.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry(projection)
                .or_insert_with(|| Arc::new(Mutex::new(Accumulator::new(&self.aggregation, now)))),
        )
    }

    /// Folds a measurement into the accumulator for its tag projection.
    pub(crate) fn record(&self, measurement: &Measurement) {
        let bucket = match &self.aggregation {
            Aggregation::Distribution(bounds) => bounds.bucket_for(measurement.value()),
            _ => 0,
        };
        let acc = self.accumulator_for(self.project(measurement.tags()), measurement.timestamp());
        acc.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(measurement, bucket);
    }

    /// Copies every accumulator. Delta views also reset them.
    ///
    /// The map lock is held only while the accumulator handles are cloned;
    /// each accumulator is then locked just long enough to copy its value.
    pub(crate) fn snapshot_rows(&self, now: SystemTime) -> Vec<Row> {
        let entries: Vec<(TagProjection, Arc<Mutex<Accumulator>>)> = {
            let map = self.accumulators.read().unwrap_or_else(PoisonError::into_inner);
            map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        entries
            .into_iter()
            .map(|(projection, acc)| {
                let snapshot = {
                    let mut acc = acc.lock().unwrap_or_else(PoisonError::into_inner);
                    match self.definition.temporality {
                        Temporality::Cumulative => acc.snapshot(now),
                        Temporality::Delta => acc.snapshot_and_reset(&self.aggregation, now),
                    }
                };
                Row {
                    tags: self.tags_of(projection),
                    snapshot,
                }
            })
            .collect()
    }

    fn tags_of(&self, projection: TagProjection) -> Tags {
        self.definition
            .tag_keys
            .iter()
            .zip(projection)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect()
    }
}
