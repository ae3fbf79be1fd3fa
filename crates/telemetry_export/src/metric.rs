//! Metric definitions and measurements.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Unit of a metric, in the UCUM-style spelling backends expect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Dimensionless,
    Bytes,
    Milliseconds,
    Custom(String),
}

impl Unit {
    pub fn as_str(&self) -> &str {
        match self {
            Unit::Dimensionless => "1",
            Unit::Bytes => "By",
            Unit::Milliseconds => "ms",
            Unit::Custom(unit) => unit,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How recorded values are folded together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Aggregation {
    /// Number of measurements.
    Count,
    /// Arithmetic sum of the values.
    Sum,
    /// Most recent value.
    LastValue,
    /// Histogram over explicit bucket upper bounds.
    Distribution(BucketBoundaries),
}

impl Aggregation {
    /// Distribution over the given boundaries.
    ///
    /// Boundaries are validated when the view is registered.
    pub fn distribution(bounds: impl Into<Vec<f64>>) -> Self {
        Aggregation::Distribution(BucketBoundaries(bounds.into()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Sum => "sum",
            Aggregation::LastValue => "last_value",
            Aggregation::Distribution(_) => "distribution",
        }
    }
}

/// Upper bounds of distribution buckets.
///
/// `n` boundaries describe `n + 1` buckets: `(-inf, b0)`, `[b0, b1)`, ...,
/// `[b(n-1), +inf)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketBoundaries(pub Vec<f64>);

impl BucketBoundaries {
    pub fn bounds(&self) -> &[f64] {
        &self.0
    }

    pub fn bucket_count(&self) -> usize {
        self.0.len() + 1
    }

    /// Index of the bucket that holds `value`.
    pub fn bucket_for(&self, value: f64) -> usize {
        self.0.partition_point(|bound| *bound <= value)
    }

    /// Finite and strictly increasing.
    pub fn is_valid(&self) -> bool {
        self.0.iter().all(|b| b.is_finite()) && self.0.windows(2).all(|w| w[0] < w[1])
    }
}

/// Whether snapshots cover the whole lifetime of an accumulator or only the
/// interval since the previous snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Temporality {
    #[default]
    Cumulative,
    Delta,
}

/// A registered metric. The name is the registry key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub description: String,
    pub unit: Unit,
    /// Aggregation used by views that do not override it.
    pub aggregation: Aggregation,
}

impl MetricDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        unit: Unit,
        aggregation: Aggregation,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            unit,
            aggregation,
        }
    }
}

/// Tag key/value pairs attached to a measurement.
///
/// Ordered so that equal tag sets compare and hash identically regardless of
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Opaque annotations carried by a measurement, e.g. the span context that
/// was active when it was recorded. Kept as exemplars by distributions.
pub type Attachments = HashMap<String, String>;

/// Key under which the active span context is attached to a measurement.
pub const ATTACHMENT_SPAN_CONTEXT: &str = "SpanContext";

/// A single recorded value. Immutable once built.
#[derive(Debug, Clone)]
pub struct Measurement {
    metric: Arc<str>,
    value: f64,
    tags: Tags,
    timestamp: SystemTime,
    attachments: Option<Attachments>,
}

impl Measurement {
    /// A measurement of `metric` taken now, with no tags.
    pub fn new(metric: impl Into<Arc<str>>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            tags: Tags::new(),
            timestamp: SystemTime::now(),
            attachments: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments
            .get_or_insert_with(Attachments::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn attachments(&self) -> Option<&Attachments> {
        self.attachments.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_for_uses_upper_exclusive_bounds() {
        let bounds = BucketBoundaries(vec![1.0, 2.0, 4.0]);
        assert_eq!(bounds.bucket_count(), 4);
        assert_eq!(bounds.bucket_for(0.5), 0);
        assert_eq!(bounds.bucket_for(1.0), 1);
        assert_eq!(bounds.bucket_for(3.9), 2);
        assert_eq!(bounds.bucket_for(4.0), 3);
        assert_eq!(bounds.bucket_for(1e9), 3);
    }

    #[test]
    fn test_bucket_boundaries_validity() {
        assert!(BucketBoundaries(vec![]).is_valid());
        assert!(BucketBoundaries(vec![1.0, 2.0]).is_valid());
        assert!(!BucketBoundaries(vec![2.0, 2.0]).is_valid());
        assert!(!BucketBoundaries(vec![3.0, 1.0]).is_valid());
        assert!(!BucketBoundaries(vec![1.0, f64::INFINITY]).is_valid());
    }

    #[test]
    fn test_tags_order_independent() {
        let a = Tags::new().with("zone", "us-east1").with("host", "a");
        let b: Tags = [("host", "a"), ("zone", "us-east1")].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.get("zone"), Some("us-east1"));
    }

    #[test]
    fn test_measurement_builder() {
        let m = Measurement::new("video_size", 25648.0)
            .with_tag("codec", "h264")
            .with_attachment(ATTACHMENT_SPAN_CONTEXT, "abc");
        assert_eq!(m.metric(), "video_size");
        assert_eq!(m.tags().get("codec"), Some("h264"));
        assert_eq!(
            m.attachments().and_then(|a| a.get(ATTACHMENT_SPAN_CONTEXT)).map(String::as_str),
            Some("abc")
        );
    }

    #[test]
    fn test_unit_spelling() {
        assert_eq!(Unit::Bytes.to_string(), "By");
        assert_eq!(Unit::Dimensionless.as_str(), "1");
        assert_eq!(Unit::Custom("req".into()).as_str(), "req");
    }
}
