//! Running aggregates for a single view and tag combination.

use crate::metric::{Aggregation, Attachments, BucketBoundaries, Measurement};
use serde::Serialize;
use std::time::SystemTime;

/// Most recent measurement that landed in a distribution bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exemplar {
    pub value: f64,
    pub timestamp: SystemTime,
    pub attachments: Attachments,
}

/// Histogram state of a distribution aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionData {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    /// Running sum of squared deviation from the mean (Welford).
    pub sum_of_squared_deviation: f64,
    pub min: f64,
    pub max: f64,
    pub bounds: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub exemplars: Vec<Option<Exemplar>>,
}

impl DistributionData {
    fn new(bounds: &BucketBoundaries) -> Self {
        let buckets = bounds.bucket_count();
        Self {
            count: 0,
            sum: 0.0,
            mean: 0.0,
            sum_of_squared_deviation: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            bounds: bounds.bounds().to_vec(),
            bucket_counts: vec![0; buckets],
            exemplars: vec![None; buckets],
        }
    }

    fn add(&mut self, value: f64, bucket: usize, measurement: &Measurement) {
        self.count += 1;
        self.sum += value;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.sum_of_squared_deviation += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.bucket_counts[bucket] += 1;
        if let Some(attachments) = measurement.attachments() {
            self.exemplars[bucket] = Some(Exemplar {
                value,
                timestamp: measurement.timestamp(),
                attachments: attachments.clone(),
            });
        }
    }
}

/// Aggregated value of one accumulator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AggregationData {
    Count(u64),
    Sum(f64),
    LastValue(Option<f64>),
    Distribution(DistributionData),
}

impl AggregationData {
    pub(crate) fn empty(aggregation: &Aggregation) -> Self {
        match aggregation {
            Aggregation::Count => AggregationData::Count(0),
            Aggregation::Sum => AggregationData::Sum(0.0),
            Aggregation::LastValue => AggregationData::LastValue(None),
            Aggregation::Distribution(bounds) => {
                AggregationData::Distribution(DistributionData::new(bounds))
            }
        }
    }

    /// Number of measurements folded into this value, where that is tracked.
    pub fn count(&self) -> Option<u64> {
        match self {
            AggregationData::Count(count) => Some(*count),
            AggregationData::Distribution(dist) => Some(dist.count),
            AggregationData::Sum(_) | AggregationData::LastValue(_) => None,
        }
    }
}

/// Mutable running aggregate owned by exactly one view.
///
/// Not synchronized itself; the owning view wraps each accumulator in its own
/// mutex so that unrelated tag combinations never contend.
#[derive(Debug)]
pub struct Accumulator {
    data: AggregationData,
    start_time: SystemTime,
    last_update: SystemTime,
}

/// Point-in-time copy of an accumulator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccumulatorSnapshot {
    pub data: AggregationData,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

impl Accumulator {
    pub fn new(aggregation: &Aggregation, start_time: SystemTime) -> Self {
        Self {
            data: AggregationData::empty(aggregation),
            start_time,
            last_update: start_time,
        }
    }

    /// Folds one measurement in.
    ///
    /// `bucket` is only consulted for distributions; the caller computes it
    /// before taking the lock.
    pub fn update(&mut self, measurement: &Measurement, bucket: usize) {
        let value = measurement.value();
        match &mut self.data {
            AggregationData::Count(count) => *count += 1,
            AggregationData::Sum(sum) => *sum += value,
            AggregationData::LastValue(last) => *last = Some(value),
            AggregationData::Distribution(dist) => dist.add(value, bucket, measurement),
        }
        self.last_update = self.last_update.max(measurement.timestamp());
    }

    pub fn data(&self) -> &AggregationData {
        &self.data
    }

    /// Copies the current state. The interval ends at `now`.
    pub fn snapshot(&self, now: SystemTime) -> AccumulatorSnapshot {
        AccumulatorSnapshot {
            data: self.data.clone(),
            start_time: self.start_time,
            end_time: now.max(self.last_update),
        }
    }

    /// Copies the current state and starts a fresh interval at `now`.
    pub fn snapshot_and_reset(&mut self, aggregation: &Aggregation, now: SystemTime) -> AccumulatorSnapshot {
        let snapshot = self.snapshot(now);
        self.data = AggregationData::empty(aggregation);
        self.start_time = snapshot.end_time;
        self.last_update = snapshot.end_time;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::ATTACHMENT_SPAN_CONTEXT;
    use std::time::Duration;

    fn m(value: f64) -> Measurement {
        Measurement::new("m", value)
    }

    #[test]
    fn test_count_sum_last_value() {
        let now = SystemTime::now();
        let mut count = Accumulator::new(&Aggregation::Count, now);
        let mut sum = Accumulator::new(&Aggregation::Sum, now);
        let mut last = Accumulator::new(&Aggregation::LastValue, now);

        for v in [3.0, 4.5, -1.0] {
            count.update(&m(v), 0);
            sum.update(&m(v), 0);
            last.update(&m(v), 0);
        }

        assert_eq!(count.data(), &AggregationData::Count(3));
        assert_eq!(sum.data(), &AggregationData::Sum(6.5));
        assert_eq!(last.data(), &AggregationData::LastValue(Some(-1.0)));
    }

    #[test]
    fn test_distribution_statistics() {
        let agg = Aggregation::distribution(vec![2.0, 4.0]);
        let Aggregation::Distribution(bounds) = &agg else { unreachable!() };
        let mut acc = Accumulator::new(&agg, SystemTime::now());

        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            acc.update(&m(v), bounds.bucket_for(v));
        }

        let AggregationData::Distribution(dist) = acc.data() else {
            panic!("expected distribution");
        };
        assert_eq!(dist.count, 5);
        assert_eq!(dist.sum, 15.0);
        assert!((dist.mean - 3.0).abs() < 1e-9);
        // squared deviations: 4 + 1 + 0 + 1 + 4
        assert!((dist.sum_of_squared_deviation - 10.0).abs() < 1e-9);
        assert_eq!(dist.min, 1.0);
        assert_eq!(dist.max, 5.0);
        assert_eq!(dist.bucket_counts, vec![1, 2, 2]);
    }

    #[test]
    fn test_distribution_keeps_latest_exemplar_per_bucket() {
        let agg = Aggregation::distribution(vec![10.0]);
        let mut acc = Accumulator::new(&agg, SystemTime::now());

        acc.update(&m(1.0).with_attachment(ATTACHMENT_SPAN_CONTEXT, "first"), 0);
        acc.update(&m(2.0).with_attachment(ATTACHMENT_SPAN_CONTEXT, "second"), 0);
        acc.update(&m(20.0), 1);

        let AggregationData::Distribution(dist) = acc.data() else {
            panic!("expected distribution");
        };
        let exemplar = dist.exemplars[0].as_ref().unwrap();
        assert_eq!(exemplar.value, 2.0);
        assert_eq!(exemplar.attachments[ATTACHMENT_SPAN_CONTEXT], "second");
        assert!(dist.exemplars[1].is_none());
    }

    #[test]
    fn test_snapshot_and_reset_starts_new_interval() {
        let start = SystemTime::now();
        let mut acc = Accumulator::new(&Aggregation::Sum, start);
        acc.update(&m(5.0), 0);

        let flush_at = start + Duration::from_secs(60);
        let snap = acc.snapshot_and_reset(&Aggregation::Sum, flush_at);
        assert_eq!(snap.data, AggregationData::Sum(5.0));
        assert_eq!(snap.start_time, start);
        assert_eq!(snap.end_time, flush_at);

        assert_eq!(acc.data(), &AggregationData::Sum(0.0));
        let next = acc.snapshot(flush_at + Duration::from_secs(60));
        assert_eq!(next.start_time, flush_at);
    }
}
