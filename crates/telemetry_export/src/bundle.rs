//! Bundles and the pure bundling rule.
//!
//! [`Bundler`] is a **pure batching abstraction**: it owns no locks, no
//! atomics and no exporter, and it is handed the current time instead of
//! reading a clock. It only decides when an open bundle is closed:
//!
//! - its item count reached `count_threshold`, or
//! - its estimated bytes reached `byte_threshold`, or
//! - its first item is at least `delay_threshold` old,
//!
//! whichever happens first. Concurrency lives in the
//! [`Batcher`](crate::Batcher) and [`ExporterClient`](crate::ExporterClient).

use crate::aggregation::AggregationData;
use crate::invariants::debug_assert_bundle_closed_on_threshold;
use crate::metric::Aggregation;
use crate::resource::Resource;
use crate::span::Span;
use crate::view::ViewSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;
use std::mem;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// One exported series: a view row plus its labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeries {
    pub view: String,
    pub description: String,
    pub unit: String,
    pub aggregation: &'static str,
    pub labels: BTreeMap<String, String>,
    pub data: AggregationData,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

impl TimeSeries {
    /// Flattens a view snapshot into one series per row.
    pub fn from_snapshot(snapshot: &ViewSnapshot) -> Vec<TimeSeries> {
        let view = &snapshot.view;
        snapshot
            .rows
            .iter()
            .map(|row| TimeSeries {
                view: view.name().to_owned(),
                description: view.description().to_owned(),
                unit: view.metric().unit.to_string(),
                aggregation: view.aggregation().kind(),
                labels: row.tags.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect(),
                data: row.snapshot.data.clone(),
                start_time: row.snapshot.start_time,
                end_time: row.snapshot.end_time,
            })
            .collect()
    }
}

/// Anything that can be bundled.
pub trait BundleItem {
    /// Rough serialized size in bytes.
    fn estimated_size(&self) -> usize;
}

impl BundleItem for Span {
    fn estimated_size(&self) -> usize {
        Span::estimated_size(self)
    }
}

impl BundleItem for TimeSeries {
    fn estimated_size(&self) -> usize {
        let data = match &self.data {
            AggregationData::Distribution(d) => d.bucket_counts.len() * 16 + 64,
            _ => 16,
        };
        mem::size_of::<Self>()
            + self.view.len()
            + self.description.len()
            + self.labels.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
            + data
    }
}

/// Which threshold closed a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Count,
    Bytes,
    Age,
    Flush,
}

/// Thresholds of one bundle stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleConfig {
    pub count_threshold: usize,
    pub byte_threshold: usize,
    pub delay_threshold: Duration,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            count_threshold: 10_000,
            byte_threshold: 1024 * 1024,
            delay_threshold: Duration::from_secs(2),
        }
    }
}

/// Items of a closed bundle, before it is wrapped into a [`Bundle`].
#[derive(Debug)]
pub struct ClosedBatch<T> {
    pub items: Vec<T>,
    pub bytes: usize,
    pub reason: CloseReason,
}

/// Accumulates items into an open bundle and closes it on threshold.
#[derive(Debug)]
pub struct Bundler<T> {
    config: BundleConfig,
    items: Vec<T>,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl<T: BundleItem> Bundler<T> {
    pub fn new(config: BundleConfig) -> Self {
        Self {
            config,
            items: Vec::new(),
            bytes: 0,
            opened_at: None,
        }
    }

    pub fn config(&self) -> &BundleConfig {
        &self.config
    }

    /// Items in the open bundle.
    pub fn pending(&self) -> usize {
        self.items.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.bytes
    }

    /// Adds an item and returns the bundle if that closed it.
    pub fn add(&mut self, item: T, now: Instant) -> Option<ClosedBatch<T>> {
        if self.items.is_empty() {
            self.opened_at = Some(now);
        }
        self.bytes += item.estimated_size();
        self.items.push(item);

        let reason = if self.items.len() >= self.config.count_threshold {
            Some(CloseReason::Count)
        } else if self.bytes >= self.config.byte_threshold {
            Some(CloseReason::Bytes)
        } else if self.is_expired(now) {
            Some(CloseReason::Age)
        } else {
            None
        };
        reason.map(|reason| self.close(reason))
    }

    /// Closes the open bundle if it has outlived the delay threshold.
    pub fn poll_expired(&mut self, now: Instant) -> Option<ClosedBatch<T>> {
        self.is_expired(now).then(|| self.close(CloseReason::Age))
    }

    /// Closes the open bundle regardless of thresholds.
    pub fn flush(&mut self) -> Option<ClosedBatch<T>> {
        (!self.items.is_empty()).then(|| self.close(CloseReason::Flush))
    }

    /// When the open bundle will expire, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.config.delay_threshold)
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.opened_at {
            Some(opened) if !self.items.is_empty() => {
                now.saturating_duration_since(opened) >= self.config.delay_threshold
            }
            _ => false,
        }
    }

    fn close(&mut self, reason: CloseReason) -> ClosedBatch<T> {
        debug_assert_bundle_closed_on_threshold!(
            reason,
            self.items.len(),
            self.bytes,
            self.config
        );
        self.opened_at = None;
        ClosedBatch {
            items: mem::take(&mut self.items),
            bytes: mem::replace(&mut self.bytes, 0),
            reason,
        }
    }
}

/// Contents of a bundle. Metrics and spans travel in separate bundles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum Payload {
    Metrics(Vec<TimeSeries>),
    Spans(Vec<Span>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Metrics(series) => series.len(),
            Payload::Spans(spans) => spans.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Metrics(_) => "metrics",
            Payload::Spans(_) => "spans",
        }
    }
}

/// A closed batch ready for export. Never mutated after closing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bundle {
    /// Close order across both streams.
    pub sequence: u64,
    pub payload: Payload,
    pub byte_size: usize,
    pub close_reason: CloseReason,
    pub resource: Resource,
    pub created_at: SystemTime,
}

impl Bundle {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Default distribution boundaries for "items per request" style metrics:
/// powers of two from 1 to 65536.
pub fn power_of_two_boundaries() -> Aggregation {
    Aggregation::distribution((0..=16).map(|p| f64::from(1u32 << p)).collect::<Vec<_>>())
}
