use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::time::{SystemTime, UNIX_EPOCH};

/// Represents a single distributed tracing span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Unique trace identifier (128-bit)
    pub trace_id: u128,
    /// Unique span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier (`None` for a root span)
    pub parent_span_id: Option<u64>,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    /// Operation name
    pub name: String,
    /// Span attributes
    pub attributes: HashMap<String, AttributeValue>,
    /// Span status
    pub status: SpanStatus,
    /// Span kind
    pub kind: SpanKind,
    /// Sampling decision taken when the span was started
    pub sampled: bool,
}

/// Attribute value types for span metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<String>),
}

impl AttributeValue {
    fn estimated_size(&self) -> usize {
        match self {
            AttributeValue::String(s) => s.len(),
            AttributeValue::Int(_) | AttributeValue::Float(_) => 8,
            AttributeValue::Bool(_) => 1,
            AttributeValue::Array(items) => items.iter().map(|s| s.len() + 2).sum(),
        }
    }
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
    /// Span status unknown
    Unset,
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

/// Identity of a span, propagated to children and attached to measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub sampled: bool,
}

impl fmt::Display for SpanContext {
    /// W3C `traceparent` layout: `00-<trace>-<span>-<flags>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.sampled)
        )
    }
}

/// Head sampling policy, applied to the trace id so that every span of a
/// trace gets the same decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampler {
    AlwaysOn,
    AlwaysOff,
    /// Sample this fraction of traces, in `[0, 1]`.
    TraceIdRatio(f64),
}

impl Sampler {
    /// `AlwaysOn` for 1.0, `AlwaysOff` for 0.0, a ratio sampler otherwise.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatio(ratio)
        }
    }

    pub fn should_sample(&self, trace_id: u128) -> bool {
        match *self {
            Sampler::AlwaysOn => true,
            Sampler::AlwaysOff => false,
            Sampler::TraceIdRatio(ratio) => {
                // lower 64 bits of the trace id are uniformly random
                let bound = (ratio * u64::MAX as f64) as u64;
                (trace_id as u64) < bound
            }
        }
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Generates a random non-zero trace id.
pub fn new_trace_id() -> u128 {
    rand::thread_rng().gen_range(1..=u128::MAX)
}

/// Generates a random non-zero span id.
pub fn new_span_id() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

impl Span {
    /// Creates a new span with the given parameters, started now and sampled.
    pub fn new(
        trace_id: u128,
        span_id: u64,
        parent_span_id: Option<u64>,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> Self {
        let now = unix_nanos();
        Self {
            trace_id,
            span_id,
            parent_span_id,
            start_time: now,
            end_time: now,
            name: name.into(),
            attributes: HashMap::new(),
            status: SpanStatus::Unset,
            kind,
            sampled: true,
        }
    }

    /// Starts a root span in a fresh trace, sampled per `sampler`.
    pub fn start_root(name: impl Into<String>, kind: SpanKind, sampler: &Sampler) -> Self {
        let trace_id = new_trace_id();
        let mut span = Self::new(trace_id, new_span_id(), None, name, kind);
        span.sampled = sampler.should_sample(trace_id);
        span
    }

    /// Starts a child span; it inherits the parent's trace and sampling decision.
    pub fn start_child(parent: &SpanContext, name: impl Into<String>, kind: SpanKind) -> Self {
        let mut span = Self::new(parent.trace_id, new_span_id(), Some(parent.span_id), name, kind);
        span.sampled = parent.sampled;
        span
    }

    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
            sampled: self.sampled,
        }
    }

    /// Marks the span as completed with the given status
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time = unix_nanos().max(self.start_time);
        self.status = status;
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(key.into(), value);
    }

    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }

    /// Rough serialized size in bytes, used for buffer and bundle budgets.
    pub fn estimated_size(&self) -> usize {
        mem::size_of::<Self>()
            + self.name.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.estimated_size())
                .sum::<usize>()
    }
}
