//! Telemetry Export Pipeline
//!
//! A bounded, concurrent pipeline that aggregates metric measurements into
//! views, buffers completed trace spans, groups both into bundles by
//! count, byte size and age, and ships the bundles through a pluggable
//! transport with retry, backpressure and graceful shutdown.
//!
//! Producer threads call [`Pipeline::record`] and [`Pipeline::end_span`];
//! neither ever waits on export. A single scheduler task drives the
//! [`Batcher`] and hands closed bundles to the [`ExporterClient`], whose
//! bounded worker pool talks to the [`Transport`].
//!
//! Every drop, retry and failure is counted in [`PipelineMetrics`].
//!
//! # Example
//!
//! ```no_run
//! use telemetry_export::{
//!     Aggregation, LogTransport, Measurement, MetricDefinition, Pipeline, PipelineConfig,
//!     Unit, ViewDefinition,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Pipeline::builder(PipelineConfig::default())
//!     .with_transport(LogTransport::new(false))
//!     .build()?;
//! pipeline.registry().register_metric(MetricDefinition::new(
//!     "video_size",
//!     "processed video size",
//!     Unit::Bytes,
//!     Aggregation::distribution(vec![65536.0, 4294967296.0]),
//! ))?;
//! pipeline
//!     .registry()
//!     .register_view(ViewDefinition::new("video_size_cum", "video_size"))?;
//!
//! pipeline.start()?;
//! pipeline.record(&Measurement::new("video_size", 25_648.0));
//! pipeline.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Uses native async fn in traits (no `#[async_trait]` macro).

pub mod aggregation;
pub mod aggregator;
pub mod batcher;
pub mod bundle;
pub mod config;
pub mod error;
pub mod exporter;
mod invariants;
pub mod metric;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod self_monitor;
pub mod span;
pub mod span_buffer;
pub mod transport;
pub mod view;

// Re-export main types
pub use aggregation::{AggregationData, DistributionData, Exemplar};
pub use aggregator::Aggregator;
pub use batcher::Batcher;
pub use bundle::{Bundle, BundleConfig, BundleItem, Bundler, CloseReason, Payload, TimeSeries};
pub use config::{ConfigError, PipelineConfig};
pub use error::PipelineError;
pub use exporter::{
    DrainReport, ExportError, ExportObserver, ExporterClient, RequestOutcome, RetryPolicy, SubmitError,
    SubmitPermit,
};
pub use metric::{
    Aggregation, BucketBoundaries, Measurement, MetricDefinition, Tags, Temporality, Unit,
    ATTACHMENT_SPAN_CONTEXT,
};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use registry::{Registry, RegistryError, Subscribers};
pub use resource::{EnvResource, Resource, ResourceProvider, StaticResource};
pub use scheduler::{Scheduler, SchedulerState, ShutdownReport};
pub use self_monitor::SelfMonitor;
pub use span::{AttributeValue, Sampler, Span, SpanContext, SpanKind, SpanStatus};
pub use span_buffer::{CapacityExceeded, SpanBuffer};
pub use transport::{
    Delivery, JsonFileTransport, LogTransport, NullTransport, Rejection, Transport, TransportBoxed,
    TransportError,
};
pub use view::{Row, View, ViewDefinition, ViewSnapshot};
