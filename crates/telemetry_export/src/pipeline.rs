//! The assembled pipeline and its builder.
//!
//! ```text
//!  record() ──► Aggregator ─┐
//!                           ├─► Batcher ─► ExporterClient ─► Transport
//!  end_span() ─► SpanBuffer ┘      ▲
//!                               Scheduler (ticks, flush, stop)
//! ```

use crate::aggregator::Aggregator;
use crate::batcher::Batcher;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::exporter::{ExportObserver, ExporterClient};
use crate::metric::{Measurement, ATTACHMENT_SPAN_CONTEXT};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::registry::Registry;
use crate::resource::{Resource, ResourceProvider, StaticResource};
use crate::scheduler::{Scheduler, SchedulerState, ShutdownReport};
use crate::self_monitor::SelfMonitor;
use crate::span::{Sampler, Span, SpanContext, SpanKind, SpanStatus};
use crate::span_buffer::{CapacityExceeded, SpanBuffer};
use crate::transport::{NullTransport, Transport, TransportBoxed};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Builds a [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    transport: Option<Arc<dyn TransportBoxed>>,
    resource: Option<Box<dyn ResourceProvider>>,
    registry: Option<Arc<Registry>>,
    self_monitoring: bool,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            transport: None,
            resource: None,
            registry: None,
            self_monitoring: false,
        }
    }

    /// Where bundles go. Defaults to [`NullTransport`].
    pub fn with_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Like [`with_transport`](Self::with_transport), for a shared transport.
    pub fn with_shared_transport(mut self, transport: Arc<dyn TransportBoxed>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Static labels attached to every bundle. Queried once, in `build()`.
    pub fn with_resource<R: ResourceProvider + 'static>(mut self, provider: R) -> Self {
        self.resource = Some(Box::new(provider));
        self
    }

    /// Uses an existing registry instead of a fresh one.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Records per-request export statistics into the pipeline's registry.
    pub fn with_self_monitoring(mut self, enabled: bool) -> Self {
        self.self_monitoring = enabled;
        self
    }

    /// Validates the configuration and wires every component.
    ///
    /// Must run inside a tokio runtime: the exporter's dispatcher is spawned
    /// here. Ticking only begins with [`Pipeline::start`].
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|e| PipelineError::NoRuntime(e.to_string()))?;

        let config = self.config;
        let metrics = Arc::new(PipelineMetrics::new());
        let registry = self.registry.unwrap_or_else(|| Arc::new(Registry::new()));
        let aggregator = Arc::new(Aggregator::new(Arc::clone(&registry), Arc::clone(&metrics)));
        let span_buffer = Arc::new(SpanBuffer::new(config.max_buffer_bytes, Arc::clone(&metrics)));
        let resource = self
            .resource
            .unwrap_or_else(|| Box::new(StaticResource::default()))
            .detect();

        let observer: Option<Arc<dyn ExportObserver>> = if self.self_monitoring {
            Some(Arc::new(SelfMonitor::register(Arc::clone(&aggregator))?))
        } else {
            None
        };
        let transport = self.transport.unwrap_or_else(|| Arc::new(NullTransport));
        let client = Arc::new(ExporterClient::spawn(
            transport,
            &config,
            Arc::clone(&metrics),
            observer,
        ));

        let batcher = Batcher::new(
            Arc::clone(&aggregator),
            Arc::clone(&span_buffer),
            &config,
            resource.clone(),
        );
        let scheduler = Scheduler::new(batcher, client, &config);
        debug!(labels = resource.labels().len(), "pipeline built");

        Ok(Pipeline {
            sampler: Sampler::from_ratio(config.trace_sample_ratio),
            config,
            registry,
            aggregator,
            span_buffer,
            metrics,
            resource,
            scheduler,
        })
    }
}

/// A running (or not yet started) aggregation and export pipeline.
///
/// Producer-side calls (`record`, `start_span`, `end_span`) may be made from
/// any thread and never wait on export.
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<Registry>,
    aggregator: Arc<Aggregator>,
    span_buffer: Arc<SpanBuffer>,
    sampler: Sampler,
    metrics: Arc<PipelineMetrics>,
    resource: Resource,
    scheduler: Scheduler,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Records a measurement. Returns the number of views it updated.
    pub fn record(&self, measurement: &Measurement) -> usize {
        self.aggregator.record(measurement)
    }

    /// Records a measurement with `span` attached as its span context.
    pub fn record_in_span(&self, measurement: Measurement, span: &SpanContext) -> usize {
        self.aggregator
            .record(&measurement.with_attachment(ATTACHMENT_SPAN_CONTEXT, span.to_string()))
    }

    /// Starts a root span, sampled per `trace_sample_ratio`.
    pub fn start_span(&self, name: impl Into<String>, kind: SpanKind) -> Span {
        Span::start_root(name, kind, &self.sampler)
    }

    pub fn start_child_span(&self, parent: &SpanContext, name: impl Into<String>, kind: SpanKind) -> Span {
        Span::start_child(parent, name, kind)
    }

    /// Finishes a span and hands it to the span buffer.
    ///
    /// A full buffer drops the span and counts it; the error is informational.
    pub fn end_span(&self, mut span: Span, status: SpanStatus) -> Result<(), CapacityExceeded> {
        span.finish(status);
        self.span_buffer.add(span)
    }

    pub fn start(&self) -> Result<(), PipelineError> {
        self.scheduler.start()
    }

    /// Forces a flush of every view and buffered span.
    pub async fn flush(&self) -> Result<usize, PipelineError> {
        self.scheduler.flush().await
    }

    /// Stops within `shutdown_timeout`.
    pub async fn stop(&self) -> Result<ShutdownReport, PipelineError> {
        self.scheduler.stop().await
    }

    pub async fn stop_with_deadline(&self, deadline: Instant) -> Result<ShutdownReport, PipelineError> {
        self.scheduler.stop_with_deadline(deadline).await
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
