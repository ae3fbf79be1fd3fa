//! Flush scheduling and graceful shutdown.
//!
//! # State machine
//!
//! ```text
//! ┌──────┐ start() ┌─────────┐ stop() ┌──────────┐ drained / deadline ┌─────────┐
//! │ Idle │ ──────► │ Running │ ─────► │ Draining │ ─────────────────► │ Stopped │
//! └──────┘         └─────────┘        └──────────┘                    └─────────┘
//!     │                                                                     ▲
//!     └──────────────────────────── stop() ─────────────────────────────────┘
//! ```
//!
//! `start()` in any state but `Idle` and `stop()` in `Draining` or `Stopped`
//! are no-ops.
//!
//! While running, one tokio task owns the [`Batcher`]. It wakes up every
//! `min(flush_interval, bundle_delay_threshold)`, collects closed bundles
//! and submits them to the [`ExporterClient`], in close order.

use crate::batcher::Batcher;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::exporter::ExporterClient;
use crate::invariants::debug_assert_forward_transition;
use crate::bundle::Bundle;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle state of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

/// Outcome of `stop()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Bundles closed by the final forced flush.
    pub flushed: usize,
    /// Bundles the exporter took from its queue while draining.
    pub drained: usize,
    /// Bundles given up at the deadline, already counted as dropped.
    pub abandoned: usize,
}

enum Command {
    Flush(oneshot::Sender<usize>),
}

struct FinalFlush {
    flushed: usize,
    abandoned: usize,
}

struct Running {
    commands: mpsc::Sender<Command>,
    shutdown_tx: oneshot::Sender<Instant>,
    task: JoinHandle<FinalFlush>,
}

struct Inner {
    state: SchedulerState,
    batcher: Option<Batcher>,
    running: Option<Running>,
}

/// Drives periodic flushes and coordinates shutdown.
pub struct Scheduler {
    inner: Mutex<Inner>,
    client: Arc<ExporterClient>,
    tick_interval: Duration,
    shutdown_timeout: Duration,
}

impl Scheduler {
    pub fn new(batcher: Batcher, client: Arc<ExporterClient>, config: &PipelineConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                batcher: Some(batcher),
                running: None,
            }),
            client,
            tick_interval: config.tick_interval(),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.lock().state
    }

    pub fn client(&self) -> &Arc<ExporterClient> {
        &self.client
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(inner: &mut Inner, to: SchedulerState) {
        debug_assert_forward_transition!(inner.state, to);
        debug!(from = ?inner.state, to = ?to, "scheduler transition");
        inner.state = to;
    }

    /// Launches the flush loop. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), PipelineError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| PipelineError::NoRuntime(e.to_string()))?;

        let mut inner = self.lock();
        if inner.state != SchedulerState::Idle {
            debug!(state = ?inner.state, "start ignored");
            return Ok(());
        }
        let Some(batcher) = inner.batcher.take() else {
            return Ok(());
        };

        let (commands, command_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = runtime.spawn(run(
            batcher,
            Arc::clone(&self.client),
            self.tick_interval,
            command_rx,
            shutdown_rx,
        ));
        inner.running = Some(Running {
            commands,
            shutdown_tx,
            task,
        });
        Self::transition(&mut inner, SchedulerState::Running);
        info!(tick = ?self.tick_interval, transport = self.client.transport_name(), "pipeline started");
        Ok(())
    }

    /// Forces a flush of every view and the span buffer. Returns the number
    /// of bundles it closed.
    pub async fn flush(&self) -> Result<usize, PipelineError> {
        let commands = {
            let inner = self.lock();
            match (&inner.running, inner.state) {
                (Some(running), SchedulerState::Running) => running.commands.clone(),
                (_, state) => return Err(PipelineError::NotRunning(state)),
            }
        };
        let (done_tx, done_rx) = oneshot::channel();
        commands
            .send(Command::Flush(done_tx))
            .await
            .map_err(|_| PipelineError::TaskFailed("flush loop exited".into()))?;
        done_rx
            .await
            .map_err(|_| PipelineError::TaskFailed("flush request dropped".into()))
    }

    /// Stops with the configured `shutdown_timeout`.
    pub async fn stop(&self) -> Result<ShutdownReport, PipelineError> {
        self.stop_with_deadline(Instant::now() + self.shutdown_timeout).await
    }

    /// Stops ticking, flushes everything once more and waits for the
    /// exporter until `deadline`. Bundles still unsubmitted, queued or in
    /// flight at the deadline are abandoned and counted as dropped.
    pub async fn stop_with_deadline(&self, deadline: Instant) -> Result<ShutdownReport, PipelineError> {
        let running = {
            let mut inner = self.lock();
            match inner.state {
                SchedulerState::Idle => {
                    Self::transition(&mut inner, SchedulerState::Stopped);
                    info!("pipeline stopped before it was started");
                    return Ok(ShutdownReport::default());
                }
                SchedulerState::Draining | SchedulerState::Stopped => {
                    debug!(state = ?inner.state, "stop ignored");
                    return Ok(ShutdownReport::default());
                }
                SchedulerState::Running => {
                    Self::transition(&mut inner, SchedulerState::Draining);
                    inner.running.take()
                }
            }
        };

        let mut report = ShutdownReport::default();
        let mut result = Ok(());
        if let Some(Running {
            commands,
            shutdown_tx,
            task,
        }) = running
        {
            drop(commands);
            let _ = shutdown_tx.send(deadline);
            // returns by `deadline`: the loop bounds its final submit with it
            match task.await {
                Ok(last) => {
                    report.flushed = last.flushed;
                    report.abandoned += last.abandoned;
                }
                Err(e) => result = Err(PipelineError::TaskFailed(e.to_string())),
            }
        }

        let drain = self.client.shutdown(deadline).await;
        report.drained = drain.drained;
        report.abandoned += drain.abandoned;

        Self::transition(&mut self.lock(), SchedulerState::Stopped);
        info!(
            flushed = report.flushed,
            drained = report.drained,
            abandoned = report.abandoned,
            "pipeline stopped"
        );
        result.map(|()| report)
    }
}

/// Submits bundles in order until every one is queued or shutdown is
/// requested. On shutdown the bundles not yet queued are handed back.
async fn submit_until_shutdown(
    client: &ExporterClient,
    bundles: Vec<Bundle>,
    shutdown_rx: &mut oneshot::Receiver<Instant>,
) -> Option<Shutdown> {
    let mut bundles = bundles.into_iter();
    while let Some(bundle) = bundles.next() {
        tokio::select! {
            biased;

            deadline = &mut *shutdown_rx => {
                let mut held = vec![bundle];
                held.extend(bundles);
                debug!(held = held.len(), "shutdown while submitting");
                return Some(Shutdown::at(deadline, held));
            }

            permit = client.reserve() => match permit {
                Ok(permit) => permit.send(bundle),
                Err(_) => {
                    client.metrics().record_bundle_dropped();
                    warn!(sequence = bundle.sequence, "submit queue closed, dropping bundle");
                }
            },
        }
    }
    None
}

/// Submits bundles in order until `deadline`. Bundles that could not be
/// queued in time are counted as dropped and the count is returned.
async fn submit_by_deadline(client: &ExporterClient, bundles: Vec<Bundle>, deadline: Instant) -> usize {
    let total = bundles.len();
    for (i, bundle) in bundles.into_iter().enumerate() {
        if timeout_at(deadline, client.submit(bundle)).await.is_err() {
            let dropped = total - i;
            client.metrics().record_bundles_dropped(dropped as u64);
            warn!(dropped, "submit queue still full at the deadline");
            return dropped;
        }
        // Err(SubmitError::Closed) is already counted by the client
    }
    0
}

/// A stop request, with any closed bundles the loop had not yet queued.
struct Shutdown {
    deadline: Instant,
    held: Vec<Bundle>,
}

impl Shutdown {
    fn at(deadline: Result<Instant, oneshot::error::RecvError>, held: Vec<Bundle>) -> Self {
        // a dropped sender means the scheduler is gone: stop right away
        Self {
            deadline: deadline.unwrap_or_else(|_| Instant::now()),
            held,
        }
    }
}

/// The flush loop.
///
/// Every wait inside it also watches `shutdown_rx`, and the final submit is
/// bounded by the deadline, so the loop always returns by then.
async fn run(
    mut batcher: Batcher,
    client: Arc<ExporterClient>,
    tick: Duration,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown_rx: oneshot::Receiver<Instant>,
) -> FinalFlush {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let Shutdown { deadline, held } = loop {
        let stop = tokio::select! {
            _ = interval.tick() => {
                let bundles = batcher.collect(Instant::now());
                if bundles.is_empty() {
                    None
                } else {
                    debug!(bundles = bundles.len(), "tick closed bundles");
                    submit_until_shutdown(&client, bundles, &mut shutdown_rx).await
                }
            }

            Some(command) = commands.recv() => match command {
                Command::Flush(done) => {
                    let bundles = batcher.flush_all(Instant::now());
                    let closed = bundles.len();
                    let stop = submit_until_shutdown(&client, bundles, &mut shutdown_rx).await;
                    let _ = done.send(closed);
                    stop
                }
            },

            deadline = &mut shutdown_rx => Some(Shutdown::at(deadline, Vec::new())),
        };
        if let Some(stop) = stop {
            break stop;
        }
    };

    let bundles = batcher.flush_all(Instant::now());
    let flushed = bundles.len();
    debug!(flushed, held = held.len(), "final flush");

    let mut pending = held;
    pending.extend(bundles);
    let abandoned = submit_by_deadline(&client, pending, deadline).await;
    FinalFlush { flushed, abandoned }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::metric::{Aggregation, Measurement, MetricDefinition, Unit};
    use crate::metrics::PipelineMetrics;
    use crate::registry::Registry;
    use crate::resource::Resource;
    use crate::span::{Span, SpanKind};
    use crate::span_buffer::SpanBuffer;
    use crate::transport::ScriptedTransport;
    use crate::view::ViewDefinition;

    struct Fixture {
        aggregator: Arc<Aggregator>,
        buffer: Arc<SpanBuffer>,
        transport: Arc<ScriptedTransport>,
        metrics: Arc<PipelineMetrics>,
        scheduler: Scheduler,
    }

    fn fixture(config: &PipelineConfig, transport: ScriptedTransport) -> Fixture {
        let metrics = Arc::new(PipelineMetrics::new());
        let registry = Arc::new(Registry::new());
        registry
            .register_metric(MetricDefinition::new("hits", "", Unit::Dimensionless, Aggregation::Sum))
            .unwrap();
        registry.register_view(ViewDefinition::new("hits_total", "hits")).unwrap();
        let aggregator = Arc::new(Aggregator::new(registry, Arc::clone(&metrics)));
        let buffer = Arc::new(SpanBuffer::new(config.max_buffer_bytes, Arc::clone(&metrics)));
        let transport = Arc::new(transport);
        let client = Arc::new(ExporterClient::spawn(
            Arc::clone(&transport) as Arc<dyn crate::transport::TransportBoxed>,
            config,
            Arc::clone(&metrics),
            None,
        ));
        let batcher = Batcher::new(Arc::clone(&aggregator), Arc::clone(&buffer), config, Resource::empty());
        Fixture {
            aggregator,
            buffer,
            transport,
            metrics,
            scheduler: Scheduler::new(batcher, client, config),
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_flush_interval(Duration::from_secs(10))
            .with_bundle_delay_threshold(Duration::from_secs(2))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_transitions() {
        let fx = fixture(&config(), ScriptedTransport::new());
        assert_eq!(fx.scheduler.state(), SchedulerState::Idle);

        fx.scheduler.start().unwrap();
        fx.scheduler.start().unwrap();
        assert_eq!(fx.scheduler.state(), SchedulerState::Running);

        fx.scheduler.stop().await.unwrap();
        assert_eq!(fx.scheduler.state(), SchedulerState::Stopped);

        // both are no-ops once stopped
        assert_eq!(fx.scheduler.stop().await.unwrap(), ShutdownReport::default());
        fx.scheduler.start().unwrap();
        assert_eq!(fx.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_idle_exports_nothing() {
        let fx = fixture(&config(), ScriptedTransport::new());
        fx.aggregator.record(&Measurement::new("hits", 1.0));

        let report = fx.scheduler.stop().await.unwrap();
        assert_eq!(report, ShutdownReport::default());
        assert_eq!(fx.scheduler.state(), SchedulerState::Stopped);
        assert_eq!(fx.transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_everything() {
        let fx = fixture(&config(), ScriptedTransport::new());
        fx.scheduler.start().unwrap();

        fx.aggregator.record(&Measurement::new("hits", 2.0));
        fx.buffer.add(Span::new(1, 1, None, "op", SpanKind::Internal)).unwrap();

        let report = fx.scheduler.stop().await.unwrap();
        assert_eq!(report.flushed, 2);
        assert_eq!(report.abandoned, 0);
        assert_eq!(fx.transport.sent().len(), 2);
        assert_eq!(fx.metrics.bundles_exported_total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_export_aged_span_bundles() {
        let fx = fixture(&config(), ScriptedTransport::new());
        fx.scheduler.start().unwrap();
        fx.buffer.add(Span::new(1, 1, None, "op", SpanKind::Internal)).unwrap();

        // one tick picks the span up, the next one ages the bundle out
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(fx.transport.sent().len(), 1);
        assert_eq!(fx.scheduler.stop().await.unwrap().flushed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_demand() {
        let fx = fixture(&config(), ScriptedTransport::new());
        assert!(matches!(
            fx.scheduler.flush().await,
            Err(PipelineError::NotRunning(SchedulerState::Idle))
        ));

        fx.scheduler.start().unwrap();
        fx.aggregator.record(&Measurement::new("hits", 1.0));
        assert_eq!(fx.scheduler.flush().await.unwrap(), 1);

        fx.scheduler.stop().await.unwrap();
        assert!(fx.scheduler.flush().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded_by_deadline() {
        let fx = fixture(
            &config(),
            ScriptedTransport::new().with_delay(Duration::from_secs(60)),
        );
        fx.scheduler.start().unwrap();
        fx.aggregator.record(&Measurement::new("hits", 1.0));

        let started = Instant::now();
        let report = fx
            .scheduler
            .stop_with_deadline(started + Duration::from_secs(2))
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2100));
        assert_eq!(report.flushed, 1);
        assert_eq!(report.abandoned, 1);
        assert_eq!(fx.metrics.dropped_bundles_total(), 1);
        assert_eq!(fx.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_counts_bundles_stuck_behind_full_queue() {
        let config = config()
            .with_bundle_count_threshold(1)
            .with_submit_queue_capacity(1)
            .with_max_concurrent_exports(1);
        let fx = fixture(&config, ScriptedTransport::new().with_delay(Duration::from_secs(60)));
        for i in 1..=10 {
            fx.buffer.add(Span::new(1, i, None, "op", SpanKind::Internal)).unwrap();
        }

        // the first tick closes 10 bundles and blocks submitting them
        fx.scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        let report = fx
            .scheduler
            .stop_with_deadline(started + Duration::from_secs(2))
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2100));
        assert_eq!(fx.metrics.bundles_exported_total(), 0);
        assert_eq!(fx.metrics.dropped_bundles_total(), 10);
        assert_eq!(report.abandoned, 10);
        assert_eq!(fx.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_blocked_tick_still_flushes_views() {
        let config = config()
            .with_bundle_count_threshold(1)
            .with_submit_queue_capacity(1)
            .with_max_concurrent_exports(1);
        let fx = fixture(&config, ScriptedTransport::new().with_delay(Duration::from_millis(500)));
        for i in 1..=4 {
            fx.buffer.add(Span::new(1, i, None, "op", SpanKind::Internal)).unwrap();
        }
        fx.scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.aggregator.record(&Measurement::new("hits", 1.0));

        let report = fx.scheduler.stop().await.unwrap();

        // the metric bundle comes from the final flush, after the held spans
        assert_eq!(report.flushed, 1);
        assert_eq!(report.abandoned, 0);
        assert_eq!(fx.metrics.bundles_exported_total(), 5);
        assert_eq!(fx.metrics.dropped_bundles_total(), 0);
    }
}
