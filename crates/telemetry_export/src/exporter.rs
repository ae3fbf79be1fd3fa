//! Exporter client: bounded submit queue, worker pool, retry.
//!
//! ```text
//!  Scheduler ──submit()──► [ bounded mpsc ] ──► dispatcher ──spawn──► worker ─► Transport
//!                (awaits when full)            (Semaphore: max_concurrent_exports permits)
//! ```
//!
//! Backpressure stops at the submit queue: only the flush loop ever waits on
//! it, never a producer thread. Every worker owns one bundle and runs the
//! retry loop for it; a bundle that runs out of attempts, or fails with a
//! non-retryable error, is dropped and counted.

use crate::bundle::Bundle;
use crate::config::PipelineConfig;
use crate::invariants::{debug_assert_attempts_bounded, debug_assert_delivery_attributed};
use crate::metrics::PipelineMetrics;
use crate::transport::{Delivery, TransportBoxed, TransportError};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Why a bundle was not exported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    /// Every allowed attempt failed with a retryable error.
    #[error("export failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },

    /// The transport failed in a way retrying cannot fix.
    #[error("export failed permanently: {0}")]
    Permanent(TransportError),

    /// The client has been shut down.
    #[error("exporter client is closed")]
    Closed,
}

impl ExportError {
    /// The transport error behind the failure, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            ExportError::RetriesExhausted { last, .. } => Some(last),
            ExportError::Permanent(err) => Some(err),
            ExportError::Closed => None,
        }
    }
}

/// Errors from [`ExporterClient::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The submit queue no longer accepts bundles. The bundle was dropped.
    #[error("submit queue is closed")]
    Closed,
}

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per bundle, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.backoff_multiplier,
            jitter: 0.2,
        }
    }

    /// A policy without jitter, for deterministic timing.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retry number `retry` (1-based), before jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    /// Backoff with up to `jitter` of it shaved off at random. Never above
    /// `max_backoff`.
    pub fn jittered_backoff(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 - self.jitter.min(1.0) * rand::thread_rng().gen::<f64>();
        base.mul_f64(factor)
    }
}

// =============================================================================
// OBSERVER HOOK
// =============================================================================

/// Result of one transport request, as seen by an [`ExportObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Accepted,
    /// Attributed partial acceptance.
    Partial { rejected: usize },
    Failed,
}

/// Hook invoked once per transport request, retries included.
pub trait ExportObserver: Send + Sync {
    fn on_request(&self, items: usize, outcome: RequestOutcome);
}

// =============================================================================
// CLIENT
// =============================================================================

/// What happened to the bundles still queued or in flight at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Bundles taken from the queue during the drain.
    pub drained: usize,
    /// Bundles queued or in flight when the deadline passed.
    pub abandoned: usize,
}

struct Shared {
    transport: Arc<dyn TransportBoxed>,
    policy: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
    observer: Option<Arc<dyn ExportObserver>>,
}

impl Shared {
    /// Runs the retry loop for one bundle.
    async fn deliver(&self, bundle: &Bundle) -> Result<Delivery, ExportError> {
        let len = bundle.len();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug_assert_attempts_bounded!(attempt, max_attempts);

            let result = match self.transport.send_boxed(bundle).await {
                Ok(delivery) if delivery.is_attributed(len) => Ok(delivery),
                Ok(delivery) => Err(TransportError::Unattributed {
                    accepted: delivery.accepted,
                    rejected: delivery.rejected.len(),
                    expected: len,
                }),
                Err(err) => Err(err),
            };

            match result {
                Ok(delivery) => {
                    let rejected = delivery.rejected.len();
                    debug_assert_delivery_attributed!(delivery.accepted, rejected, len);
                    let outcome = if rejected == 0 {
                        RequestOutcome::Accepted
                    } else {
                        RequestOutcome::Partial { rejected }
                    };
                    self.observe(len, outcome);
                    self.metrics.record_exported(delivery.accepted as u64, rejected as u64);
                    if rejected > 0 {
                        debug!(
                            sequence = bundle.sequence,
                            accepted = delivery.accepted,
                            rejected,
                            "bundle partially accepted"
                        );
                    }
                    return Ok(delivery);
                }
                Err(err) => {
                    self.observe(len, RequestOutcome::Failed);
                    self.metrics.record_failure();

                    if !err.is_retryable() {
                        self.metrics.record_bundle_dropped();
                        warn!(sequence = bundle.sequence, items = len, error = %err, "dropping bundle");
                        return Err(ExportError::Permanent(err));
                    }
                    if attempt >= max_attempts {
                        self.metrics.record_bundle_dropped();
                        warn!(
                            sequence = bundle.sequence,
                            items = len,
                            attempts = attempt,
                            error = %err,
                            "dropping bundle after exhausting retries"
                        );
                        return Err(ExportError::RetriesExhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    let delay = self.policy.jittered_backoff(attempt);
                    self.metrics.record_retry();
                    debug!(
                        sequence = bundle.sequence,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "export failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn observe(&self, items: usize, outcome: RequestOutcome) {
        if let Some(observer) = &self.observer {
            observer.on_request(items, outcome);
        }
    }
}

/// Sends bundles through a [`Transport`](crate::Transport) on a bounded
/// worker pool.
///
/// Must be created inside a tokio runtime: construction spawns the
/// dispatcher task.
pub struct ExporterClient {
    shared: Arc<Shared>,
    submit_tx: mpsc::Sender<Bundle>,
    shutdown_tx: Mutex<Option<oneshot::Sender<Instant>>>,
    dispatcher: Mutex<Option<JoinHandle<DrainReport>>>,
    closed: AtomicBool,
}

impl ExporterClient {
    pub fn spawn(
        transport: Arc<dyn TransportBoxed>,
        config: &PipelineConfig,
        metrics: Arc<PipelineMetrics>,
        observer: Option<Arc<dyn ExportObserver>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            transport,
            policy: RetryPolicy::from_config(config),
            metrics,
            observer,
        });
        let (submit_tx, submit_rx) = mpsc::channel(config.submit_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&shared),
            submit_rx,
            shutdown_rx,
            config.max_concurrent_exports.max(1),
        ));

        Self {
            shared,
            submit_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    pub fn transport_name(&self) -> &str {
        self.shared.transport.name()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.shared.metrics
    }

    /// Queues a bundle for export, waiting while the queue is full.
    pub async fn submit(&self, bundle: Bundle) -> Result<(), SubmitError> {
        match self.reserve().await {
            Ok(permit) => {
                permit.send(bundle);
                Ok(())
            }
            Err(err) => {
                self.shared.metrics.record_bundle_dropped();
                warn!(sequence = bundle.sequence, "submit queue closed, dropping bundle");
                Err(err)
            }
        }
    }

    /// Waits for a free slot in the submit queue without handing over a
    /// bundle yet. Dropping the future or the permit gives the slot back.
    ///
    /// On `Err` nothing is counted; the caller still owns its bundle.
    pub async fn reserve(&self) -> Result<SubmitPermit<'_>, SubmitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SubmitError::Closed);
        }
        let permit = self.submit_tx.reserve().await.map_err(|_| SubmitError::Closed)?;
        Ok(SubmitPermit {
            permit,
            metrics: &self.shared.metrics,
        })
    }

    /// Exports a bundle on the caller's task, retrying per policy.
    pub async fn export(&self, bundle: &Bundle) -> Result<Delivery, ExportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExportError::Closed);
        }
        self.shared.deliver(bundle).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting bundles and drains the queue until `deadline`.
    ///
    /// Whatever is still queued or in flight at the deadline is aborted and
    /// counted in `dropped_bundles_total`. Calling it twice returns an empty
    /// report.
    pub async fn shutdown(&self, deadline: Instant) -> DrainReport {
        if self.closed.swap(true, Ordering::AcqRel) {
            return DrainReport::default();
        }
        if let Some(tx) = self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(deadline);
        }
        let handle = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                error!(error = %e, "export dispatcher panicked");
                DrainReport::default()
            }),
            None => DrainReport::default(),
        }
    }
}

/// A reserved slot in the submit queue, from [`ExporterClient::reserve`].
pub struct SubmitPermit<'a> {
    permit: mpsc::Permit<'a, Bundle>,
    metrics: &'a PipelineMetrics,
}

impl SubmitPermit<'_> {
    /// Queues `bundle` into the reserved slot. Never waits.
    pub fn send(self, bundle: Bundle) {
        self.permit.send(bundle);
        self.metrics.record_submitted();
    }
}

fn spawn_export(
    tasks: &mut JoinSet<()>,
    shared: &Arc<Shared>,
    bundle: Bundle,
    permit: OwnedSemaphorePermit,
) {
    let shared = Arc::clone(shared);
    tasks.spawn(async move {
        // failures are already logged and counted by the retry loop
        let _ = shared.deliver(&bundle).await;
        drop(permit);
    });
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "export task panicked");
        }
    }
}

/// Dispatcher task: feeds the worker pool until shutdown, then drains.
async fn dispatch(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Bundle>,
    mut shutdown_rx: oneshot::Receiver<Instant>,
    max_concurrent: usize,
) -> DrainReport {
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut queued: VecDeque<Bundle> = VecDeque::new();

    let deadline = loop {
        tokio::select! {
            Some(result) = tasks.join_next(), if !tasks.is_empty() => log_join(result),

            received = rx.recv() => {
                let Some(bundle) = received else {
                    // every sender is gone; nothing more will arrive
                    break None;
                };
                // waiting for a free worker is what pushes back on submit()
                tokio::select! {
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => spawn_export(&mut tasks, &shared, bundle, permit),
                        Err(_) => {
                            queued.push_back(bundle);
                            break None;
                        }
                    },
                    deadline = &mut shutdown_rx => {
                        queued.push_back(bundle);
                        break deadline.ok();
                    }
                }
            }

            deadline = &mut shutdown_rx => break deadline.ok(),
        }
    };

    rx.close();
    while let Ok(bundle) = rx.try_recv() {
        queued.push_back(bundle);
    }
    let mut report = DrainReport {
        drained: queued.len(),
        abandoned: 0,
    };
    debug!(queued = queued.len(), in_flight = tasks.len(), "draining exporter");

    let drain = async {
        while !queued.is_empty() {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            if let Some(bundle) = queued.pop_front() {
                spawn_export(&mut tasks, &shared, bundle, permit);
            }
        }
        while let Some(result) = tasks.join_next().await {
            log_join(result);
        }
    };
    let finished = match deadline {
        Some(deadline) => timeout_at(deadline, drain).await.is_ok(),
        None => {
            drain.await;
            true
        }
    };

    if !finished {
        tasks.abort_all();
        let mut abandoned = queued.len();
        while let Some(result) = tasks.join_next().await {
            match result {
                Err(e) if e.is_cancelled() => abandoned += 1,
                other => log_join(other),
            }
        }
        shared.metrics.record_bundles_dropped(abandoned as u64);
        warn!(abandoned, "shutdown deadline passed, abandoning exports");
        report.abandoned = abandoned;
    } else {
        info!(drained = report.drained, "exporter drained");
    }
    report
}
