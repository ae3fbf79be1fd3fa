//! Transports: the I/O edge of the exporter.
//!
//! A transport receives a closed [`Bundle`] and reports how much of it the
//! backend accepted. It never retries on its own; retry, backoff and drop
//! accounting live in the [`ExporterClient`](crate::ExporterClient).
//!
//! Uses native async fn in traits instead of `#[async_trait]`. Since
//! `impl Future` return types are not object-safe, [`TransportBoxed`] is the
//! `dyn`-compatible twin, implemented for every [`Transport`].

use crate::bundle::{Bundle, Payload};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint could not be reached (connection refused, reset, 503).
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// Local I/O failed while writing the bundle.
    #[error("i/o error: {0}")]
    Io(String),

    /// The backend refused the whole bundle (bad request, quota, auth).
    #[error("bundle rejected: {0}")]
    Rejected(String),

    /// The bundle could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The backend answered, but its accounting does not cover every item.
    #[error("delivery attributed {accepted} accepted + {rejected} rejected of {expected} items")]
    Unattributed {
        accepted: usize,
        rejected: usize,
        expected: usize,
    },
}

impl TransportError {
    /// Returns true if sending the same bundle again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Unavailable(_)
                | TransportError::Timeout
                | TransportError::Io(_)
                | TransportError::Unattributed { .. }
        )
    }
}

/// One item the backend refused, by position in the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub index: usize,
    pub reason: String,
}

/// What the backend did with a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub accepted: usize,
    pub rejected: Vec<Rejection>,
}

impl Delivery {
    /// Every one of `count` items accepted.
    pub fn all(count: usize) -> Self {
        Self {
            accepted: count,
            rejected: Vec::new(),
        }
    }

    pub fn partial(accepted: usize, rejected: Vec<Rejection>) -> Self {
        Self { accepted, rejected }
    }

    /// True if the delivery accounts for each of the `len` items exactly once.
    pub fn is_attributed(&self, len: usize) -> bool {
        self.accepted + self.rejected.len() == len && self.rejected.iter().all(|r| r.index < len)
    }
}

/// Sends bundles to a backend.
pub trait Transport: Send + Sync {
    /// Delivers one bundle.
    fn send(&self, bundle: &Bundle) -> impl Future<Output = Result<Delivery, TransportError>> + Send;

    /// Returns the transport name for logs.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    fn send_boxed<'a>(
        &'a self,
        bundle: &'a Bundle,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, TransportError>> + Send + 'a>>;

    fn name(&self) -> &str;
}

impl<T: Transport> TransportBoxed for T {
    fn send_boxed<'a>(
        &'a self,
        bundle: &'a Bundle,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, TransportError>> + Send + 'a>> {
        Box::pin(self.send(bundle))
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}

/// Accepts and discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    async fn send(&self, bundle: &Bundle) -> Result<Delivery, TransportError> {
        Ok(Delivery::all(bundle.len()))
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Logs a one-line summary of each bundle.
#[derive(Debug, Clone, Default)]
pub struct LogTransport {
    verbose: bool,
}

impl LogTransport {
    /// With `verbose`, every item is logged at debug level too.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Transport for LogTransport {
    async fn send(&self, bundle: &Bundle) -> Result<Delivery, TransportError> {
        info!(
            sequence = bundle.sequence,
            kind = bundle.payload.kind(),
            items = bundle.len(),
            bytes = bundle.byte_size,
            reason = ?bundle.close_reason,
            "exporting bundle"
        );
        if self.verbose {
            match &bundle.payload {
                Payload::Metrics(series) => {
                    for ts in series {
                        debug!(view = %ts.view, labels = ?ts.labels, data = ?ts.data, "time series");
                    }
                }
                Payload::Spans(spans) => {
                    for span in spans {
                        debug!(
                            trace_id = %format!("{:032x}", span.trace_id),
                            span_id = %format!("{:016x}", span.span_id),
                            name = %span.name,
                            duration_ns = span.duration_nanos(),
                            status = ?span.status,
                            "span"
                        );
                    }
                }
            }
        }
        Ok(Delivery::all(bundle.len()))
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Appends each bundle as one JSON line, for local development.
#[derive(Debug, Clone)]
pub struct JsonFileTransport {
    path: PathBuf,
}

impl JsonFileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Transport for JsonFileTransport {
    async fn send(&self, bundle: &Bundle) -> Result<Delivery, TransportError> {
        let mut line =
            serde_json::to_vec(bundle).map_err(|e| TransportError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        file.write_all(&line)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        file.flush().await.map_err(|e| TransportError::Io(e.to_string()))?;

        Ok(Delivery::all(bundle.len()))
    }

    fn name(&self) -> &str {
        "json_file"
    }
}

/// Test transport: replays scripted responses, then accepts everything.
/// Records every bundle it was handed and the peak number of concurrent sends.
#[cfg(test)]
pub struct ScriptedTransport {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<Delivery, TransportError>>>,
    delay: std::time::Duration,
    sent: std::sync::Mutex<Vec<Bundle>>,
    calls: std::sync::atomic::AtomicUsize,
    in_flight: std::sync::atomic::AtomicUsize,
    peak_in_flight: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            delay: std::time::Duration::ZERO,
            sent: std::sync::Mutex::new(Vec::new()),
            calls: std::sync::atomic::AtomicUsize::new(0),
            in_flight: std::sync::atomic::AtomicUsize::new(0),
            peak_in_flight: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails `n` times with `error`, then accepts.
    pub fn failing(n: usize, error: TransportError) -> Self {
        Self::new().with_responses((0..n).map(|_| Err(error.clone())))
    }

    pub fn with_responses<I>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = Result<Delivery, TransportError>>,
    {
        self.responses.lock().unwrap().extend(responses);
        self
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Bundle> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Transport for ScriptedTransport {
    async fn send(&self, bundle: &Bundle) -> Result<Delivery, TransportError> {
        use std::sync::atomic::Ordering;

        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.responses.lock().unwrap().pop_front();
        let result = scripted.unwrap_or_else(|| Ok(Delivery::all(bundle.len())));
        if result.is_ok() {
            self.sent.lock().unwrap().push(bundle.clone());
        }
        result
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
pub(crate) fn test_bundle(sequence: u64, items: usize) -> Bundle {
    use crate::bundle::CloseReason;
    use crate::resource::Resource;
    use crate::span::{Span, SpanKind};

    let spans: Vec<Span> = (0..items as u64)
        .map(|i| Span::new(1, i + 1, None, "op", SpanKind::Internal))
        .collect();
    Bundle {
        sequence,
        byte_size: spans.iter().map(Span::estimated_size).sum(),
        payload: Payload::Spans(spans),
        close_reason: CloseReason::Flush,
        resource: Resource::empty(),
        created_at: std::time::SystemTime::now(),
    }
}
