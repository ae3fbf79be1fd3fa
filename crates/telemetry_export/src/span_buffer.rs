//! Byte-bounded buffer of completed spans awaiting export.

use crate::metrics::PipelineMetrics;
use crate::span::Span;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

/// The span did not fit in the buffer and was dropped.
///
/// Returned for visibility only; the drop is already counted in
/// `dropped_spans_total` and callers are free to ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("span buffer full: {span_bytes} bytes would exceed {max_bytes} (buffered {buffered_bytes})")]
pub struct CapacityExceeded {
    pub span_bytes: usize,
    pub buffered_bytes: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    spans: Vec<Span>,
    bytes: usize,
}

/// Completed spans pending export, bounded by their estimated byte size.
#[derive(Debug)]
pub struct SpanBuffer {
    inner: Mutex<Inner>,
    max_bytes: usize,
    metrics: Arc<PipelineMetrics>,
}

impl SpanBuffer {
    pub fn new(max_bytes: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_bytes,
            metrics,
        }
    }

    /// Appends a completed span if it fits within the byte budget.
    ///
    /// Unsampled spans are discarded without touching the buffer.
    pub fn add(&self, span: Span) -> Result<(), CapacityExceeded> {
        if !span.sampled {
            self.metrics.record_span_unsampled();
            return Ok(());
        }

        let span_bytes = span.estimated_size();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.bytes + span_bytes > self.max_bytes {
            let err = CapacityExceeded {
                span_bytes,
                buffered_bytes: inner.bytes,
                max_bytes: self.max_bytes,
            };
            drop(inner);
            self.metrics.record_span_dropped();
            debug!(span = %span.name, bytes = span_bytes, "span buffer full, dropping span");
            return Err(err);
        }
        inner.bytes += span_bytes;
        inner.spans.push(span);
        drop(inner);
        self.metrics.record_span_buffered();
        Ok(())
    }

    /// Removes and returns every buffered span in insertion order.
    pub fn drain(&self) -> Vec<Span> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.bytes = 0;
        mem::take(&mut inner.spans)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanKind;

    fn span(i: u64) -> Span {
        Span::new(1, i, None, "op", SpanKind::Internal)
    }

    #[test]
    fn test_add_and_drain() {
        let buffer = SpanBuffer::new(1 << 20, Arc::new(PipelineMetrics::new()));
        for i in 0..5 {
            buffer.add(span(i)).unwrap();
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.buffered_bytes(), 5 * span(0).estimated_size());

        let drained = buffer.drain();
        assert_eq!(drained.iter().map(|s| s.span_id).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.buffered_bytes(), 0);
    }

    #[test]
    fn test_overflow_drops_exactly_the_excess() {
        let metrics = Arc::new(PipelineMetrics::new());
        let size = span(0).estimated_size();
        let buffer = SpanBuffer::new(size * 3, Arc::clone(&metrics));

        let results: Vec<_> = (0..7).map(|i| buffer.add(span(i))).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert_eq!(metrics.dropped_spans_total(), 4);
        assert_eq!(buffer.len(), 3);

        let err = results[3].unwrap_err();
        assert_eq!(err.buffered_bytes, size * 3);
        assert_eq!(err.max_bytes, size * 3);

        // draining frees the budget again
        buffer.drain();
        assert!(buffer.add(span(8)).is_ok());
    }

    #[test]
    fn test_unsampled_spans_are_not_buffered() {
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = SpanBuffer::new(1 << 20, Arc::clone(&metrics));
        let mut s = span(1);
        s.sampled = false;
        assert!(buffer.add(s).is_ok());
        assert!(buffer.is_empty());
        assert_eq!(metrics.spans_unsampled_total(), 1);
        assert_eq!(metrics.dropped_spans_total(), 0);
    }
}
