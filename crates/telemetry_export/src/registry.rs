//! Metric and view registry.
//!
//! A `Registry` is an explicit object with a lifecycle (`new`, `register_*`,
//! `close`) that is injected into an [`Aggregator`](crate::Aggregator). Nothing
//! is process-global, so independent pipelines can share a process and tests
//! can tear everything down.
//!
//! Writers serialize on an `RwLock`. The metric-to-views table the record
//! path reads is republished copy-on-write through an `ArcSwap` after every
//! change, so `record` takes no registry lock and never waits on a writer.

use crate::metric::{Aggregation, MetricDefinition};
use crate::view::{View, ViewDefinition};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Errors returned by registration calls.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    /// A metric with this name exists with a different definition.
    #[error("metric `{0}` is already registered with a different definition")]
    MetricConflict(String),

    /// A view refers to a metric that has not been registered.
    #[error("view `{view}` refers to unknown metric `{metric}`")]
    UnknownMetric { view: String, metric: String },

    /// A view with this name already exists.
    #[error("view `{0}` is already registered")]
    ViewConflict(String),

    /// No view with this name is registered.
    #[error("view `{0}` is not registered")]
    UnknownView(String),

    /// Distribution boundaries are not finite and strictly increasing.
    #[error("invalid bucket boundaries for `{0}`: must be finite and strictly increasing")]
    InvalidBoundaries(String),

    /// The registry has been closed.
    #[error("registry is closed")]
    Closed,
}

/// Views subscribed to one metric. Replaced, never mutated.
pub type Subscribers = Arc<[Arc<View>]>;

#[derive(Debug)]
struct MetricEntry {
    definition: Arc<MetricDefinition>,
    views: Subscribers,
}

#[derive(Debug, Default)]
struct RegistryState {
    metrics: HashMap<String, MetricEntry>,
    views: HashMap<String, Arc<View>>,
}

/// Registry of metric definitions and the views subscribed to them.
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
    subscriptions: ArcSwap<HashMap<String, Subscribers>>,
    closed: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a metric. Re-registering an identical definition returns the
    /// existing one.
    pub fn register_metric(&self, definition: MetricDefinition) -> Result<Arc<MetricDefinition>, RegistryError> {
        self.ensure_open()?;
        check_boundaries(&definition.name, &definition.aggregation)?;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = state.metrics.get(&definition.name) {
            if *entry.definition == definition {
                return Ok(Arc::clone(&entry.definition));
            }
            return Err(RegistryError::MetricConflict(definition.name));
        }

        let definition = Arc::new(definition);
        debug!(metric = %definition.name, aggregation = definition.aggregation.kind(), "registered metric");
        state.metrics.insert(
            definition.name.clone(),
            MetricEntry {
                definition: Arc::clone(&definition),
                views: Arc::from(Vec::new()),
            },
        );
        self.publish(&state);
        Ok(definition)
    }

    /// Registers a view. Only measurements recorded after this call reach it.
    pub fn register_view(&self, definition: ViewDefinition) -> Result<Arc<View>, RegistryError> {
        self.ensure_open()?;
        if let Some(aggregation) = &definition.aggregation {
            check_boundaries(&definition.name, aggregation)?;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.views.contains_key(&definition.name) {
            return Err(RegistryError::ViewConflict(definition.name));
        }
        let Some(entry) = state.metrics.get_mut(&definition.metric) else {
            return Err(RegistryError::UnknownMetric {
                view: definition.name,
                metric: definition.metric,
            });
        };

        let view = Arc::new(View::new(definition, Arc::clone(&entry.definition)));
        entry.views = entry.views.iter().cloned().chain([Arc::clone(&view)]).collect();
        state.views.insert(view.name().to_owned(), Arc::clone(&view));
        self.publish(&state);
        debug!(view = view.name(), metric = view.metric().name.as_str(), "registered view");
        Ok(view)
    }

    /// Removes a view together with its accumulators.
    pub fn unregister_view(&self, name: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let view = state
            .views
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownView(name.to_owned()))?;
        if let Some(entry) = state.metrics.get_mut(&view.metric().name) {
            entry.views = entry.views.iter().filter(|v| !Arc::ptr_eq(v, &view)).cloned().collect();
        }
        self.publish(&state);
        Ok(())
    }

    /// Whether a metric with this name is registered.
    pub fn has_metric(&self, name: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .contains_key(name)
    }

    /// Views subscribed to `metric`, or `None` if the metric is unknown.
    ///
    /// Lock-free; the returned slice is shared, not copied.
    pub fn views_for(&self, metric: &str) -> Option<Subscribers> {
        self.subscriptions.load().get(metric).cloned()
    }

    pub fn view(&self, name: &str) -> Option<Arc<View>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .views
            .get(name)
            .cloned()
    }

    /// Every registered view, in no particular order.
    pub fn views(&self) -> Vec<Arc<View>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .views
            .values()
            .cloned()
            .collect()
    }

    /// Drops every metric and view; later registrations fail and records
    /// become no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.metrics.clear();
        state.views.clear();
        self.publish(&state);
        debug!("registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Republishes the subscription table. Called with the write lock held,
    /// so publications happen in registration order.
    fn publish(&self, state: &RegistryState) {
        let table = state
            .metrics
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.views)))
            .collect();
        self.subscriptions.store(Arc::new(table));
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.is_closed() {
            Err(RegistryError::Closed)
        } else {
            Ok(())
        }
    }
}

fn check_boundaries(name: &str, aggregation: &Aggregation) -> Result<(), RegistryError> {
    match aggregation {
        Aggregation::Distribution(bounds) if !bounds.is_valid() => {
            Err(RegistryError::InvalidBoundaries(name.to_owned()))
        }
        _ => Ok(()),
    }
}
