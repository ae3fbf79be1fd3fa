//! Errors surfaced by the pipeline's lifecycle calls.

use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::scheduler::SchedulerState;
use thiserror::Error;

/// Errors from building, starting, flushing or stopping a pipeline.
///
/// Producer-side calls (`record`, `end_span`) never return these.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Registering the self-monitoring views failed.
    #[error("registration failed: {0}")]
    Registry(#[from] RegistryError),

    /// The operation needs a running pipeline.
    #[error("pipeline is not running (state: {0:?})")]
    NotRunning(SchedulerState),

    /// `start()` was called outside a tokio runtime.
    #[error("no tokio runtime: {0}")]
    NoRuntime(String),

    /// The flush loop died before completing the request.
    #[error("flush loop failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    /// Returns `true` if retrying the call later may succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotRunning(SchedulerState::Idle))
    }

    /// Returns `true` if the error is a startup misconfiguration.
    #[inline]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Registry(_))
    }
}
