//! Pipeline configuration.
//!
//! Loaded from JSON (durations in humantime form such as `"2s"`), built with
//! the chainable `with_*` setters, or taken from [`Default`]. Thresholds are
//! checked by [`PipelineConfig::validate`] before anything is started.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A threshold or limit has an unusable value.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration file could not be read.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Configuration for the aggregation and export pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How often registered views are snapshotted.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Maximum number of items in one bundle.
    pub bundle_count_threshold: usize,
    /// Maximum age of an open bundle before it is closed.
    #[serde(with = "humantime_serde")]
    pub bundle_delay_threshold: Duration,
    /// Maximum estimated byte size of one bundle.
    pub bundle_byte_threshold: usize,
    /// Upper bound on bytes held by the span buffer.
    pub max_buffer_bytes: usize,
    /// Total transport attempts per bundle, the first one included.
    pub max_retry_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Cap on the delay between retries.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Growth factor applied to the backoff after each retry.
    pub backoff_multiplier: f64,
    /// How long `stop()` waits for in-flight exports.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Size of the export worker pool.
    pub max_concurrent_exports: usize,
    /// Capacity of the bounded submit queue in front of the worker pool.
    pub submit_queue_capacity: usize,
    /// Fraction of traces sampled, in `[0, 1]`.
    pub trace_sample_ratio: f64,
    /// Opaque destination handed to the transport.
    pub endpoint: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            bundle_count_threshold: 10_000,
            bundle_delay_threshold: Duration::from_secs(2),
            bundle_byte_threshold: 1024 * 1024,
            max_buffer_bytes: 20 * 1024 * 1024,
            max_retry_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            shutdown_timeout: Duration::from_secs(5),
            max_concurrent_exports: 4,
            submit_queue_capacity: 64,
            trace_sample_ratio: 1.0,
            endpoint: None,
        }
    }
}

impl PipelineConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Checks every threshold. Called by the pipeline builder before start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid("flush_interval", "must be non-zero"));
        }
        if self.bundle_count_threshold == 0 {
            return Err(ConfigError::invalid("bundle_count_threshold", "must be at least 1"));
        }
        if self.bundle_delay_threshold.is_zero() {
            return Err(ConfigError::invalid("bundle_delay_threshold", "must be non-zero"));
        }
        if self.bundle_byte_threshold == 0 {
            return Err(ConfigError::invalid("bundle_byte_threshold", "must be at least 1"));
        }
        if self.max_buffer_bytes == 0 {
            return Err(ConfigError::invalid("max_buffer_bytes", "must be at least 1"));
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::invalid(
                "max_retry_attempts",
                "must allow at least the initial attempt",
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::invalid(
                "initial_backoff",
                format!(
                    "{:?} exceeds max_backoff {:?}",
                    self.initial_backoff, self.max_backoff
                ),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                format!("{} is not a finite value >= 1.0", self.backoff_multiplier),
            ));
        }
        if self.max_concurrent_exports == 0 {
            return Err(ConfigError::invalid("max_concurrent_exports", "must be at least 1"));
        }
        if self.submit_queue_capacity == 0 {
            return Err(ConfigError::invalid("submit_queue_capacity", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.trace_sample_ratio) {
            return Err(ConfigError::invalid(
                "trace_sample_ratio",
                format!("{} is outside [0, 1]", self.trace_sample_ratio),
            ));
        }
        Ok(())
    }

    /// Interval at which the scheduler wakes up: often enough to honour both
    /// the snapshot cadence and the bundle age limit.
    pub fn tick_interval(&self) -> Duration {
        self.flush_interval.min(self.bundle_delay_threshold)
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_bundle_count_threshold(mut self, count: usize) -> Self {
        self.bundle_count_threshold = count;
        self
    }

    pub fn with_bundle_delay_threshold(mut self, delay: Duration) -> Self {
        self.bundle_delay_threshold = delay;
        self
    }

    pub fn with_bundle_byte_threshold(mut self, bytes: usize) -> Self {
        self.bundle_byte_threshold = bytes;
        self
    }

    pub fn with_max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Sets initial delay, cap and multiplier of the retry backoff.
    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_exports(mut self, workers: usize) -> Self {
        self.max_concurrent_exports = workers;
        self
    }

    pub fn with_submit_queue_capacity(mut self, capacity: usize) -> Self {
        self.submit_queue_capacity = capacity;
        self
    }

    pub fn with_trace_sample_ratio(mut self, ratio: f64) -> Self {
        self.trace_sample_ratio = ratio;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}
