//! Configuration surface of the instrumentation.
//!
//! Everything here is fixed at setup time. [`ApmConfig::validate`] runs once
//! from [`Apm::install`](crate::Apm::install) so misconfiguration surfaces at
//! application start instead of as silently missing telemetry.

use crate::endpoint::DEFAULT_ENDPOINT;
use crate::filter::{FilterConfig, MAX_SAMPLE_RATE};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Errors detected while validating an [`ApmConfig`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// `service_name` is empty or whitespace.
    #[error("service name is required")]
    MissingServiceName,
    /// Sample rate is negative or not a finite number.
    #[error("invalid sample rate {0}: expected a finite value >= 0")]
    InvalidSampleRate(f64),
    /// `batch_max_size` is zero.
    #[error("batch max size must be at least 1")]
    InvalidBatchSize,
    /// `flush_interval_ms` is zero.
    #[error("flush interval must be greater than zero")]
    InvalidFlushInterval,
    /// `export_timeout_ms` is zero.
    #[error("export timeout must be greater than zero")]
    InvalidTimeout,
    /// `max_concurrent_exports` or `max_queued_batches` is zero.
    #[error("{0} must be at least 1")]
    InvalidLimit(&'static str),
    /// A header name or value cannot be sent over HTTP.
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },
    /// The endpoint is not an absolute http(s) URL.
    #[error("invalid endpoint {0:?}: expected an http:// or https:// URL")]
    InvalidEndpoint(String),
}

/// Instrumentation settings.
///
/// Build with [`ApmConfig::new`] and the `with_*` methods, or deserialize it
/// from the host application's own configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApmConfig {
    /// Name of the instrumented service, used in the resource and the URL path.
    pub service_name: String,

    /// Collector base URL. Leaving the default enables in-cluster detection.
    ///
    /// Default: `http://localhost:3774/apm`
    pub endpoint: String,

    /// Extra HTTP headers sent with every export.
    pub headers: BTreeMap<String, String>,

    /// Spans per batch; reaching it triggers a flush.
    ///
    /// Default: 200
    pub batch_max_size: usize,

    /// Time between flushes when the size trigger is not reached.
    ///
    /// Default: 5000
    pub flush_interval_ms: u64,

    /// Requested sampling probability. Capped at 0.3.
    ///
    /// Default: 1.0
    pub sample_rate: f64,

    /// Forward error spans ahead of sampling.
    pub send_error_spans: bool,

    /// Per-second cap on forwarded error spans, unlimited when `None`.
    pub error_spans_per_second: Option<u32>,

    /// Spans slower than this are always kept; 0 disables the rule.
    pub slow_threshold_ms: u64,

    /// HTTP timeout of a single export, also bounding shutdown.
    ///
    /// Default: 5000
    pub export_timeout_ms: u64,

    /// Exports allowed in flight at once.
    ///
    /// Default: 4
    pub max_concurrent_exports: usize,

    /// Full batches waiting for the export worker before new ones are dropped.
    ///
    /// Default: 16
    pub max_queued_batches: usize,
}

impl Default for ApmConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            headers: BTreeMap::new(),
            batch_max_size: 200,
            flush_interval_ms: 5000,
            sample_rate: 1.0,
            send_error_spans: false,
            error_spans_per_second: None,
            slow_threshold_ms: 0,
            export_timeout_ms: 5000,
            max_concurrent_exports: 4,
            max_queued_batches: 16,
        }
    }
}

impl ApmConfig {
    /// Creates a configuration with defaults for the given service.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Sets the collector base URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Adds an HTTP header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the batch size trigger.
    pub fn with_batch_max_size(mut self, size: usize) -> Self {
        self.batch_max_size = size;
        self
    }

    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = millis(interval);
        self
    }

    /// Sets the requested sample rate.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Enables error-span forwarding, optionally capped per second.
    pub fn with_error_spans(mut self, per_second: Option<u32>) -> Self {
        self.send_error_spans = true;
        self.error_spans_per_second = per_second;
        self
    }

    /// Sets the slow-span threshold.
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold_ms = millis(threshold);
        self
    }

    /// Sets the export timeout.
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout_ms = millis(timeout);
        self
    }

    /// Sets the number of concurrent exports.
    pub fn with_max_concurrent_exports(mut self, max: usize) -> Self {
        self.max_concurrent_exports = max;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }

    /// Sample rate actually applied: the requested rate capped at [`MAX_SAMPLE_RATE`].
    pub fn effective_sample_rate(&self) -> f64 {
        self.sample_rate.min(MAX_SAMPLE_RATE)
    }

    /// Filter settings derived from this configuration.
    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            send_error_spans: self.send_error_spans,
            error_spans_per_second: self.error_spans_per_second,
            slow_threshold_ms: self.slow_threshold_ms,
            sample_rate: self.effective_sample_rate(),
        }
    }

    /// Checks every setting, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::MissingServiceName);
        }
        if !self.sample_rate.is_finite() || self.sample_rate < 0.0 {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.batch_max_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidFlushInterval);
        }
        if self.export_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.max_concurrent_exports == 0 {
            return Err(ConfigError::InvalidLimit("max_concurrent_exports"));
        }
        if self.max_queued_batches == 0 {
            return Err(ConfigError::InvalidLimit("max_queued_batches"));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.clone()));
        }
        for (name, value) in &self.headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_str(value).is_err() {
                return Err(ConfigError::InvalidHeader { name: name.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let config = ApmConfig::new("orders");
        assert_eq!(config.endpoint, "http://localhost:3774/apm");
        assert_eq!(config.batch_max_size, 200);
        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.export_timeout(), Duration::from_secs(5));
        assert_eq!(config.sample_rate, 1.0);
        assert!(!config.send_error_spans);
        assert_eq!(config.error_spans_per_second, None);
        assert_eq!(config.slow_threshold_ms, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_builders_saturate() {
        let config = ApmConfig::new("orders")
            .with_flush_interval(Duration::MAX)
            .with_slow_threshold(Duration::from_millis(250))
            .with_export_timeout(Duration::MAX);
        assert_eq!(config.flush_interval_ms, u64::MAX);
        assert_eq!(config.slow_threshold_ms, 250);
        assert_eq!(config.export_timeout_ms, u64::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_service_name() {
        assert_eq!(ApmConfig::default().validate(), Err(ConfigError::MissingServiceName));
        assert_eq!(ApmConfig::new("   ").validate(), Err(ConfigError::MissingServiceName));
    }

    #[test]
    fn test_invalid_sample_rate() {
        let config = ApmConfig::new("orders").with_sample_rate(-0.1);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSampleRate(_))));

        let config = ApmConfig::new("orders").with_sample_rate(f64::NAN);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSampleRate(_))));
    }

    #[test]
    fn test_invalid_limits() {
        let config = ApmConfig::new("orders").with_batch_max_size(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidBatchSize));

        let config = ApmConfig::new("orders").with_flush_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::InvalidFlushInterval));

        let config = ApmConfig::new("orders").with_export_timeout(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout));

        let config = ApmConfig::new("orders").with_max_concurrent_exports(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLimit("max_concurrent_exports"))
        );
    }

    #[test]
    fn test_invalid_header() {
        let config = ApmConfig::new("orders").with_header("bad header", "x");
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHeader {
                name: "bad header".to_string()
            })
        );

        let config = ApmConfig::new("orders").with_header("x-api-key", "line\nbreak");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_endpoint() {
        let config = ApmConfig::new("orders").with_endpoint("localhost:3774/apm");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ApmConfig = serde_json::from_str(
            r#"{"service_name": "orders", "sample_rate": 0.5, "send_error_spans": true, "error_spans_per_second": 10}"#,
        )
        .unwrap();
        assert_eq!(config.service_name, "orders");
        assert_eq!(config.batch_max_size, 200);
        assert_eq!(config.effective_sample_rate(), 0.3);
        assert_eq!(config.error_spans_per_second, Some(10));
    }

    #[test]
    fn test_filter_config_uses_effective_rate() {
        let filter = ApmConfig::new("orders").with_sample_rate(0.8).filter_config();
        assert_eq!(filter.sample_rate, 0.3);
        assert!(filter.is_active());
    }

    proptest! {
        #[test]
        fn prop_rates_at_or_above_one_clamp_to_cap(rate in 1.0f64..1e9) {
            let config = ApmConfig::new("orders").with_sample_rate(rate);
            prop_assert!(config.validate().is_ok());
            prop_assert_eq!(config.effective_sample_rate(), 0.3);
        }

        #[test]
        fn prop_effective_rate_is_min_of_requested_and_cap(rate in 0.0f64..10.0) {
            let config = ApmConfig::new("orders").with_sample_rate(rate);
            prop_assert_eq!(config.effective_sample_rate(), rate.min(0.3));
        }
    }
}
