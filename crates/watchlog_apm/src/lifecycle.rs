//! Lifecycle Controller
//!
//! [`Apm`] wires the pipeline together at application start and tears it down
//! at shutdown:
//!
//! ```rust,ignore
//! let apm = Apm::install(ApmConfig::new("orders").with_error_spans(Some(10))).await?;
//!
//! // register with the host tracing SDK
//! sdk.add_span_processor(apm.span_processor());
//!
//! // ... serve requests ...
//!
//! apm.shutdown().await?;
//! ```

use crate::batch::BatchConfig;
use crate::config::{ApmConfig, ConfigError};
use crate::endpoint::{collector_url, ClusterProbe, DEFAULT_ENDPOINT};
use crate::exporter::{ExportError, ExporterConfig, HttpJsonExporter, SpanExporterBoxed};
use crate::filter::SpanFilter;
use crate::processor::{BatchSpanProcessor, ExportMetrics, ProcessorConfig, ProcessorError, SpanProcessor};
use crate::sampler::TraceIdRatioSampler;
use crate::span::{Resource, SpanRecord};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Extra time granted to shutdown beyond one export timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Errors surfaced while installing or stopping the instrumentation
#[derive(Debug, Error)]
pub enum ApmError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("exporter setup failed: {0}")]
    Exporter(#[from] ExportError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

/// Installed instrumentation: filter, batching and export for one service.
pub struct Apm {
    processor: Arc<BatchSpanProcessor>,
    resource: Arc<Resource>,
    sampler: TraceIdRatioSampler,
    collector_url: Option<String>,
    flush_timeout: Duration,
}

impl Apm {
    /// Validates `config`, resolves the collector endpoint and starts the
    /// background export worker.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn install(config: ApmConfig) -> Result<Self, ApmError> {
        Self::install_with_probe(config, &ClusterProbe::default()).await
    }

    /// Same as [`Apm::install`] with a custom environment probe.
    pub async fn install_with_probe(config: ApmConfig, probe: &ClusterProbe) -> Result<Self, ApmError> {
        config.validate()?;

        let base = probe.resolve_base(DEFAULT_ENDPOINT, Some(&config.endpoint)).await;
        let url = collector_url(&base, &config.service_name);
        let exporter_config = ExporterConfig::new(url.clone(), &config.headers, config.export_timeout())?;
        let exporter = Arc::new(HttpJsonExporter::new(exporter_config)?);

        tracing::info!(
            service = %config.service_name,
            url = %url,
            sample_rate = config.effective_sample_rate(),
            "watchlog apm installed"
        );

        let mut apm = Self::start(&config, exporter);
        apm.collector_url = Some(url);
        Ok(apm)
    }

    /// Installs the pipeline in front of an arbitrary exporter; no endpoint
    /// resolution takes place.
    pub fn with_exporter(config: ApmConfig, exporter: Arc<dyn SpanExporterBoxed>) -> Result<Self, ApmError> {
        config.validate()?;
        Ok(Self::start(&config, exporter))
    }

    fn start(config: &ApmConfig, exporter: Arc<dyn SpanExporterBoxed>) -> Self {
        let flush_timeout = config.export_timeout() + SHUTDOWN_GRACE;
        let processor_config = ProcessorConfig {
            batch_config: BatchConfig {
                max_batch_size: config.batch_max_size,
                flush_interval: config.flush_interval(),
            },
            max_concurrent_exports: config.max_concurrent_exports,
            max_queued_batches: config.max_queued_batches,
            shutdown_timeout: flush_timeout,
        };
        let filter = SpanFilter::new(config.filter_config());

        Self {
            processor: Arc::new(BatchSpanProcessor::new(processor_config, Some(filter), exporter)),
            resource: Arc::new(Resource::for_service(&config.service_name)),
            sampler: TraceIdRatioSampler::new(config.effective_sample_rate()),
            collector_url: None,
            flush_timeout,
        }
    }

    /// Span-completion hook to register with the host tracing SDK.
    pub fn span_processor(&self) -> Arc<dyn SpanProcessor> {
        self.processor.clone()
    }

    /// Forwards one finished span into the pipeline.
    pub fn on_span_finished(&self, span: SpanRecord) {
        self.processor.on_span_finished(span);
    }

    /// Resource describing this service, for span records built by the host.
    pub fn resource(&self) -> Arc<Resource> {
        Arc::clone(&self.resource)
    }

    /// Head sampler matching the configured effective rate.
    pub fn sampler(&self) -> TraceIdRatioSampler {
        self.sampler
    }

    /// Ingestion URL, when installed with the HTTP exporter.
    pub fn collector_url(&self) -> Option<&str> {
        self.collector_url.as_deref()
    }

    pub fn metrics(&self) -> &Arc<ExportMetrics> {
        self.processor.metrics()
    }

    /// Exports buffered spans now, returning `false` if that timed out.
    pub async fn force_flush(&self) -> bool {
        self.processor.force_flush(self.flush_timeout).await
    }

    /// Stops the flush timer, exports what is buffered and releases the exporter.
    pub async fn shutdown(&self) -> Result<(), ApmError> {
        self.processor.shutdown().await?;
        let metrics = self.metrics();
        tracing::info!(
            exported = metrics.spans_exported(),
            dropped = metrics.spans_dropped(),
            filtered = metrics.spans_filtered(),
            "watchlog apm shut down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::TestExporter;
    use crate::span::SpanStatus;
    use std::path::PathBuf;

    fn outside_cluster() -> ClusterProbe {
        ClusterProbe {
            token_path: PathBuf::from("/nonexistent/watchlog/token"),
            cgroup_path: PathBuf::from("/nonexistent/watchlog/cgroup"),
            dns_host: "cluster-probe.invalid".to_string(),
            dns_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_install_resolves_default_url() {
        let apm = Apm::install_with_probe(ApmConfig::new("orders"), &outside_cluster())
            .await
            .unwrap();
        assert_eq!(
            apm.collector_url(),
            Some("http://localhost:3774/apm/orders/v1/traces")
        );
        assert_eq!(apm.resource().service_name(), Some("orders"));
        assert_eq!(apm.sampler().rate(), 0.3);
    }

    #[tokio::test]
    async fn test_install_uses_explicit_endpoint() {
        let config = ApmConfig::new("orders").with_endpoint("https://apm.example.com");
        let apm = Apm::install_with_probe(config, &outside_cluster()).await.unwrap();
        assert_eq!(apm.collector_url(), Some("https://apm.example.com/orders/v1/traces"));
    }

    #[tokio::test]
    async fn test_install_fails_fast_on_bad_config() {
        let result = Apm::install_with_probe(ApmConfig::default(), &outside_cluster()).await;
        assert!(matches!(result, Err(ApmError::Config(ConfigError::MissingServiceName))));

        let config = ApmConfig::new("orders").with_sample_rate(-1.0);
        let result = Apm::with_exporter(config, Arc::new(TestExporter::new()));
        assert!(matches!(result, Err(ApmError::Config(ConfigError::InvalidSampleRate(_)))));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffer() {
        let exporter = Arc::new(TestExporter::new());
        let config = ApmConfig::new("orders").with_error_spans(None);
        let apm = Apm::with_exporter(config, exporter.clone()).unwrap();

        // sample rate is capped, so only error spans are guaranteed to pass
        for i in 1..=3 {
            let span = SpanRecord::new(1, i, "GET /orders", apm.resource())
                .with_status(SpanStatus::error("500"));
            apm.span_processor().on_span_finished(span);
        }

        apm.shutdown().await.unwrap();
        assert_eq!(exporter.batch_sizes(), vec![3]);
        assert!(matches!(
            apm.shutdown().await,
            Err(ApmError::Processor(ProcessorError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_force_flush() {
        let exporter = Arc::new(TestExporter::new());
        let config = ApmConfig::new("orders").with_error_spans(None);
        let apm = Apm::with_exporter(config, exporter.clone()).unwrap();

        apm.on_span_finished(
            SpanRecord::new(1, 1, "GET /orders", apm.resource()).with_status(SpanStatus::error("500")),
        );
        assert!(apm.force_flush().await);
        assert_eq!(exporter.exported_count(), 1);
        apm.shutdown().await.unwrap();
    }
}
