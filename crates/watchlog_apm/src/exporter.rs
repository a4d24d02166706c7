use crate::config::ConfigError;
use crate::span::SpanBatch;
use crate::transcoder::{self, ExportDocument};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default HTTP timeout for one export.
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Error types for span export operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExportError {
    /// Network-level failure (DNS, connect, reset)
    #[error("transport error: {0}")]
    Transport(String),
    /// The request did not complete within the export timeout
    #[error("export operation timed out")]
    Timeout,
    /// The collector answered with a non-2xx status
    #[error("collector responded with HTTP {0}")]
    Status(u16),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The exporter was shut down
    #[error("exporter is shut down")]
    ShutDown,
    /// The HTTP client could not be created
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Trait for exporting span batches to a collector.
///
/// Implementations report success or failure of one attempt; they never retry.
/// Uses native async fn in traits; see [`SpanExporterBoxed`] for dynamic dispatch.
pub trait SpanExporter: Send + Sync {
    /// Exports a batch of spans.
    fn export(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;

    /// Releases exporter resources. Later exports fail.
    fn shutdown(&self) {}

    /// Waits for in-flight exports, returning `false` if `timeout` elapsed first.
    fn force_flush(&self, _timeout: Duration) -> impl Future<Output = bool> + Send {
        async { true }
    }
}

/// Object-safe version of SpanExporter for dynamic dispatch.
pub trait SpanExporterBoxed: Send + Sync {
    /// Exports a batch of spans (boxed future for object safety).
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;

    fn shutdown(&self);

    fn force_flush_boxed(&self, timeout: Duration) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// Blanket implementation: any SpanExporter can be used as SpanExporterBoxed
impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: SpanBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }

    fn shutdown(&self) {
        SpanExporter::shutdown(self);
    }

    fn force_flush_boxed(&self, timeout: Duration) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(self.force_flush(timeout))
    }
}

/// Resolved, immutable settings of the HTTP exporter.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl ExporterConfig {
    /// Builds the exporter settings. `Content-Type: application/json` always
    /// wins over a caller-supplied content type.
    pub fn new(
        url: impl Into<String>,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let invalid = || ConfigError::InvalidHeader { name: name.clone() };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            map.insert(header_name, header_value);
        }
        map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }

        Ok(Self {
            url: url.into(),
            headers: map,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Posts encoded batches to the collector as JSON.
pub struct HttpJsonExporter {
    client: reqwest::Client,
    config: ExporterConfig,
    inflight: AtomicUsize,
    idle: Notify,
    shut_down: AtomicBool,
}

/// Decrements the in-flight counter when a send finishes, however it finishes.
struct InflightGuard<'a>(&'a HttpJsonExporter);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.0.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl HttpJsonExporter {
    pub fn new(config: ExporterConfig) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExportError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            config,
            inflight: AtomicUsize::new(0),
            idle: Notify::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    /// Sends are currently running.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// POSTs one document. Any transport error, timeout or non-2xx response
    /// is a failure; nothing is retried.
    pub async fn send(&self, document: &ExportDocument) -> Result<(), ExportError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ExportError::ShutDown);
        }

        self.inflight.fetch_add(1, Ordering::AcqRel);
        let _guard = InflightGuard(self);

        let body = document
            .to_bytes()
            .map_err(|e| ExportError::Serialization(e.to_string()))?;

        let response = self
            .client
            .post(&self.config.url)
            .headers(self.config.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExportError::Timeout
                } else {
                    ExportError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Status(status.as_u16()));
        }
        Ok(())
    }
}

impl SpanExporter for HttpJsonExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let document = transcoder::encode(&batch);
        self.send(&document).await
    }

    fn name(&self) -> &str {
        "http_json"
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    async fn force_flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so a wakeup between the two is not lost
            let idle = self.idle.notified();
            if self.inflight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.inflight() == 0;
            }
        }
    }
}

/// Null exporter that discards all spans (for benchmarking)
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanExporter for NullExporter {
    async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Test exporter that records all exported batches for verification
#[cfg(test)]
pub struct TestExporter {
    batches: std::sync::Mutex<Vec<SpanBatch>>,
    fail: AtomicBool,
}

#[cfg(test)]
impl Default for TestExporter {
    fn default() -> Self {
        Self {
            batches: std::sync::Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
impl TestExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let exporter = Self::default();
        exporter.fail.store(true, Ordering::Relaxed);
        exporter
    }

    pub fn exported_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(SpanBatch::len).sum()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(SpanBatch::len).collect()
    }

    pub fn span_ids(&self) -> Vec<u64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.spans.iter().map(|s| s.span_id))
            .collect()
    }
}

#[cfg(test)]
impl SpanExporter for TestExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let fail = self.fail.load(Ordering::Relaxed);
        self.batches.lock().unwrap().push(batch);
        if fail {
            return Err(ExportError::Status(503));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}

/// Slow exporter for timeout testing
#[cfg(test)]
pub struct SlowExporter {
    delay: Duration,
    spans: std::sync::Mutex<Vec<crate::span::SpanRecord>>,
}

#[cfg(test)]
impl SlowExporter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            spans: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn exported_count(&self) -> usize {
        self.spans.lock().unwrap().len()
    }
}

#[cfg(test)]
impl SpanExporter for SlowExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        tokio::time::sleep(self.delay).await;
        self.spans.lock().unwrap().extend(batch.spans);
        Ok(())
    }

    fn name(&self) -> &str {
        "slow"
    }
}
