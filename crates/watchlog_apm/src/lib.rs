//! Watchlog APM span pipeline
//!
//! Takes finished spans from a host tracing SDK, filters them (error quota,
//! slow-span threshold, sampling), batches them by size and time, transcodes
//! each batch to the collector's JSON dialect and POSTs it to the Watchlog
//! agent. Export runs on background tokio tasks; the span-completion path only
//! takes two short locks and never waits on the network.
//!
//! Failed exports are dropped rather than retried, so telemetry loss during a
//! collector outage is bounded and memory stays flat.

pub mod batch;
pub mod config;
pub mod endpoint;
pub mod exporter;
pub mod filter;
pub mod lifecycle;
pub mod processor;
pub mod sampler;
pub mod span;
pub mod transcoder;

// Re-export main types
pub use batch::{BatchAccumulator, BatchConfig};
pub use config::{ApmConfig, ConfigError};
pub use endpoint::{collector_url, ClusterProbe, DEFAULT_ENDPOINT, IN_CLUSTER_ENDPOINT};
pub use exporter::{
    ExportError, ExporterConfig, HttpJsonExporter, NullExporter, SpanExporter, SpanExporterBoxed,
    DEFAULT_EXPORT_TIMEOUT,
};
pub use filter::{ErrorRateWindow, FilterConfig, SpanFilter, MAX_SAMPLE_RATE};
pub use lifecycle::{Apm, ApmError};
pub use processor::{BatchSpanProcessor, ExportMetrics, ProcessorConfig, ProcessorError, SpanProcessor};
pub use sampler::TraceIdRatioSampler;
pub use span::{
    AttributeValue, InstrumentationScope, Resource, SpanBatch, SpanKind, SpanRecord, SpanStatus, StatusCode,
};
pub use transcoder::{encode, normalize_legacy, ExportDocument};
