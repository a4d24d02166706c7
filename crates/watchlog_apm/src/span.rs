use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

/// A finished unit of work handed over by the host tracing SDK.
///
/// Records are built once when the span ends and treated as read-only by the
/// pipeline. Timestamps of `0` mean "not recorded".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    /// Trace identifier (128-bit)
    pub trace_id: u128,
    /// Span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier, `None` for root spans
    pub parent_span_id: Option<u64>,
    /// Operation name
    pub name: String,
    /// Span kind
    pub kind: SpanKind,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    /// Span status
    pub status: SpanStatus,
    /// Span attributes, ordered by key
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Resource that produced the span (shared across spans of one process)
    pub resource: Arc<Resource>,
    /// Instrumentation scope that created the span
    pub scope: InstrumentationScope,
}

/// Attribute value types for span and resource metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<String>),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Status code of a finished span
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Status was never set
    #[default]
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
}

impl StatusCode {
    /// Symbolic OTLP name of the code (`STATUS_CODE_*`).
    pub fn as_otlp_name(self) -> &'static str {
        match self {
            Self::Unset => "STATUS_CODE_UNSET",
            Self::Ok => "STATUS_CODE_OK",
            Self::Error => "STATUS_CODE_ERROR",
        }
    }
}

/// Span status: code plus an optional description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    pub message: String,
}

impl SpanStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.code == StatusCode::Error
    }
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Kind was not provided by the SDK
    #[default]
    Unspecified,
    /// Internal operation span
    Internal,
    /// Server-side span (inbound HTTP request)
    Server,
    /// Client-side span (outbound HTTP call)
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

impl SpanKind {
    /// Symbolic OTLP name, `None` for the default kind.
    pub fn as_otlp_name(self) -> Option<&'static str> {
        match self {
            Self::Unspecified => None,
            Self::Internal => Some("SPAN_KIND_INTERNAL"),
            Self::Server => Some("SPAN_KIND_SERVER"),
            Self::Client => Some("SPAN_KIND_CLIENT"),
            Self::Producer => Some("SPAN_KIND_PRODUCER"),
            Self::Consumer => Some("SPAN_KIND_CONSUMER"),
        }
    }
}

/// Entity producing telemetry, e.g. one service instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Resource {
    /// Resource carrying only `service.name`.
    pub fn for_service(service_name: &str) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "service.name".to_string(),
            AttributeValue::String(service_name.to_string()),
        );
        Self { attributes }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn service_name(&self) -> Option<&str> {
        match self.attributes.get("service.name") {
            Some(AttributeValue::String(name)) => Some(name),
            _ => None,
        }
    }
}

/// Library that created a span
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: Option<String>,
}

impl InstrumentationScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Batch of spans for export
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// Spans in arrival order
    pub spans: Vec<SpanRecord>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

/// Current wall-clock time as Unix nanoseconds (0 if the clock is before the epoch).
pub fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl SpanRecord {
    /// Creates a record started and ended "now"; adjust with the builder methods.
    pub fn new(trace_id: u128, span_id: u64, name: impl Into<String>, resource: Arc<Resource>) -> Self {
        let now = unix_nanos_now();
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
            name: name.into(),
            kind: SpanKind::Internal,
            start_time: now,
            end_time: now,
            status: SpanStatus::default(),
            attributes: BTreeMap::new(),
            resource,
            scope: InstrumentationScope::default(),
        }
    }

    pub fn with_parent(mut self, parent_span_id: u64) -> Self {
        self.parent_span_id = Some(parent_span_id);
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_times(mut self, start_time: u64, end_time: u64) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_scope(mut self, scope: InstrumentationScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Duration in nanoseconds, `None` when either timestamp is missing.
    pub fn duration_nanos(&self) -> Option<u64> {
        if self.start_time == 0 || self.end_time == 0 {
            return None;
        }
        Some(self.end_time.saturating_sub(self.start_time))
    }

    /// Duration in (fractional) milliseconds, `None` when either timestamp is missing.
    pub fn duration_ms(&self) -> Option<f64> {
        self.duration_nanos().map(|nanos| nanos as f64 / 1e6)
    }
}

impl SpanBatch {
    /// Creates a new empty span batch
    pub fn new() -> Self {
        Self::with_spans(Vec::new())
    }

    /// Creates a batch with the given spans
    pub fn with_spans(spans: Vec<SpanRecord>) -> Self {
        Self {
            spans,
            timestamp: SystemTime::now(),
        }
    }

    /// Adds a span to the batch
    pub fn add(&mut self, span: SpanRecord) {
        self.spans.push(span);
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl Default for SpanBatch {
    fn default() -> Self {
        Self::new()
    }
}
