//! JSON Transcoder
//!
//! Converts a [`SpanBatch`] into the document the Watchlog collector ingests.
//!
//! Encoding happens in two stages:
//!
//! 1. the batch is mapped onto the OTLP/JSON trace request shape (camelCase
//!    field names, base64 ids, string nanosecond timestamps, enum names),
//!    omitting every empty or default field;
//! 2. [`normalize_legacy`] rewrites that document into the collector's
//!    dialect: `scopeSpans` becomes `instrumentationLibrarySpans` and
//!    symbolic status codes become integers.
//!
//! Both stages are pure. Encoding the same batch twice yields byte-identical
//! output because object keys serialize in sorted order.

use crate::span::{AttributeValue, InstrumentationScope, Resource, SpanBatch, SpanRecord};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::{Map, Value};

/// Key under which the collector expects per-scope span groups.
pub const LEGACY_SCOPE_SPANS_KEY: &str = "instrumentationLibrarySpans";

const SCOPE_SPANS_KEY: &str = "scopeSpans";

/// Serializable trace export document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExportDocument(Value);

impl ExportDocument {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Serialized request body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }

    /// Number of span objects in the document.
    pub fn span_count(&self) -> usize {
        resource_groups(&self.0)
            .iter()
            .flat_map(|rs| scope_groups(rs))
            .map(|ss| ss.get("spans").and_then(Value::as_array).map_or(0, Vec::len))
            .sum()
    }
}

fn resource_groups(doc: &Value) -> &[Value] {
    doc.get("resourceSpans")
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn scope_groups(resource_spans: &Value) -> &[Value] {
    resource_spans
        .get(LEGACY_SCOPE_SPANS_KEY)
        .or_else(|| resource_spans.get(SCOPE_SPANS_KEY))
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

// -----------------------------------------------------------------------------
// OTLP/JSON shape
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans {
    #[serde(skip_serializing_if = "Option::is_none")]
    resource: Option<JsonResource>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Serialize)]
struct JsonResource {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<KeyValue>,
}

#[derive(Debug, Serialize)]
struct ScopeSpans {
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<JsonScope>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    spans: Vec<JsonSpan>,
}

#[derive(Debug, Serialize)]
struct JsonScope {
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonSpan {
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time_unix_nano: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time_unix_nano: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<KeyValue>,
    status: JsonStatus,
}

#[derive(Debug, Serialize)]
struct JsonStatus {
    #[serde(skip_serializing_if = "String::is_empty")]
    message: String,
    code: &'static str,
}

#[derive(Debug, Serialize)]
struct KeyValue {
    key: String,
    value: AnyValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum AnyValue {
    StringValue(String),
    BoolValue(bool),
    /// int64 travels as a decimal string in OTLP/JSON
    IntValue(String),
    DoubleValue(f64),
    ArrayValue(ArrayValue),
}

#[derive(Debug, Serialize)]
struct ArrayValue {
    values: Vec<AnyValue>,
}

impl From<&AttributeValue> for AnyValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::String(s) => Self::StringValue(s.clone()),
            AttributeValue::Int(i) => Self::IntValue(i.to_string()),
            AttributeValue::Float(f) => Self::DoubleValue(*f),
            AttributeValue::Bool(b) => Self::BoolValue(*b),
            AttributeValue::Array(items) => Self::ArrayValue(ArrayValue {
                values: items.iter().cloned().map(Self::StringValue).collect(),
            }),
        }
    }
}

fn key_values<'a>(attributes: impl IntoIterator<Item = (&'a String, &'a AttributeValue)>) -> Vec<KeyValue> {
    attributes
        .into_iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.into(),
        })
        .collect()
}

fn nonzero_string(value: u64) -> Option<String> {
    (value != 0).then(|| value.to_string())
}

impl From<&SpanRecord> for JsonSpan {
    fn from(span: &SpanRecord) -> Self {
        Self {
            trace_id: (span.trace_id != 0).then(|| STANDARD.encode(span.trace_id.to_be_bytes())),
            span_id: (span.span_id != 0).then(|| STANDARD.encode(span.span_id.to_be_bytes())),
            parent_span_id: span
                .parent_span_id
                .filter(|id| *id != 0)
                .map(|id| STANDARD.encode(id.to_be_bytes())),
            name: span.name.clone(),
            kind: span.kind.as_otlp_name(),
            start_time_unix_nano: nonzero_string(span.start_time),
            end_time_unix_nano: nonzero_string(span.end_time),
            attributes: key_values(&span.attributes),
            status: JsonStatus {
                message: span.status.message.clone(),
                code: span.status.code.as_otlp_name(),
            },
        }
    }
}

fn json_resource(resource: &Resource) -> Option<JsonResource> {
    let attributes = key_values(&resource.attributes);
    (!attributes.is_empty()).then_some(JsonResource { attributes })
}

fn json_scope(scope: &InstrumentationScope) -> Option<JsonScope> {
    if scope.name.is_empty() && scope.version.is_none() {
        return None;
    }
    Some(JsonScope {
        name: scope.name.clone(),
        version: scope.version.clone(),
    })
}

/// Groups spans by resource, then by scope, in first-appearance order.
fn group(batch: &SpanBatch) -> Vec<(&Resource, Vec<(&InstrumentationScope, Vec<&SpanRecord>)>)> {
    let mut groups: Vec<(&Resource, Vec<(&InstrumentationScope, Vec<&SpanRecord>)>)> = Vec::new();

    for span in &batch.spans {
        let resource = span.resource.as_ref();
        let idx = match groups.iter().position(|(r, _)| *r == resource) {
            Some(idx) => idx,
            None => {
                groups.push((resource, Vec::new()));
                groups.len() - 1
            }
        };

        let scopes = &mut groups[idx].1;
        match scopes.iter_mut().find(|(s, _)| **s == span.scope) {
            Some((_, spans)) => spans.push(span),
            None => scopes.push((&span.scope, vec![span])),
        }
    }

    groups
}

fn trace_request(batch: &SpanBatch) -> TraceRequest {
    let resource_spans = group(batch)
        .into_iter()
        .map(|(resource, scopes)| ResourceSpans {
            resource: json_resource(resource),
            scope_spans: scopes
                .into_iter()
                .map(|(scope, spans)| ScopeSpans {
                    scope: json_scope(scope),
                    spans: spans.into_iter().map(JsonSpan::from).collect(),
                })
                .collect(),
        })
        .collect();

    TraceRequest { resource_spans }
}

/// Encodes a batch into the collector's JSON document. Never fails.
pub fn encode(batch: &SpanBatch) -> ExportDocument {
    let mut doc = match serde_json::to_value(trace_request(batch)) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, spans = batch.len(), "span batch encoding failed");
            Value::Object(Map::new())
        }
    };
    normalize_legacy(&mut doc);
    ExportDocument(doc)
}

/// Integer value of a symbolic OTLP status code.
pub fn status_code_value(name: &str) -> Option<u8> {
    match name {
        "STATUS_CODE_UNSET" => Some(0),
        "STATUS_CODE_OK" => Some(1),
        "STATUS_CODE_ERROR" => Some(2),
        _ => None,
    }
}

/// Rewrites an OTLP/JSON trace request into the collector's legacy dialect.
///
/// Works on arbitrary JSON: unexpected shapes are left untouched and unknown
/// status codes pass through unchanged.
pub fn normalize_legacy(doc: &mut Value) {
    let Some(resource_spans) = doc.get_mut("resourceSpans").and_then(Value::as_array_mut) else {
        return;
    };

    for rs in resource_spans.iter_mut().filter_map(Value::as_object_mut) {
        if let Some(scope_spans) = rs.remove(SCOPE_SPANS_KEY) {
            rs.insert(LEGACY_SCOPE_SPANS_KEY.to_string(), scope_spans);
        }

        let Some(groups) = rs.get_mut(LEGACY_SCOPE_SPANS_KEY).and_then(Value::as_array_mut) else {
            continue;
        };
        for spans in groups
            .iter_mut()
            .filter_map(|g| g.get_mut("spans"))
            .filter_map(Value::as_array_mut)
        {
            for code in spans
                .iter_mut()
                .filter_map(|s| s.get_mut("status"))
                .filter_map(|status| status.get_mut("code"))
            {
                if let Some(value) = code.as_str().and_then(status_code_value) {
                    *code = Value::from(value);
                }
            }
        }
    }
}
