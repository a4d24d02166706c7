use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use watchlog_apm::{
    Apm, ApmConfig, InstrumentationScope, Resource, SpanKind, SpanRecord, SpanStatus,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const SERVICE: &str = "orders";

fn create_test_span(resource: &Arc<Resource>, seq: u64) -> SpanRecord {
    SpanRecord::new(0xabc, seq, format!("GET /orders/{}", seq), Arc::clone(resource))
        .with_kind(SpanKind::Server)
        .with_scope(InstrumentationScope::new("watchlog.http"))
        .with_times(1_700_000_000_000_000_000, 1_700_000_000_002_000_000) // 2ms
}

fn error_span(resource: &Arc<Resource>, seq: u64) -> SpanRecord {
    create_test_span(resource, seq).with_status(SpanStatus::error("internal error"))
}

fn exported_spans(request: &Request) -> Vec<Value> {
    let body: Value = request.body_json().unwrap();
    body["resourceSpans"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|rs| rs["instrumentationLibrarySpans"].as_array().unwrap().clone())
        .flat_map(|ss| ss["spans"].as_array().unwrap().clone())
        .collect()
}

async fn collector(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/apm/{}/v1/traces", SERVICE)))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn config_for(server: &MockServer) -> ApmConfig {
    ApmConfig::new(SERVICE)
        .with_endpoint(format!("{}/apm", server.uri()))
        .with_flush_interval(Duration::from_secs(3600))
}

#[tokio::test]
async fn test_shutdown_exports_buffered_spans_once() {
    let server = collector(200).await;
    let config = config_for(&server)
        .with_header("x-watchlog-key", "secret")
        .with_error_spans(None);
    let apm = Apm::install(config).await.unwrap();
    assert_eq!(
        apm.collector_url().unwrap(),
        format!("{}/apm/orders/v1/traces", server.uri())
    );

    let resource = apm.resource();
    let processor = apm.span_processor();
    for seq in 1..=3 {
        processor.on_span_finished(error_span(&resource, seq));
    }

    apm.shutdown().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].headers.get("x-watchlog-key").unwrap(), "secret");

    let body: Value = requests[0].body_json().unwrap();
    let rs = &body["resourceSpans"][0];
    assert!(rs.get("scopeSpans").is_none());
    assert_eq!(rs["resource"]["attributes"][0]["key"], "service.name");
    assert_eq!(rs["resource"]["attributes"][0]["value"]["stringValue"], SERVICE);
    assert_eq!(rs["instrumentationLibrarySpans"][0]["scope"]["name"], "watchlog.http");

    let spans = exported_spans(&requests[0]);
    assert_eq!(spans.len(), 3);
    for (i, span) in spans.iter().enumerate() {
        assert_eq!(span["name"], format!("GET /orders/{}", i + 1));
        assert_eq!(span["kind"], "SPAN_KIND_SERVER");
        assert_eq!(span["status"]["code"], 2);
        assert_eq!(span["status"]["message"], "internal error");
    }
}

#[tokio::test]
async fn test_size_trigger_sends_full_batch() {
    let server = collector(200).await;
    let config = config_for(&server)
        .with_batch_max_size(200)
        .with_error_spans(None);
    let apm = Apm::install(config).await.unwrap();
    let resource = apm.resource();

    for seq in 1..=205 {
        apm.on_span_finished(error_span(&resource, seq));
    }

    // The full batch goes out on its own, without any timer
    tokio::time::timeout(Duration::from_secs(5), async {
        while apm.metrics().batches_exported() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let spans = exported_spans(&requests[0]);
    assert_eq!(spans.len(), 200);
    assert_eq!(spans[0]["name"], "GET /orders/1");
    assert_eq!(spans[199]["name"], "GET /orders/200");

    apm.shutdown().await.unwrap();
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(exported_spans(&requests[1]).len(), 5);
}

#[tokio::test]
async fn test_collector_error_drops_batch_without_retry() {
    let server = collector(503).await;
    let config = config_for(&server)
        .with_batch_max_size(2)
        .with_error_spans(None);
    let apm = Apm::install(config).await.unwrap();
    let resource = apm.resource();

    apm.on_span_finished(error_span(&resource, 1));
    apm.on_span_finished(error_span(&resource, 2));
    assert!(apm.force_flush().await);

    let metrics = apm.metrics();
    assert_eq!(metrics.export_errors(), 1);
    assert_eq!(metrics.spans_dropped(), 2);
    assert_eq!(metrics.spans_exported(), 0);

    // Nothing is requeued: shutting down sends no further request
    apm.shutdown().await.unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_slow_spans_bypass_sampling() {
    let server = collector(200).await;
    let config = config_for(&server)
        .with_sample_rate(0.0)
        .with_slow_threshold(Duration::from_millis(100));
    let apm = Apm::install(config).await.unwrap();
    let resource = apm.resource();

    for seq in 1..=5 {
        apm.on_span_finished(create_test_span(&resource, seq));
    }
    let slow = create_test_span(&resource, 6).with_times(1_000_000_000, 1_250_000_000);
    apm.on_span_finished(slow);

    apm.shutdown().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let spans = exported_spans(&requests[0]);
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0]["name"], "GET /orders/6");
    assert_eq!(apm.metrics().spans_filtered(), 5);
}

#[tokio::test]
async fn test_error_quota_limits_forwarded_spans() {
    let server = collector(200).await;
    let config = config_for(&server)
        .with_sample_rate(0.0)
        .with_error_spans(Some(5));
    let apm = Apm::install(config).await.unwrap();
    let resource = apm.resource();

    for seq in 1..=50 {
        apm.on_span_finished(error_span(&resource, seq));
    }
    apm.shutdown().await.unwrap();

    // 5 per second; the loop may straddle one second boundary
    let exported = apm.metrics().spans_exported();
    assert!((5..=10).contains(&exported), "exported {}", exported);
}

#[tokio::test]
async fn test_unreachable_collector_does_not_hang_shutdown() {
    let config = ApmConfig::new(SERVICE)
        .with_endpoint("http://127.0.0.1:9/apm")
        .with_export_timeout(Duration::from_millis(500))
        .with_error_spans(None);
    let apm = Apm::install(config).await.unwrap();
    let resource = apm.resource();
    apm.on_span_finished(error_span(&resource, 1));

    let started = std::time::Instant::now();
    let _ = apm.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(apm.metrics().spans_exported(), 0);
}
