//! # Watchlog APM pipeline demo
//!
//! Simulates an instrumented web service: several request-handler tasks finish
//! spans concurrently (a share of them failing or slow) and hand them to the
//! pipeline, which filters, batches and exports them to a collector.
//!
//! ## Running
//!
//! ```bash
//! # Export to a local Watchlog agent
//! cargo run -p watchlog_apm --bin demo -- --service orders
//!
//! # Dry run: exercise filtering and batching without a collector
//! RUST_LOG=watchlog_apm=debug cargo run -p watchlog_apm --bin demo -- --dry-run
//!
//! # Forward errors (10/s) and anything slower than 200ms
//! cargo run -p watchlog_apm --bin demo -- --error-tps 10 --slow-ms 200
//! ```

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use watchlog_apm::{
    Apm, ApmConfig, InstrumentationScope, NullExporter, Resource, SpanKind, SpanRecord,
    SpanStatus, DEFAULT_ENDPOINT,
};

#[derive(Debug, Parser)]
#[command(name = "demo", about = "Generate spans and export them to Watchlog APM")]
struct Args {
    /// Service name reported with every span
    #[arg(long, env = "WATCHLOG_SERVICE", default_value = "demo-service")]
    service: String,

    /// Collector base URL
    #[arg(long, env = "WATCHLOG_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Concurrent request handlers
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Spans finished by each handler
    #[arg(long, default_value_t = 250)]
    spans: u64,

    /// Requested sample rate (capped at 0.3)
    #[arg(long, default_value_t = 1.0)]
    sample_rate: f64,

    /// Forward error spans, at most this many per second
    #[arg(long)]
    error_tps: Option<u32>,

    /// Always keep spans slower than this (ms)
    #[arg(long, default_value_t = 0)]
    slow_ms: u64,

    /// Spans per batch
    #[arg(long, default_value_t = 200)]
    batch_size: usize,

    /// Discard batches instead of sending them
    #[arg(long)]
    dry_run: bool,
}

/// Builds a span the way an HTTP server instrumentation would.
fn request_span(resource: &Arc<Resource>, rng: &mut impl Rng, worker: usize, seq: u64) -> SpanRecord {
    let end = watchlog_apm::span::unix_nanos_now();
    let latency_ms: u64 = if rng.gen_bool(0.05) {
        rng.gen_range(200..2_000)
    } else {
        rng.gen_range(1..50)
    };
    let failed = rng.gen_bool(0.1);

    let route = ["/orders", "/orders/{id}", "/cart", "/checkout"][rng.gen_range(0..4)];
    let status = if failed {
        SpanStatus::error("internal server error")
    } else {
        SpanStatus::ok()
    };

    SpanRecord::new(rng.gen::<u128>(), ((worker as u64) << 48) | seq, format!("GET {}", route), Arc::clone(resource))
        .with_kind(SpanKind::Server)
        .with_scope(InstrumentationScope::new("watchlog.http").with_version(env!("CARGO_PKG_VERSION")))
        .with_times(end.saturating_sub(latency_ms * 1_000_000), end)
        .with_status(status)
        .with_attribute("http.method", "GET")
        .with_attribute("http.route", route)
        .with_attribute("http.status_code", if failed { 500i64 } else { 200i64 })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = ApmConfig::new(&args.service)
        .with_endpoint(&args.endpoint)
        .with_sample_rate(args.sample_rate)
        .with_slow_threshold(Duration::from_millis(args.slow_ms))
        .with_batch_max_size(args.batch_size);
    if let Some(tps) = args.error_tps {
        config = config.with_error_spans(Some(tps));
    }

    let apm = if args.dry_run {
        Apm::with_exporter(config, Arc::new(NullExporter::new()))
    } else {
        Apm::install(config).await
    }
    .context("failed to install watchlog apm")?;

    if let Some(url) = apm.collector_url() {
        tracing::info!(url, "exporting spans");
    }

    let apm = Arc::new(apm);
    let started = Instant::now();
    let mut handlers = JoinSet::new();
    for worker in 0..args.workers {
        let apm = Arc::clone(&apm);
        let spans = args.spans;
        handlers.spawn(async move {
            let resource = apm.resource();
            let processor = apm.span_processor();
            for seq in 0..spans {
                let span = request_span(&resource, &mut rand::thread_rng(), worker, seq);
                processor.on_span_finished(span);
                if seq % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }
    while let Some(result) = handlers.join_next().await {
        result.context("request handler panicked")?;
    }

    apm.shutdown().await.context("shutdown failed")?;

    let metrics = apm.metrics();
    tracing::info!(
        generated = args.workers as u64 * args.spans,
        exported = metrics.spans_exported(),
        filtered = metrics.spans_filtered(),
        dropped = metrics.spans_dropped(),
        batches = metrics.batches_exported(),
        export_errors = metrics.export_errors(),
        elapsed = ?started.elapsed(),
        "demo finished"
    );
    Ok(())
}
