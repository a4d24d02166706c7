//! Span processor: the bridge between span-completing application threads and
//! the async export worker.
//!
//! `on_span_finished` runs on the caller's thread and never blocks: it applies
//! the filter, appends to the mutex-guarded accumulator and, when a batch
//! fills up, hands it to the worker over a bounded channel. A single worker
//! task owns the flush timer and spawns export tasks, so network I/O never
//! happens under a lock or on the request path.
//!
//! Failed exports are logged and counted; the batch is dropped. Nothing is
//! requeued, which keeps memory bounded while the collector is unreachable.

use crate::batch::{BatchAccumulator, BatchConfig};
use crate::exporter::{ExportError, SpanExporterBoxed};
use crate::filter::SpanFilter;
use crate::span::{SpanBatch, SpanRecord};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

/// Receives every finished span from the host tracing SDK.
///
/// This is the only surface the SDK adapter needs; registering it with a
/// concrete SDK is left to that adapter.
pub trait SpanProcessor: Send + Sync {
    /// Called once per finished span. Must not block and must not fail.
    fn on_span_finished(&self, span: SpanRecord);
}

/// Error types for processor lifecycle operations
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The processor was already shut down
    #[error("processor is shut down")]
    Closed,
    /// The final flush did not finish within the allotted time
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
    /// The worker task panicked or was cancelled
    #[error("worker task failed: {0}")]
    Join(String),
}

/// Thread-safe pipeline counters (uses atomics)
#[derive(Debug, Default)]
pub struct ExportMetrics {
    /// Spans delivered to the collector
    pub spans_exported: AtomicU64,
    /// Batches delivered to the collector
    pub batches_exported: AtomicU64,
    /// Failed export attempts (each one drops its batch)
    pub export_errors: AtomicU64,
    /// Spans rejected by the filter
    pub spans_filtered: AtomicU64,
    /// Spans lost to failed exports, a full queue or a closed processor
    pub spans_dropped: AtomicU64,
    /// Current in-flight exports
    pub inflight_exports: AtomicU64,
}

impl ExportMetrics {
    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn spans_filtered(&self) -> u64 {
        self.spans_filtered.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    pub fn inflight_exports(&self) -> u64 {
        self.inflight_exports.load(Ordering::Relaxed)
    }

    fn record_success(&self, span_count: u64) {
        self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, span_count: u64) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
        self.spans_dropped.fetch_add(span_count, Ordering::Relaxed);
    }

    fn record_filtered(&self) {
        self.spans_filtered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self, span_count: u64) {
        self.spans_dropped.fetch_add(span_count, Ordering::Relaxed);
    }

    fn inc_inflight(&self) {
        self.inflight_exports.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_inflight(&self) {
        self.inflight_exports.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Configuration for the batch span processor
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Batch size and time triggers
    pub batch_config: BatchConfig,
    /// Maximum concurrent export operations
    pub max_concurrent_exports: usize,
    /// Full batches buffered for the worker before new ones are dropped
    pub max_queued_batches: usize,
    /// Upper bound on the final flush during shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_config: BatchConfig::default(),
            max_concurrent_exports: 4,
            max_queued_batches: 16,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

enum Command {
    Export(SpanBatch),
    ForceFlush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// State shared between producers and the worker
struct Shared {
    filter: Option<SpanFilter>,
    accumulator: Mutex<BatchAccumulator>,
    metrics: Arc<ExportMetrics>,
    closed: AtomicBool,
}

impl Shared {
    fn accumulator(&self) -> MutexGuard<'_, BatchAccumulator> {
        self.accumulator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Filters, batches and exports finished spans in the background.
///
/// Must be created inside a tokio runtime; the worker task is spawned on it.
pub struct BatchSpanProcessor {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl BatchSpanProcessor {
    /// Creates the processor and spawns its worker task.
    ///
    /// A filter whose config is inactive is skipped entirely.
    pub fn new(
        config: ProcessorConfig,
        filter: Option<SpanFilter>,
        exporter: Arc<dyn SpanExporterBoxed>,
    ) -> Self {
        let filter = filter.filter(|f| f.config().is_active());
        let shared = Arc::new(Shared {
            filter,
            accumulator: Mutex::new(BatchAccumulator::new(config.batch_config.clone())),
            metrics: Arc::new(ExportMetrics::default()),
            closed: AtomicBool::new(false),
        });

        let (commands, command_rx) = mpsc::channel(config.max_queued_batches.max(1));

        let worker = Worker {
            shared: Arc::clone(&shared),
            exporter,
            commands: command_rx,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_exports.max(1))),
            tasks: JoinSet::new(),
            shutdown_timeout: config.shutdown_timeout,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            shared,
            commands,
            worker: Mutex::new(Some(handle)),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Returns pipeline metrics
    pub fn metrics(&self) -> &Arc<ExportMetrics> {
        &self.shared.metrics
    }

    /// Spans waiting in the current batch
    pub fn pending(&self) -> usize {
        self.shared.accumulator().len()
    }

    /// Exports everything buffered and waits for in-flight exports.
    ///
    /// Returns `false` if that did not finish within `timeout`.
    pub async fn force_flush(&self, timeout: Duration) -> bool {
        let flush = async {
            let (reply, done) = oneshot::channel();
            if self.commands.send(Command::ForceFlush(reply)).await.is_err() {
                return false;
            }
            done.await.is_ok()
        };
        tokio::time::timeout(timeout, flush).await.unwrap_or(false)
    }

    /// Stops the timer, exports the remaining buffer and releases the exporter.
    ///
    /// Spans finished after this call are dropped. The wait is bounded by the
    /// configured shutdown timeout; on expiry the worker is aborted.
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        // Flip under the buffer lock so no push can land after the final take
        let already_closed = {
            let _acc = self.shared.accumulator();
            self.shared.closed.swap(true, Ordering::AcqRel)
        };
        if already_closed {
            return Err(ProcessorError::Closed);
        }

        let Some(mut handle) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(ProcessorError::Closed);
        };

        let timeout = self.shutdown_timeout;
        let (reply, done) = oneshot::channel();
        let finished = tokio::time::timeout(timeout, async {
            if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
                let _ = done.await;
            }
            (&mut handle).await
        })
        .await;

        match finished {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProcessorError::Join(e.to_string())),
            Err(_) => {
                handle.abort();
                tracing::warn!(?timeout, "span processor shutdown timed out");
                Err(ProcessorError::ShutdownTimeout(timeout))
            }
        }
    }

    fn dispatch(&self, batch: SpanBatch) {
        let span_count = batch.len() as u64;
        match self.commands.try_send(Command::Export(batch)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shared.metrics.record_dropped(span_count);
                tracing::warn!(spans = span_count, "export queue full, dropping batch");
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.metrics.record_dropped(span_count);
            }
        }
    }
}

impl SpanProcessor for BatchSpanProcessor {
    fn on_span_finished(&self, span: SpanRecord) {
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.metrics.record_dropped(1);
            return;
        }

        if let Some(filter) = &self.shared.filter {
            if !filter.should_keep(&span) {
                self.shared.metrics.record_filtered();
                return;
            }
        }

        let full = {
            let mut acc = self.shared.accumulator();
            if self.shared.closed.load(Ordering::Acquire) {
                drop(acc);
                self.shared.metrics.record_dropped(1);
                return;
            }
            acc.push(span)
        };
        if let Some(batch) = full {
            self.dispatch(batch);
        }
    }
}

impl Drop for BatchSpanProcessor {
    fn drop(&mut self) {
        if let Some(handle) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Helper function to export a batch and record metrics (for concurrent tasks)
async fn export_batch(
    exporter: Arc<dyn SpanExporterBoxed>,
    batch: SpanBatch,
    metrics: &ExportMetrics,
) -> Result<(), ExportError> {
    let span_count = batch.len() as u64;
    match exporter.export_boxed(batch).await {
        Ok(()) => {
            metrics.record_success(span_count);
            Ok(())
        }
        Err(e) => {
            metrics.record_error(span_count);
            Err(e)
        }
    }
}

/// Background task owning the flush timer and the export tasks
struct Worker {
    shared: Arc<Shared>,
    exporter: Arc<dyn SpanExporterBoxed>,
    commands: mpsc::Receiver<Command>,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<(), ExportError>>,
    shutdown_timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let deadline = self.shared.accumulator().next_deadline();

            tokio::select! {
                // Reap completed export tasks (non-blocking)
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    log_export_result(result);
                }

                _ = tokio::time::sleep_until(deadline) => {
                    let due = {
                        let mut acc = self.shared.accumulator();
                        if acc.is_due(Instant::now()) { acc.take_batch() } else { None }
                    };
                    if let Some(batch) = due {
                        self.spawn_export(batch).await;
                    }
                }

                command = self.commands.recv() => match command {
                    Some(Command::Export(batch)) => self.spawn_export(batch).await,
                    Some(Command::ForceFlush(reply)) => {
                        let shutdown = self.flush_all().await;
                        self.exporter.force_flush_boxed(self.shutdown_timeout).await;
                        let _ = reply.send(());
                        if let Some(reply) = shutdown {
                            self.finish().await;
                            let _ = reply.send(());
                            break;
                        }
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.finish().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.finish().await;
                        break;
                    }
                },
            }
        }
    }

    async fn spawn_export(&mut self, batch: SpanBatch) {
        let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return;
        };
        let exporter = Arc::clone(&self.exporter);
        let metrics = Arc::clone(&self.shared.metrics);
        metrics.inc_inflight();

        self.tasks.spawn(async move {
            let result = export_batch(exporter, batch, &metrics).await;
            metrics.dec_inflight();
            drop(permit);
            result
        });
    }

    /// Exports queued and buffered spans, then waits for every export task.
    ///
    /// Returns the reply handle of a shutdown request found in the queue.
    async fn flush_all(&mut self) -> Option<oneshot::Sender<()>> {
        let mut flush_waiters = Vec::new();
        let mut shutdown = None;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Export(batch) => self.spawn_export(batch).await,
                Command::ForceFlush(reply) => flush_waiters.push(reply),
                Command::Shutdown(reply) => shutdown = Some(reply),
            }
        }

        let remaining = self.shared.accumulator().take_batch();
        if let Some(batch) = remaining {
            tracing::debug!(spans = batch.len(), "flushing buffered spans");
            self.spawn_export(batch).await;
        }

        while let Some(result) = self.tasks.join_next().await {
            log_export_result(result);
        }

        for reply in flush_waiters {
            let _ = reply.send(());
        }
        shutdown
    }

    async fn finish(&mut self) {
        self.commands.close();
        if let Some(reply) = self.flush_all().await {
            let _ = reply.send(());
        }
        self.exporter.shutdown();
        tracing::debug!(exporter = self.exporter.name(), "span processor stopped");
    }
}

fn log_export_result(result: Result<Result<(), ExportError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "span export failed, batch dropped"),
        Err(e) => tracing::error!(error = %e, "span export task panicked"),
    }
}
