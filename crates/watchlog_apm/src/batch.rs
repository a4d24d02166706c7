//! Batch Accumulator - Pure Batching Abstraction
//!
//! Buffers kept spans and decides when a batch is ready: either the buffer
//! reached the size limit or the flush interval elapsed since the last flush.
//!
//! Like the rest of the batching layer this type carries no concurrency of its
//! own. [`BatchSpanProcessor`](crate::BatchSpanProcessor) wraps it in a mutex
//! and holds the lock only to append or swap the buffer; exporting happens on
//! the returned [`SpanBatch`] after the lock is released.
//!
//! ```rust,ignore
//! let mut acc = BatchAccumulator::new(BatchConfig::default());
//!
//! if let Some(full) = acc.push(span) {
//!     // hand `full` to the export task
//! }
//!
//! if acc.is_due(Instant::now()) {
//!     if let Some(batch) = acc.take_batch() {
//!         // time-triggered flush
//!     }
//! }
//! ```

use crate::span::{SpanBatch, SpanRecord};
use std::mem;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batching
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of spans per batch
    pub max_batch_size: usize,
    /// Maximum time between flushes
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 200,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Span buffer with size and time flush triggers.
#[derive(Debug)]
pub struct BatchAccumulator {
    /// Pending spans in arrival order
    pending: Vec<SpanRecord>,
    config: BatchConfig,
    /// Last flush time
    last_flush: Instant,
}

impl BatchAccumulator {
    /// Creates a new accumulator; the flush clock starts now.
    pub fn new(config: BatchConfig) -> Self {
        let max_batch_size = config.max_batch_size.max(1);
        Self {
            pending: Vec::with_capacity(max_batch_size),
            config: BatchConfig {
                max_batch_size,
                ..config
            },
            last_flush: Instant::now(),
        }
    }

    /// Appends a span. Returns the full batch when the size limit is reached;
    /// spans pushed afterwards start a fresh buffer.
    pub fn push(&mut self, span: SpanRecord) -> Option<SpanBatch> {
        self.pending.push(span);
        if self.pending.len() >= self.config.max_batch_size {
            return self.take_batch();
        }
        None
    }

    /// Swaps out everything pending. Resets the flush clock even when empty.
    pub fn take_batch(&mut self) -> Option<SpanBatch> {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return None;
        }
        let spans = mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.config.max_batch_size),
        );
        Some(SpanBatch::with_spans(spans))
    }

    /// Checks if the flush interval has elapsed at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_deadline()
    }

    /// Time at which the next time-triggered flush is due
    pub fn next_deadline(&self) -> Instant {
        self.last_flush + self.config.flush_interval
    }

    /// Returns the number of pending spans
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}
