//! Span Filter
//!
//! Decides, once per finished span, whether the span enters the batch. The
//! decision runs on the thread that completed the span, so it never blocks:
//! the only shared state is the [`ErrorRateWindow`], whose critical section is
//! a compare and an increment.
//!
//! Rules, first match wins:
//!
//! 1. error spans (when forwarding is enabled) are kept while the per-second
//!    quota lasts and dropped once it is exhausted;
//! 2. spans slower than the threshold are kept;
//! 3. everything else is kept with probability `sample_rate`.

use crate::span::SpanRecord;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

/// Upper bound applied to the requested sample rate.
pub const MAX_SAMPLE_RATE: f64 = 0.3;

/// Filter settings, derived from [`ApmConfig`](crate::ApmConfig).
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    /// Forward error spans ahead of sampling.
    pub send_error_spans: bool,
    /// Error spans forwarded per wall-clock second; `None` is unlimited.
    pub error_spans_per_second: Option<u32>,
    /// Keep spans slower than this many milliseconds; 0 disables the rule.
    pub slow_threshold_ms: u64,
    /// Effective sampling probability (already capped).
    pub sample_rate: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            send_error_spans: false,
            error_spans_per_second: None,
            slow_threshold_ms: 0,
            sample_rate: 1.0,
        }
    }
}

impl FilterConfig {
    /// Returns `false` when no rule could ever drop a span.
    pub fn is_active(&self) -> bool {
        self.send_error_spans || self.slow_threshold_ms > 0 || self.sample_rate < 1.0
    }
}

#[derive(Debug)]
struct WindowState {
    second: u64,
    count: u32,
}

/// Per-second error-span quota.
///
/// The window is keyed by the UTC second. Rolling over to a new second and
/// recording a kept span happen under one lock acquisition, so concurrent
/// callers can never both observe a free slot.
#[derive(Debug)]
pub struct ErrorRateWindow {
    limit: Option<u32>,
    state: Mutex<WindowState>,
}

impl ErrorRateWindow {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            state: Mutex::new(WindowState {
                second: unix_seconds_now(),
                count: 0,
            }),
        }
    }

    /// Records one error span for `now_second` if the quota allows it.
    pub fn try_acquire(&self, now_second: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.second != now_second {
            state.second = now_second;
            state.count = 0;
        }
        match self.limit {
            Some(limit) if state.count >= limit => false,
            _ => {
                state.count = state.count.saturating_add(1);
                true
            }
        }
    }

    /// Error spans recorded in the current window.
    pub fn current_count(&self) -> u32 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).count
    }
}

/// Keep/drop decision for finished spans.
#[derive(Debug)]
pub struct SpanFilter {
    config: FilterConfig,
    window: ErrorRateWindow,
}

impl SpanFilter {
    pub fn new(config: FilterConfig) -> Self {
        let window = ErrorRateWindow::new(config.error_spans_per_second);
        Self { config, window }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Decides whether `span` should be exported.
    pub fn should_keep(&self, span: &SpanRecord) -> bool {
        self.decide(span, unix_seconds_now(), rand::random::<f64>)
    }

    /// Decision with an explicit clock second and random source.
    ///
    /// `draw` is only invoked when the sampling rule is reached and must return
    /// a value in `[0, 1)`.
    pub fn decide(&self, span: &SpanRecord, now_second: u64, draw: impl FnOnce() -> f64) -> bool {
        if self.config.send_error_spans && span.status.is_error() {
            return self.window.try_acquire(now_second);
        }

        if self.config.slow_threshold_ms > 0 {
            if let Some(duration_ms) = span.duration_ms() {
                if duration_ms > self.config.slow_threshold_ms as f64 {
                    return true;
                }
            }
        }

        if self.config.sample_rate < 1.0 {
            return draw() < self.config.sample_rate;
        }

        true
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
