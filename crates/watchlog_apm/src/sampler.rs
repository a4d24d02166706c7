//! Head sampling for span creation.
//!
//! The host SDK consults this before starting a span; it is not part of the
//! export pipeline. Root spans are sampled by trace id so every service that
//! sees the same trace makes the same decision; child spans follow their
//! parent.

/// Parent-based trace-id ratio sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceIdRatioSampler {
    rate: f64,
    bound: u64,
}

impl TraceIdRatioSampler {
    /// Creates a sampler keeping roughly `rate` of root traces.
    ///
    /// Rates are clamped into `[0, 1]`.
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        let bound = if rate >= 1.0 {
            u64::MAX
        } else {
            (rate * 2f64.powi(64)) as u64
        };
        Self { rate, bound }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Sampling decision for a new span.
    ///
    /// `parent_sampled` is the parent's decision, or `None` for root spans.
    pub fn should_sample(&self, trace_id: u128, parent_sampled: Option<bool>) -> bool {
        match parent_sampled {
            Some(sampled) => sampled,
            None => self.rate >= 1.0 || (trace_id as u64) < self.bound,
        }
    }
}
